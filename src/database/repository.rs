/*!
 * Repository layer for database operations.
 *
 * This module provides a high-level API for all database operations,
 * abstracting away the SQL details and providing type-safe access.
 */

use anyhow::Result;
use log::debug;
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::connection::DatabaseConnection;
use super::models::{
    ArtifactKind, ArtifactRecord, QueueEntryRecord, QueueStatus, RecoverySnapshotRecord,
    SegmentRecord, SegmentStatus, StageRunRecord, StageRunStatus, TaskRecord, TaskStatus,
    format_timestamp, now_timestamp, parse_timestamp,
};

/// Optional field updates applied together with a queue status change
#[derive(Debug, Clone, Default)]
pub struct QueueStatusPatch {
    /// Worker slot that owns a running entry
    pub worker_slot: Option<i64>,
    /// Error code to remember on the entry
    pub last_error_code: Option<String>,
    /// Explicit heartbeat timestamp (defaults to now when entering `running`)
    pub heartbeat_at: Option<String>,
}

/// Result of a queue status update
#[derive(Debug, Clone)]
pub enum QueueUpdate {
    /// The entry was updated
    Updated(QueueEntryRecord),
    /// No entry exists for the task
    NotFound,
    /// Another entry is already running
    Busy(String),
}

const TASK_COLUMNS: &str = "id, source, target_language, translate_provider, translate_model, \
     speech_provider, speech_voice, status, error_code, error_message, \
     created_at, updated_at, started_at, finished_at";

const SEGMENT_COLUMNS: &str = "id, task_id, stage, idx, source_text, result_text, status, \
     retry_count, error_code, error_message, created_at, updated_at";

const QUEUE_COLUMNS: &str = "task_id, batch_id, status, priority, queue_index, enqueued_at, \
     started_at, heartbeat_at, finished_at, worker_slot, last_error_code";

/// Segments are listed translate-stage first, then by position
const SEGMENT_ORDER: &str =
    "ORDER BY CASE stage WHEN 'translating' THEN 0 ELSE 1 END, idx ASC";

/// Repository for database operations
#[derive(Clone)]
pub struct Repository {
    /// Database connection
    db: DatabaseConnection,
}

impl Repository {
    /// Create a new repository with the given database connection
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Create a repository with an in-memory database (for testing)
    pub fn new_in_memory() -> Result<Self> {
        let db = DatabaseConnection::new_in_memory()?;
        Ok(Self::new(db))
    }

    /// Underlying connection
    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    // =========================================================================
    // Row mapping
    // =========================================================================

    fn task_from_row(row: &Row) -> rusqlite::Result<TaskRecord> {
        Ok(TaskRecord {
            id: row.get(0)?,
            source: row.get(1)?,
            target_language: row.get(2)?,
            translate_provider: row.get(3)?,
            translate_model: row.get(4)?,
            speech_provider: row.get(5)?,
            speech_voice: row.get(6)?,
            status: row
                .get::<_, String>(7)?
                .parse()
                .unwrap_or(TaskStatus::Failed),
            error_code: row.get(8)?,
            error_message: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
            started_at: row.get(12)?,
            finished_at: row.get(13)?,
        })
    }

    fn segment_from_row(row: &Row) -> rusqlite::Result<SegmentRecord> {
        Ok(SegmentRecord {
            id: row.get(0)?,
            task_id: row.get(1)?,
            stage: row.get(2)?,
            idx: row.get(3)?,
            source_text: row.get(4)?,
            result_text: row.get(5)?,
            status: row
                .get::<_, String>(6)?
                .parse()
                .unwrap_or(SegmentStatus::Pending),
            retry_count: row.get(7)?,
            error_code: row.get(8)?,
            error_message: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn stage_run_from_row(row: &Row) -> rusqlite::Result<StageRunRecord> {
        Ok(StageRunRecord {
            id: row.get(0)?,
            task_id: row.get(1)?,
            stage: row.get(2)?,
            status: row
                .get::<_, String>(3)?
                .parse()
                .unwrap_or(StageRunStatus::Failed),
            started_at: row.get(4)?,
            finished_at: row.get(5)?,
            duration_ms: row.get(6)?,
            retry_count: row.get(7)?,
            error_code: row.get(8)?,
            error_message: row.get(9)?,
        })
    }

    fn snapshot_from_row(row: &Row) -> rusqlite::Result<RecoverySnapshotRecord> {
        Ok(RecoverySnapshotRecord {
            id: row.get(0)?,
            task_id: row.get(1)?,
            stage: row.get(2)?,
            checkpoint_key: row.get(3)?,
            payload: row.get(4)?,
            created_at: row.get(5)?,
        })
    }

    fn queue_entry_from_row(row: &Row) -> rusqlite::Result<QueueEntryRecord> {
        Ok(QueueEntryRecord {
            task_id: row.get(0)?,
            batch_id: row.get(1)?,
            status: row
                .get::<_, String>(2)?
                .parse()
                .unwrap_or(QueueStatus::Removed),
            priority: row.get(3)?,
            queue_index: row.get(4)?,
            enqueued_at: row.get(5)?,
            started_at: row.get(6)?,
            heartbeat_at: row.get(7)?,
            finished_at: row.get(8)?,
            worker_slot: row.get(9)?,
            last_error_code: row.get(10)?,
        })
    }

    // =========================================================================
    // Task Operations
    // =========================================================================

    /// Create a new task
    pub async fn create_task(&self, task: &TaskRecord) -> Result<()> {
        let task = task.clone();

        self.db
            .execute_async(move |conn| {
                conn.execute(
                    &format!(
                        "INSERT INTO tasks ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                        TASK_COLUMNS
                    ),
                    params![
                        task.id,
                        task.source,
                        task.target_language,
                        task.translate_provider,
                        task.translate_model,
                        task.speech_provider,
                        task.speech_voice,
                        task.status.as_str(),
                        task.error_code,
                        task.error_message,
                        task.created_at,
                        task.updated_at,
                        task.started_at,
                        task.finished_at,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Get a task by ID
    pub async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        let task_id = task_id.to_string();

        self.db
            .execute_async(move |conn| {
                let task = conn
                    .query_row(
                        &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
                        [&task_id],
                        Self::task_from_row,
                    )
                    .optional()?;
                Ok(task)
            })
            .await
    }

    /// List tasks, newest first, optionally filtered by status
    pub async fn list_tasks(&self, status_filter: Option<TaskStatus>) -> Result<Vec<TaskRecord>> {
        self.db
            .execute_async(move |conn| {
                let tasks = match status_filter {
                    Some(status) => {
                        let mut stmt = conn.prepare(&format!(
                            "SELECT {} FROM tasks WHERE status = ?1 ORDER BY created_at DESC",
                            TASK_COLUMNS
                        ))?;
                        stmt.query_map([status.as_str()], Self::task_from_row)?
                            .collect::<rusqlite::Result<Vec<_>>>()?
                    }
                    None => {
                        let mut stmt = conn.prepare(&format!(
                            "SELECT {} FROM tasks ORDER BY created_at DESC",
                            TASK_COLUMNS
                        ))?;
                        stmt.query_map([], Self::task_from_row)?
                            .collect::<rusqlite::Result<Vec<_>>>()?
                    }
                };
                Ok(tasks)
            })
            .await
    }

    /// Update a task's status
    ///
    /// Entering `queued` clears the previous error and stamps `started_at`;
    /// entering a terminal status stamps `finished_at`. The error fields are
    /// only written when an error is given.
    pub async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        error: Option<(String, String)>,
    ) -> Result<()> {
        let task_id = task_id.to_string();
        let now = now_timestamp();

        self.db
            .execute_async(move |conn| {
                let (error_code, error_message) = match error {
                    Some((code, message)) => (Some(code), Some(message)),
                    None => (None, None),
                };

                if status == TaskStatus::Queued {
                    conn.execute(
                        r#"
                        UPDATE tasks
                        SET status = ?1, updated_at = ?2, started_at = ?2, finished_at = NULL,
                            error_code = NULL, error_message = NULL
                        WHERE id = ?3
                        "#,
                        params![status.as_str(), now, task_id],
                    )?;
                } else {
                    let finished_at = status.is_terminal().then(|| now.clone());
                    conn.execute(
                        r#"
                        UPDATE tasks
                        SET status = ?1, updated_at = ?2,
                            finished_at = COALESCE(?3, finished_at),
                            error_code = COALESCE(?4, error_code),
                            error_message = COALESCE(?5, error_message)
                        WHERE id = ?6
                        "#,
                        params![
                            status.as_str(),
                            now,
                            finished_at,
                            error_code,
                            error_message,
                            task_id
                        ],
                    )?;
                }
                Ok(())
            })
            .await
    }

    // =========================================================================
    // Stage Run Operations
    // =========================================================================

    /// Record the start of a stage attempt and return its row id
    pub async fn start_stage_run(&self, task_id: &str, stage: &str) -> Result<i64> {
        let task_id = task_id.to_string();
        let stage = stage.to_string();
        let now = now_timestamp();

        self.db
            .execute_async(move |conn| {
                conn.execute(
                    "INSERT INTO stage_runs (task_id, stage, status, started_at) VALUES (?1, ?2, ?3, ?4)",
                    params![task_id, stage, StageRunStatus::Running.as_str(), now],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
    }

    /// Close a stage attempt, computing its duration
    pub async fn finish_stage_run(
        &self,
        run_id: i64,
        status: StageRunStatus,
        retry_count: i64,
        error: Option<(String, String)>,
    ) -> Result<()> {
        let finished = chrono::Utc::now();
        let finished_at = format_timestamp(finished);

        self.db
            .execute_async(move |conn| {
                let started_at: String = conn.query_row(
                    "SELECT started_at FROM stage_runs WHERE id = ?1",
                    [run_id],
                    |row| row.get(0),
                )?;
                let duration_ms = parse_timestamp(&started_at)
                    .map(|start| (finished - start).num_milliseconds().max(0));
                let (error_code, error_message) = match error {
                    Some((code, message)) => (Some(code), Some(message)),
                    None => (None, None),
                };

                conn.execute(
                    r#"
                    UPDATE stage_runs
                    SET status = ?1, finished_at = ?2, duration_ms = ?3, retry_count = ?4,
                        error_code = ?5, error_message = ?6
                    WHERE id = ?7
                    "#,
                    params![
                        status.as_str(),
                        finished_at,
                        duration_ms,
                        retry_count,
                        error_code,
                        error_message,
                        run_id
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// List stage attempts for a task in execution order
    pub async fn list_stage_runs(&self, task_id: &str) -> Result<Vec<StageRunRecord>> {
        let task_id = task_id.to_string();

        self.db
            .execute_async(move |conn| {
                let mut stmt = conn.prepare(
                    r#"
                    SELECT id, task_id, stage, status, started_at, finished_at, duration_ms,
                           retry_count, error_code, error_message
                    FROM stage_runs WHERE task_id = ?1 ORDER BY id ASC
                    "#,
                )?;
                let runs = stmt
                    .query_map([&task_id], Self::stage_run_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(runs)
            })
            .await
    }

    // =========================================================================
    // Segment Operations
    // =========================================================================

    /// List segments of a task, optionally restricted to one stage
    pub async fn list_segments(
        &self,
        task_id: &str,
        stage: Option<&str>,
    ) -> Result<Vec<SegmentRecord>> {
        let task_id = task_id.to_string();
        let stage = stage.map(str::to_string);

        self.db
            .execute_async(move |conn| {
                let segments = match stage {
                    Some(stage) => {
                        let mut stmt = conn.prepare(&format!(
                            "SELECT {} FROM segments WHERE task_id = ?1 AND stage = ?2 {}",
                            SEGMENT_COLUMNS, SEGMENT_ORDER
                        ))?;
                        stmt.query_map(params![task_id, stage], Self::segment_from_row)?
                            .collect::<rusqlite::Result<Vec<_>>>()?
                    }
                    None => {
                        let mut stmt = conn.prepare(&format!(
                            "SELECT {} FROM segments WHERE task_id = ?1 {}",
                            SEGMENT_COLUMNS, SEGMENT_ORDER
                        ))?;
                        stmt.query_map([&task_id], Self::segment_from_row)?
                            .collect::<rusqlite::Result<Vec<_>>>()?
                    }
                };
                Ok(segments)
            })
            .await
    }

    /// List failed segments of a task across stages
    pub async fn list_failed_segments(&self, task_id: &str) -> Result<Vec<SegmentRecord>> {
        let task_id = task_id.to_string();

        self.db
            .execute_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM segments WHERE task_id = ?1 AND status = 'failed' {}",
                    SEGMENT_COLUMNS, SEGMENT_ORDER
                ))?;
                let segments = stmt
                    .query_map([&task_id], Self::segment_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(segments)
            })
            .await
    }

    /// Get the segments with the given ids that belong to the task
    pub async fn get_segments_by_ids(
        &self,
        task_id: &str,
        segment_ids: &[String],
    ) -> Result<Vec<SegmentRecord>> {
        let all = self.list_segments(task_id, None).await?;
        Ok(all
            .into_iter()
            .filter(|s| segment_ids.contains(&s.id))
            .collect())
    }

    /// Replace a stage's segment set wholesale
    pub async fn replace_segments(
        &self,
        task_id: &str,
        stage: &str,
        segments: Vec<SegmentRecord>,
    ) -> Result<()> {
        let task_id = task_id.to_string();
        let stage = stage.to_string();

        self.db
            .transaction_async(move |tx| {
                let removed = tx.execute(
                    "DELETE FROM segments WHERE task_id = ?1 AND stage = ?2",
                    params![task_id, stage],
                )?;

                {
                    let mut stmt = tx.prepare(&format!(
                        "INSERT INTO segments ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                        SEGMENT_COLUMNS
                    ))?;
                    for segment in &segments {
                        stmt.execute(params![
                            segment.id,
                            segment.task_id,
                            segment.stage,
                            segment.idx,
                            segment.source_text,
                            segment.result_text,
                            segment.status.as_str(),
                            segment.retry_count,
                            segment.error_code,
                            segment.error_message,
                            segment.created_at,
                            segment.updated_at,
                        ])?;
                    }
                }

                debug!(
                    "Replaced {} {} segments with {} for task {}",
                    removed,
                    stage,
                    segments.len(),
                    task_id
                );
                Ok(())
            })
            .await
    }

    /// Persist a segment's mutable state
    pub async fn update_segment(&self, segment: &SegmentRecord) -> Result<()> {
        let segment = segment.clone();
        let now = now_timestamp();

        self.db
            .execute_async(move |conn| {
                conn.execute(
                    r#"
                    UPDATE segments
                    SET result_text = ?1, status = ?2, retry_count = ?3,
                        error_code = ?4, error_message = ?5, updated_at = ?6
                    WHERE id = ?7
                    "#,
                    params![
                        segment.result_text,
                        segment.status.as_str(),
                        segment.retry_count,
                        segment.error_code,
                        segment.error_message,
                        now,
                        segment.id
                    ],
                )?;
                Ok(())
            })
            .await
    }

    // =========================================================================
    // Recovery Snapshot Operations
    // =========================================================================

    /// Append a recovery snapshot
    pub async fn insert_snapshot(
        &self,
        task_id: &str,
        stage: &str,
        checkpoint_key: &str,
        payload: &str,
    ) -> Result<i64> {
        let task_id = task_id.to_string();
        let stage = stage.to_string();
        let checkpoint_key = checkpoint_key.to_string();
        let payload = payload.to_string();
        let now = now_timestamp();

        self.db
            .execute_async(move |conn| {
                conn.execute(
                    r#"
                    INSERT INTO recovery_snapshots (task_id, stage, checkpoint_key, payload, created_at)
                    VALUES (?1, ?2, ?3, ?4, ?5)
                    "#,
                    params![task_id, stage, checkpoint_key, payload, now],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
    }

    /// Most recent snapshot by time, then id
    pub async fn latest_snapshot(&self, task_id: &str) -> Result<Option<RecoverySnapshotRecord>> {
        let task_id = task_id.to_string();

        self.db
            .execute_async(move |conn| {
                let snapshot = conn
                    .query_row(
                        r#"
                        SELECT id, task_id, stage, checkpoint_key, payload, created_at
                        FROM recovery_snapshots
                        WHERE task_id = ?1
                        ORDER BY created_at DESC, id DESC
                        LIMIT 1
                        "#,
                        [&task_id],
                        Self::snapshot_from_row,
                    )
                    .optional()?;
                Ok(snapshot)
            })
            .await
    }

    // =========================================================================
    // Artifact Operations
    // =========================================================================

    /// Record (or overwrite) the artifact of a kind for a task
    pub async fn put_artifact(&self, task_id: &str, kind: ArtifactKind, path: &str) -> Result<()> {
        let task_id = task_id.to_string();
        let path = path.to_string();
        let now = now_timestamp();

        self.db
            .execute_async(move |conn| {
                conn.execute(
                    r#"
                    INSERT INTO artifacts (task_id, kind, path, created_at) VALUES (?1, ?2, ?3, ?4)
                    ON CONFLICT(task_id, kind) DO UPDATE SET path = excluded.path, created_at = excluded.created_at
                    "#,
                    params![task_id, kind.as_str(), path, now],
                )?;
                Ok(())
            })
            .await
    }

    /// Get the artifact of a kind for a task
    pub async fn get_artifact(
        &self,
        task_id: &str,
        kind: ArtifactKind,
    ) -> Result<Option<ArtifactRecord>> {
        let task_id = task_id.to_string();

        self.db
            .execute_async(move |conn| {
                let artifact = conn
                    .query_row(
                        "SELECT task_id, kind, path, created_at FROM artifacts WHERE task_id = ?1 AND kind = ?2",
                        params![task_id, kind.as_str()],
                        |row| {
                            Ok(ArtifactRecord {
                                task_id: row.get(0)?,
                                kind: row.get::<_, String>(1)?.parse().unwrap_or(kind),
                                path: row.get(2)?,
                                created_at: row.get(3)?,
                            })
                        },
                    )
                    .optional()?;
                Ok(artifact)
            })
            .await
    }

    // =========================================================================
    // Queue Operations
    // =========================================================================

    fn get_queue_entry_sync(conn: &Connection, task_id: &str) -> Result<Option<QueueEntryRecord>> {
        let entry = conn
            .query_row(
                &format!("SELECT {} FROM queue_entries WHERE task_id = ?1", QUEUE_COLUMNS),
                [task_id],
                Self::queue_entry_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    fn waiting_count_sync(conn: &Connection) -> Result<i64> {
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM queue_entries WHERE status = 'waiting'",
            [],
            |row| row.get(0),
        )?)
    }

    /// Renumber waiting entries 0..n-1 in their current order
    fn reindex_waiting_sync(conn: &Connection) -> Result<()> {
        let ids: Vec<String> = {
            let mut stmt = conn.prepare(
                "SELECT task_id FROM queue_entries WHERE status = 'waiting' ORDER BY queue_index ASC, enqueued_at ASC",
            )?;
            stmt.query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?
        };
        Self::write_waiting_order_sync(conn, &ids)
    }

    fn write_waiting_order_sync(conn: &Connection, ordered_ids: &[String]) -> Result<()> {
        let mut stmt =
            conn.prepare("UPDATE queue_entries SET queue_index = ?1 WHERE task_id = ?2")?;
        for (index, task_id) in ordered_ids.iter().enumerate() {
            stmt.execute(params![index as i64, task_id])?;
        }
        Ok(())
    }

    /// Get the queue entry of a task
    pub async fn get_queue_entry(&self, task_id: &str) -> Result<Option<QueueEntryRecord>> {
        let task_id = task_id.to_string();
        self.db
            .execute_async(move |conn| Self::get_queue_entry_sync(conn, &task_id))
            .await
    }

    /// Append a task to the waiting tail
    ///
    /// Returns `None` when the task is already waiting or running. A task whose
    /// previous entry finished is re-entered at the tail.
    pub async fn enqueue_entry(
        &self,
        task_id: &str,
        batch_id: Option<&str>,
        priority: i64,
    ) -> Result<Option<QueueEntryRecord>> {
        let task_id = task_id.to_string();
        let batch_id = batch_id.map(str::to_string);
        let now = now_timestamp();

        self.db
            .transaction_async(move |tx| {
                if let Some(existing) = Self::get_queue_entry_sync(tx, &task_id)? {
                    if !existing.status.is_terminal() {
                        return Ok(None);
                    }
                }

                let index = Self::waiting_count_sync(tx)?;
                tx.execute(
                    r#"
                    INSERT INTO queue_entries (task_id, batch_id, status, priority, queue_index, enqueued_at)
                    VALUES (?1, ?2, 'waiting', ?3, ?4, ?5)
                    ON CONFLICT(task_id) DO UPDATE SET
                        batch_id = excluded.batch_id, status = 'waiting', priority = excluded.priority,
                        queue_index = excluded.queue_index, enqueued_at = excluded.enqueued_at,
                        started_at = NULL, heartbeat_at = NULL, finished_at = NULL,
                        worker_slot = NULL, last_error_code = NULL
                    "#,
                    params![task_id, batch_id, priority, index, now],
                )?;

                Self::get_queue_entry_sync(tx, &task_id)
            })
            .await
    }

    /// List queue entries with a status, in that status's display order
    pub async fn list_queue_entries(&self, status: QueueStatus) -> Result<Vec<QueueEntryRecord>> {
        self.db
            .execute_async(move |conn| {
                let order = match status {
                    QueueStatus::Waiting => "queue_index ASC",
                    QueueStatus::Running => "started_at ASC",
                    _ => "finished_at DESC",
                };
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM queue_entries WHERE status = ?1 ORDER BY {}",
                    QUEUE_COLUMNS, order
                ))?;
                let entries = stmt
                    .query_map([status.as_str()], Self::queue_entry_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(entries)
            })
            .await
    }

    /// Every queue entry, read in one statement
    pub async fn list_all_queue_entries(&self) -> Result<Vec<QueueEntryRecord>> {
        self.db
            .execute_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM queue_entries ORDER BY queue_index ASC, started_at ASC, finished_at DESC",
                    QUEUE_COLUMNS
                ))?;
                let entries = stmt
                    .query_map([], Self::queue_entry_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(entries)
            })
            .await
    }

    /// Waiting entries by priority descending, then queue index ascending
    pub async fn next_waiting_entries(&self, limit: usize) -> Result<Vec<QueueEntryRecord>> {
        self.db
            .execute_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM queue_entries WHERE status = 'waiting' ORDER BY priority DESC, queue_index ASC LIMIT ?1",
                    QUEUE_COLUMNS
                ))?;
                let entries = stmt
                    .query_map([limit as i64], Self::queue_entry_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(entries)
            })
            .await
    }

    /// Transition a queue entry, keeping waiting indices dense
    pub async fn update_queue_status(
        &self,
        task_id: &str,
        status: QueueStatus,
        patch: QueueStatusPatch,
    ) -> Result<QueueUpdate> {
        let task_id = task_id.to_string();
        let now = now_timestamp();

        self.db
            .transaction_async(move |tx| {
                let Some(entry) = Self::get_queue_entry_sync(tx, &task_id)? else {
                    return Ok(QueueUpdate::NotFound);
                };

                if status == QueueStatus::Running && entry.status != QueueStatus::Running {
                    let other: Option<String> = tx
                        .query_row(
                            "SELECT task_id FROM queue_entries WHERE status = 'running' AND task_id != ?1 LIMIT 1",
                            [&task_id],
                            |row| row.get(0),
                        )
                        .optional()?;
                    if let Some(other) = other {
                        return Ok(QueueUpdate::Busy(other));
                    }
                }

                let last_error_code = patch.last_error_code.or(entry.last_error_code.clone());
                let mut next = entry.clone();
                next.status = status;
                next.last_error_code = last_error_code;

                match status {
                    QueueStatus::Running => {
                        next.queue_index = None;
                        next.started_at = entry.started_at.clone().or(Some(now.clone()));
                        next.heartbeat_at = patch
                            .heartbeat_at
                            .or(entry.heartbeat_at.clone())
                            .or(Some(now.clone()));
                        next.finished_at = None;
                        next.worker_slot = patch.worker_slot.or(entry.worker_slot);
                    }
                    QueueStatus::Waiting => {
                        if entry.status != QueueStatus::Waiting {
                            next.queue_index = Some(Self::waiting_count_sync(tx)?);
                        }
                        next.started_at = None;
                        next.heartbeat_at = None;
                        next.finished_at = None;
                        next.worker_slot = None;
                    }
                    QueueStatus::Completed | QueueStatus::Failed | QueueStatus::Removed => {
                        next.queue_index = None;
                        next.finished_at = Some(now.clone());
                        if let Some(heartbeat) = patch.heartbeat_at {
                            next.heartbeat_at = Some(heartbeat);
                        }
                    }
                }

                tx.execute(
                    r#"
                    UPDATE queue_entries
                    SET status = ?1, queue_index = ?2, started_at = ?3, heartbeat_at = ?4,
                        finished_at = ?5, worker_slot = ?6, last_error_code = ?7
                    WHERE task_id = ?8
                    "#,
                    params![
                        next.status.as_str(),
                        next.queue_index,
                        next.started_at,
                        next.heartbeat_at,
                        next.finished_at,
                        next.worker_slot,
                        next.last_error_code,
                        task_id
                    ],
                )?;

                Self::reindex_waiting_sync(tx)?;
                let updated = Self::get_queue_entry_sync(tx, &task_id)?.unwrap_or(next);
                Ok(QueueUpdate::Updated(updated))
            })
            .await
    }

    /// Refresh the heartbeat of a running entry
    pub async fn touch_heartbeat(&self, task_id: &str) -> Result<bool> {
        let task_id = task_id.to_string();
        let now = now_timestamp();

        self.db
            .execute_async(move |conn| {
                let updated = conn.execute(
                    "UPDATE queue_entries SET heartbeat_at = ?1 WHERE task_id = ?2 AND status = 'running'",
                    params![now, task_id],
                )?;
                Ok(updated > 0)
            })
            .await
    }

    /// Move a waiting entry to a new position
    ///
    /// Returns the reindexed waiting list, or `None` when the task is not waiting.
    pub async fn reorder_waiting(
        &self,
        task_id: &str,
        to_index: i64,
    ) -> Result<Option<Vec<QueueEntryRecord>>> {
        let task_id = task_id.to_string();

        self.db
            .transaction_async(move |tx| {
                let mut ids: Vec<String> = {
                    let mut stmt = tx.prepare(
                        "SELECT task_id FROM queue_entries WHERE status = 'waiting' ORDER BY queue_index ASC, enqueued_at ASC",
                    )?;
                    stmt.query_map([], |row| row.get(0))?
                        .collect::<rusqlite::Result<Vec<_>>>()?
                };

                let Some(position) = ids.iter().position(|id| *id == task_id) else {
                    return Ok(None);
                };
                let moved = ids.remove(position);
                let target = to_index.clamp(0, ids.len() as i64) as usize;
                ids.insert(target, moved);

                Self::write_waiting_order_sync(tx, &ids)?;

                let mut stmt = tx.prepare(&format!(
                    "SELECT {} FROM queue_entries WHERE status = 'waiting' ORDER BY queue_index ASC",
                    QUEUE_COLUMNS
                ))?;
                let entries = stmt
                    .query_map([], Self::queue_entry_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(Some(entries))
            })
            .await
    }

    /// Move entries to the waiting tail in the given order, clearing run fields
    ///
    /// Returns the ids that had an entry.
    pub async fn requeue_entries(&self, task_ids: &[String]) -> Result<Vec<String>> {
        let task_ids = task_ids.to_vec();

        self.db
            .transaction_async(move |tx| {
                let mut moved = Vec::new();
                for task_id in &task_ids {
                    if Self::get_queue_entry_sync(tx, task_id)?.is_none() {
                        continue;
                    }
                    // Counting includes the entry itself when it is already waiting,
                    // which still lands it past every other waiting entry.
                    let index = Self::waiting_count_sync(tx)?;
                    tx.execute(
                        r#"
                        UPDATE queue_entries
                        SET status = 'waiting', queue_index = ?1, started_at = NULL,
                            heartbeat_at = NULL, finished_at = NULL, worker_slot = NULL
                        WHERE task_id = ?2
                        "#,
                        params![index, task_id],
                    )?;
                    Self::reindex_waiting_sync(tx)?;
                    moved.push(task_id.clone());
                }
                Ok(moved)
            })
            .await
    }
}
