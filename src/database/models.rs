/*!
 * Database entity models and DTOs.
 *
 * These structures map directly to database tables and provide
 * type-safe access to persisted data.
 */

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Current time as a sortable RFC 3339 timestamp (UTC, millisecond precision)
pub fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

/// Format a time the same way every persisted timestamp is formatted
pub fn format_timestamp(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a persisted timestamp
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Implements Display/FromStr for a snake_case string enum
macro_rules! string_enum {
    ($name:ident, $label:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Persisted string form
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = anyhow::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.to_lowercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    _ => Err(anyhow::anyhow!(concat!("Invalid ", $label, ": {}"), s)),
                }
            }
        }
    };
}

/// Lifecycle status of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Idle,
    Queued,
    Downloading,
    Extracting,
    Transcribing,
    Translating,
    Synthesizing,
    Merging,
    Completed,
    Failed,
    Canceled,
}

string_enum!(TaskStatus, "task status", {
    Idle => "idle",
    Queued => "queued",
    Downloading => "downloading",
    Extracting => "extracting",
    Transcribing => "transcribing",
    Translating => "translating",
    Synthesizing => "synthesizing",
    Merging => "merging",
    Completed => "completed",
    Failed => "failed",
    Canceled => "canceled",
});

impl TaskStatus {
    /// Whether the task is queued for or inside a pipeline run
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            TaskStatus::Queued
                | TaskStatus::Downloading
                | TaskStatus::Extracting
                | TaskStatus::Transcribing
                | TaskStatus::Translating
                | TaskStatus::Synthesizing
                | TaskStatus::Merging
        )
    }

    /// Whether the task reached an end state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Canceled
        )
    }
}

/// Status of one stage attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageRunStatus {
    Running,
    Success,
    Failed,
    Skipped,
}

string_enum!(StageRunStatus, "stage run status", {
    Running => "running",
    Success => "success",
    Failed => "failed",
    Skipped => "skipped",
});

/// Status of one segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentStatus {
    Pending,
    Running,
    Success,
    Failed,
}

string_enum!(SegmentStatus, "segment status", {
    Pending => "pending",
    Running => "running",
    Success => "success",
    Failed => "failed",
});

/// Status of a queue entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Waiting,
    Running,
    Completed,
    Failed,
    Removed,
}

string_enum!(QueueStatus, "queue status", {
    Waiting => "waiting",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
    Removed => "removed",
});

impl QueueStatus {
    /// Whether the entry left the backlog for good
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueueStatus::Completed | QueueStatus::Failed | QueueStatus::Removed
        )
    }
}

/// Kind of file a stage hands to later stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    SourceMedia,
    Audio,
    Transcript,
    Translation,
    SpeechManifest,
    Output,
}

string_enum!(ArtifactKind, "artifact kind", {
    SourceMedia => "source_media",
    Audio => "audio",
    Transcript => "transcript",
    Translation => "translation",
    SpeechManifest => "speech_manifest",
    Output => "output",
});

/// Task record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Unique task identifier (UUID)
    pub id: String,
    /// URL or local path of the source media
    pub source: String,
    /// Target language code
    pub target_language: String,
    /// Translation provider name
    pub translate_provider: String,
    /// Translation model name
    pub translate_model: String,
    /// Speech provider name
    pub speech_provider: String,
    /// Voice used for synthesis
    pub speech_voice: String,
    /// Current status
    pub status: TaskStatus,
    /// Error code of the last failure
    pub error_code: Option<String>,
    /// Error message of the last failure
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

impl TaskRecord {
    /// Create a new idle task record
    pub fn new(
        id: String,
        source: String,
        target_language: String,
        translate_provider: String,
        translate_model: String,
        speech_provider: String,
        speech_voice: String,
    ) -> Self {
        let now = now_timestamp();
        Self {
            id,
            source,
            target_language,
            translate_provider,
            translate_model,
            speech_provider,
            speech_voice,
            status: TaskStatus::Idle,
            error_code: None,
            error_message: None,
            created_at: now.clone(),
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }
}

/// One attempt of one stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRunRecord {
    /// Database ID
    pub id: i64,
    pub task_id: String,
    /// Stage name (e.g. "translating")
    pub stage: String,
    pub status: StageRunStatus,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub duration_ms: Option<i64>,
    pub retry_count: i64,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

/// A unit of work inside the translate or synthesize stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentRecord {
    /// Segment identifier (UUID)
    pub id: String,
    pub task_id: String,
    pub stage: String,
    /// Zero-based position within (task, stage)
    pub idx: i64,
    pub source_text: String,
    /// Translated text or synthesized audio path
    pub result_text: Option<String>,
    pub status: SegmentStatus,
    pub retry_count: i64,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl SegmentRecord {
    /// Create a new pending segment record
    pub fn new(id: String, task_id: String, stage: String, idx: i64, source_text: String) -> Self {
        let now = now_timestamp();
        Self {
            id,
            task_id,
            stage,
            idx,
            source_text,
            result_text: None,
            status: SegmentStatus::Pending,
            retry_count: 0,
            error_code: None,
            error_message: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }
}

/// Append-only checkpoint row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverySnapshotRecord {
    /// Database ID
    pub id: i64,
    pub task_id: String,
    pub stage: String,
    /// Identifies the last completed segment and the config hash in effect
    pub checkpoint_key: String,
    /// Opaque JSON payload
    pub payload: String,
    pub created_at: String,
}

/// A task's position and lifecycle within the backlog
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntryRecord {
    pub task_id: String,
    pub batch_id: Option<String>,
    pub status: QueueStatus,
    /// Higher runs first
    pub priority: i64,
    /// Dense position among waiting entries, None otherwise
    pub queue_index: Option<i64>,
    pub enqueued_at: String,
    pub started_at: Option<String>,
    pub heartbeat_at: Option<String>,
    pub finished_at: Option<String>,
    pub worker_slot: Option<i64>,
    pub last_error_code: Option<String>,
}

impl QueueEntryRecord {
    /// Most recent sign of life: heartbeat, then start, then enqueue
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        [
            self.heartbeat_at.as_deref(),
            self.started_at.as_deref(),
            Some(self.enqueued_at.as_str()),
        ]
        .into_iter()
        .flatten()
        .filter_map(parse_timestamp)
        .max()
    }
}

/// A file produced by a stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub task_id: String,
    pub kind: ArtifactKind,
    pub path: String,
    pub created_at: String,
}
