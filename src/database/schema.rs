/*!
 * Database schema definitions and migrations.
 *
 * This module contains the SQL schema for all database tables
 * and handles schema migrations for version upgrades.
 */

use anyhow::{Context, Result};
use log::{debug, info};
use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn initialize_schema(conn: &Connection) -> Result<()> {
    // Foreign keys are a per-connection setting
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;

    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Initializing database schema v{}", SCHEMA_VERSION);
        create_all_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!(
            "Migrating database schema from v{} to v{}",
            current_version, SCHEMA_VERSION
        );
        migrate_schema(conn, current_version)?;
    } else {
        debug!("Database schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get the current schema version from the database
fn get_schema_version(conn: &Connection) -> Result<i32> {
    let table_exists: bool = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='schema_version'",
            [],
            |row| row.get(0),
        )
        .context("Failed to check schema_version table existence")?;

    if !table_exists {
        return Ok(0);
    }

    let version: i32 = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .unwrap_or(0);

    Ok(version)
}

/// Set the schema version in the database
fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO schema_version (id, version, updated_at) VALUES (1, ?1, datetime('now'))",
        [version],
    )?;
    Ok(())
}

/// Create all database tables
fn create_all_tables(conn: &Connection) -> Result<()> {
    // WAL keeps readers (queue polling) off the writer's back
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            version INTEGER NOT NULL,
            updated_at TEXT NOT NULL
        );
        "#,
    )?;

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            source TEXT NOT NULL,
            target_language TEXT NOT NULL,
            translate_provider TEXT NOT NULL,
            translate_model TEXT NOT NULL,
            speech_provider TEXT NOT NULL,
            speech_voice TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'idle',
            error_code TEXT,
            error_message TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            started_at TEXT,
            finished_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
        "#,
    )?;

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS stage_runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
            stage TEXT NOT NULL,
            status TEXT NOT NULL,
            started_at TEXT NOT NULL,
            finished_at TEXT,
            duration_ms INTEGER,
            retry_count INTEGER NOT NULL DEFAULT 0,
            error_code TEXT,
            error_message TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_stage_runs_task ON stage_runs(task_id);
        "#,
    )?;

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS segments (
            id TEXT PRIMARY KEY,
            task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
            stage TEXT NOT NULL,
            idx INTEGER NOT NULL,
            source_text TEXT NOT NULL,
            result_text TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            retry_count INTEGER NOT NULL DEFAULT 0,
            error_code TEXT,
            error_message TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(task_id, stage, idx)
        );

        CREATE INDEX IF NOT EXISTS idx_segments_task_stage ON segments(task_id, stage);
        CREATE INDEX IF NOT EXISTS idx_segments_status ON segments(status);
        "#,
    )?;

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS recovery_snapshots (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
            stage TEXT NOT NULL,
            checkpoint_key TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_snapshots_task ON recovery_snapshots(task_id, created_at);
        "#,
    )?;

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS queue_entries (
            task_id TEXT PRIMARY KEY REFERENCES tasks(id) ON DELETE CASCADE,
            batch_id TEXT,
            status TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            queue_index INTEGER,
            enqueued_at TEXT NOT NULL,
            started_at TEXT,
            heartbeat_at TEXT,
            finished_at TEXT,
            worker_slot INTEGER,
            last_error_code TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_queue_status ON queue_entries(status, priority, queue_index);
        "#,
    )?;

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS artifacts (
            task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
            kind TEXT NOT NULL,
            path TEXT NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (task_id, kind)
        );
        "#,
    )?;

    info!("Database schema created successfully");
    Ok(())
}

/// Migrate the schema from one version to another
fn migrate_schema(conn: &Connection, from_version: i32) -> Result<()> {
    if from_version < SCHEMA_VERSION {
        return Err(anyhow::anyhow!(
            "Unknown schema version: {}. Cannot migrate.",
            from_version
        ));
    }

    set_schema_version(conn, SCHEMA_VERSION)?;
    info!("Schema migration completed to v{}", SCHEMA_VERSION);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn create_test_connection() -> Connection {
        Connection::open_in_memory().expect("Failed to create in-memory database")
    }

    #[test]
    fn test_initializeSchema_withFreshDatabase_shouldCreateAllTables() {
        let conn = create_test_connection();

        initialize_schema(&conn).expect("Failed to initialize schema");

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        for table in [
            "tasks",
            "stage_runs",
            "segments",
            "recovery_snapshots",
            "queue_entries",
            "artifacts",
            "schema_version",
        ] {
            assert!(tables.contains(&table.to_string()), "missing table {}", table);
        }
    }

    #[test]
    fn test_initializeSchema_calledTwice_shouldBeIdempotent() {
        let conn = create_test_connection();

        initialize_schema(&conn).expect("First initialization failed");
        initialize_schema(&conn).expect("Second initialization failed");

        let version = get_schema_version(&conn).expect("Failed to get version");
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_segments_duplicateIndex_shouldBeRejected() {
        let conn = create_test_connection();
        initialize_schema(&conn).unwrap();

        conn.execute(
            "INSERT INTO tasks (id, source, target_language, translate_provider, translate_model, speech_provider, speech_voice, created_at, updated_at)
             VALUES ('t1', 'a.mp4', 'fr', 'ollama', 'llama3', 'openai', 'alloy', 'now', 'now')",
            [],
        )
        .unwrap();

        let insert = "INSERT INTO segments (id, task_id, stage, idx, source_text, created_at, updated_at)
                      VALUES (?1, 't1', 'translating', 0, 'hello', 'now', 'now')";
        conn.execute(insert, ["s1"]).unwrap();
        assert!(conn.execute(insert, ["s2"]).is_err());
    }

    #[test]
    fn test_foreignKeys_shouldBeEnabled() {
        let conn = create_test_connection();
        initialize_schema(&conn).expect("Failed to initialize schema");

        let result = conn.execute(
            "INSERT INTO queue_entries (task_id, status, enqueued_at) VALUES ('ghost', 'waiting', 'now')",
            [],
        );

        assert!(result.is_err(), "Foreign key constraint should prevent insert");
    }
}
