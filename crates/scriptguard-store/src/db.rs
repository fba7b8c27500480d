use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scriptguard schema in `conn`.
///
/// Idempotent; safe to call on every startup.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS tasks (
            id                 TEXT    NOT NULL PRIMARY KEY,
            name               TEXT    NOT NULL,
            script_path        TEXT    NOT NULL,
            env                TEXT    NOT NULL,
            cron_expr          TEXT    NOT NULL DEFAULT '',  -- legacy single expression
            cron_exprs         TEXT    NOT NULL DEFAULT '[]', -- JSON array
            enabled            INTEGER NOT NULL DEFAULT 1,
            notify_on_failure  INTEGER NOT NULL DEFAULT 1,
            created_at         TEXT    NOT NULL,
            updated_at         TEXT    NOT NULL
        );

        CREATE TABLE IF NOT EXISTS executions (
            id             TEXT    NOT NULL PRIMARY KEY,
            task_id        TEXT    NOT NULL,
            status         TEXT    NOT NULL,
            start_time     TEXT    NOT NULL,
            end_time       TEXT,               -- NULL while running
            duration_ms    INTEGER NOT NULL DEFAULT 0,
            exit_code      INTEGER NOT NULL DEFAULT 0,
            error_message  TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_executions_task ON executions (task_id, start_time);
        CREATE INDEX IF NOT EXISTS idx_executions_end ON executions (end_time);

        -- seq keeps insertion order for lines that share a millisecond.
        CREATE TABLE IF NOT EXISTS logs (
            seq           INTEGER PRIMARY KEY AUTOINCREMENT,
            id            TEXT    NOT NULL UNIQUE,
            execution_id  TEXT,                -- NULL for run-independent lines
            task_id       TEXT    NOT NULL,
            timestamp     TEXT    NOT NULL,
            level         TEXT    NOT NULL,
            content       TEXT    NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_logs_execution ON logs (execution_id);
        CREATE INDEX IF NOT EXISTS idx_logs_task ON logs (task_id);
        CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs (timestamp);

        CREATE TABLE IF NOT EXISTS config (
            key         TEXT NOT NULL PRIMARY KEY,
            value       TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );
        ",
    )?;
    Ok(())
}
