use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, FixedOffset};
use rusqlite::{params, Connection, OptionalExtension, Row};
use scriptguard_core::{
    format_timestamp, Execution, ExecutionId, ExecutionStatus, LogEntry, LogLevel, SharedClock,
    Task, TaskId,
};
use tracing::{info, warn};

use crate::db::init_db;
use crate::error::{Result, StoreError};

/// Hard cap on rows returned by list queries.
pub const MAX_QUERY_LIMIT: usize = 5000;

/// Which log entries a query should return.
#[derive(Debug, Clone, Copy)]
pub enum LogFilter<'a> {
    All,
    Execution(&'a ExecutionId),
    Task(&'a TaskId),
}

/// Rows removed by a retention pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub logs: usize,
    pub executions: usize,
}

/// Persistence collaborator consumed by the scheduler, runner and service
/// layer.
pub trait Store: Send + Sync {
    fn insert_task(&self, task: &Task) -> Result<()>;
    /// Overwrite every column of an existing task.
    fn save_task(&self, task: &Task) -> Result<()>;
    fn get_task(&self, id: &TaskId) -> Result<Task>;
    fn list_tasks(&self) -> Result<Vec<Task>>;
    fn list_enabled_tasks(&self) -> Result<Vec<Task>>;
    fn delete_task(&self, id: &TaskId) -> Result<()>;

    fn insert_execution(&self, execution: &Execution) -> Result<()>;
    /// Newest first. `limit` is clamped to `1..=MAX_QUERY_LIMIT`.
    fn list_executions(&self, task_id: Option<&TaskId>, limit: usize) -> Result<Vec<Execution>>;

    fn insert_log(&self, entry: &LogEntry) -> Result<()>;
    /// Insert a batch in one transaction.
    fn insert_logs(&self, entries: &[LogEntry]) -> Result<()>;
    /// The newest `limit` matching entries, returned oldest first.
    fn list_logs(&self, filter: LogFilter<'_>, limit: usize) -> Result<Vec<LogEntry>>;

    fn get_config(&self, key: &str) -> Result<Option<String>>;
    fn set_config(&self, key: &str, value: &str) -> Result<()>;
    fn all_config(&self) -> Result<BTreeMap<String, String>>;
    /// Insert each pair whose key is absent. Existing values are untouched.
    fn seed_config(&self, defaults: &[(&str, String)]) -> Result<()>;

    /// Delete log entries older than `cutoff` and finished executions that
    /// ended before it.
    fn purge_before(&self, cutoff: DateTime<FixedOffset>) -> Result<PurgeReport>;
    fn vacuum(&self) -> Result<()>;
}

/// SQLite-backed [`Store`].
///
/// One connection behind a mutex: SQLite serialises writers anyway and a
/// single handle avoids `database is locked` churn.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    clock: SharedClock,
}

impl SqliteStore {
    /// Open (or create) the database file at `path`, creating parent
    /// directories as needed.
    pub fn open(path: impl AsRef<Path>, clock: SharedClock) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
        info!(path = %path.display(), "opened SQLite database");
        Self::new(conn, clock)
    }

    pub fn open_in_memory(clock: SharedClock) -> Result<Self> {
        Self::new(Connection::open_in_memory()?, clock)
    }

    pub fn new(conn: Connection, clock: SharedClock) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            clock,
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn clamp_limit(limit: usize) -> i64 {
    if limit == 0 || limit > MAX_QUERY_LIMIT {
        MAX_QUERY_LIMIT as i64
    } else {
        limit as i64
    }
}

fn parse_ts(kind: &'static str, id: &str, raw: &str) -> Result<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(raw).map_err(|e| StoreError::Corrupt {
        kind,
        id: id.to_string(),
        reason: format!("bad timestamp {raw:?}: {e}"),
    })
}

const TASK_COLUMNS: &str = "id, name, script_path, env, cron_expr, cron_exprs, enabled,
     notify_on_failure, created_at, updated_at";

struct TaskRow {
    id: String,
    name: String,
    script_path: String,
    env: String,
    cron_expr: String,
    cron_exprs: String,
    enabled: bool,
    notify_on_failure: bool,
    created_at: String,
    updated_at: String,
}

impl TaskRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            script_path: row.get(2)?,
            env: row.get(3)?,
            cron_expr: row.get(4)?,
            cron_exprs: row.get(5)?,
            enabled: row.get(6)?,
            notify_on_failure: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn into_task(self) -> Result<Task> {
        let cron_exprs: Vec<String> = if self.cron_exprs.trim().is_empty() {
            Vec::new()
        } else {
            serde_json::from_str(&self.cron_exprs).map_err(|e| StoreError::Corrupt {
                kind: "task",
                id: self.id.clone(),
                reason: format!("bad cron_exprs: {e}"),
            })?
        };
        let mut task = Task {
            created_at: parse_ts("task", &self.id, &self.created_at)?,
            updated_at: parse_ts("task", &self.id, &self.updated_at)?,
            id: TaskId(self.id),
            name: self.name,
            script_path: self.script_path,
            env: self.env,
            cron_expr: self.cron_expr,
            cron_exprs,
            enabled: self.enabled,
            notify_on_failure: self.notify_on_failure,
        };
        // Older rows only carry the single cron_expr column.
        task.normalize_cron();
        Ok(task)
    }
}

const EXECUTION_COLUMNS: &str =
    "id, task_id, status, start_time, end_time, duration_ms, exit_code, error_message";

fn read_execution(row: &Row<'_>) -> rusqlite::Result<(String, String, String, String, Option<String>, i64, i32, Option<String>)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn decode_execution(
    (id, task_id, status, start, end, duration_ms, exit_code, error_message): (
        String,
        String,
        String,
        String,
        Option<String>,
        i64,
        i32,
        Option<String>,
    ),
) -> Result<Execution> {
    let status: ExecutionStatus = status.parse().map_err(|reason| StoreError::Corrupt {
        kind: "execution",
        id: id.clone(),
        reason,
    })?;
    let start_time = parse_ts("execution", &id, &start)?;
    let end_time = end
        .as_deref()
        .map(|raw| parse_ts("execution", &id, raw))
        .transpose()?;
    Ok(Execution {
        id: ExecutionId(id),
        task_id: TaskId(task_id),
        status,
        start_time,
        end_time,
        duration_ms,
        exit_code,
        error_message,
    })
}

fn read_log(row: &Row<'_>) -> rusqlite::Result<(String, Option<String>, String, String, String, String)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn decode_log(
    (id, execution_id, task_id, timestamp, level, content): (
        String,
        Option<String>,
        String,
        String,
        String,
        String,
    ),
) -> Result<LogEntry> {
    let level: LogLevel = level.parse().map_err(|reason| StoreError::Corrupt {
        kind: "log",
        id: id.clone(),
        reason,
    })?;
    Ok(LogEntry {
        timestamp: parse_ts("log", &id, &timestamp)?,
        id,
        execution_id: execution_id.map(ExecutionId),
        task_id: TaskId(task_id),
        level,
        content,
    })
}

/// Decode rows, skipping (and logging) any that fail.
fn collect_decoded<R, T>(
    rows: impl Iterator<Item = rusqlite::Result<R>>,
    decode: impl Fn(R) -> Result<T>,
) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for row in rows {
        match decode(row?) {
            Ok(value) => out.push(value),
            Err(e) => warn!("skipping unreadable row: {e}"),
        }
    }
    Ok(out)
}

fn insert_log_with(conn: &Connection, entry: &LogEntry) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO logs (id, execution_id, task_id, timestamp, level, content)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            entry.id,
            entry.execution_id.as_ref().map(|e| e.as_str()),
            entry.task_id.as_str(),
            format_timestamp(&entry.timestamp),
            entry.level.to_string(),
            entry.content,
        ],
    )
}

impl Store for SqliteStore {
    fn insert_task(&self, task: &Task) -> Result<()> {
        let cron_exprs = serde_json::to_string(&task.cron_exprs)?;
        self.conn().execute(
            "INSERT INTO tasks
             (id, name, script_path, env, cron_expr, cron_exprs, enabled,
              notify_on_failure, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
            params![
                task.id.as_str(),
                task.name,
                task.script_path,
                task.env,
                task.cron_expr,
                cron_exprs,
                task.enabled,
                task.notify_on_failure,
                format_timestamp(&task.created_at),
                format_timestamp(&task.updated_at),
            ],
        )?;
        Ok(())
    }

    fn save_task(&self, task: &Task) -> Result<()> {
        let cron_exprs = serde_json::to_string(&task.cron_exprs)?;
        let n = self.conn().execute(
            "UPDATE tasks SET name=?2, script_path=?3, env=?4, cron_expr=?5, cron_exprs=?6,
              enabled=?7, notify_on_failure=?8, updated_at=?9
             WHERE id=?1",
            params![
                task.id.as_str(),
                task.name,
                task.script_path,
                task.env,
                task.cron_expr,
                cron_exprs,
                task.enabled,
                task.notify_on_failure,
                format_timestamp(&task.updated_at),
            ],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound {
                kind: "task",
                id: task.id.to_string(),
            });
        }
        Ok(())
    }

    fn get_task(&self, id: &TaskId) -> Result<Task> {
        let row = self
            .conn()
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                [id.as_str()],
                TaskRow::read,
            )
            .optional()?;
        match row {
            Some(row) => row.into_task(),
            None => Err(StoreError::NotFound {
                kind: "task",
                id: id.to_string(),
            }),
        }
    }

    fn list_tasks(&self) -> Result<Vec<Task>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare(&format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at"))?;
        let rows = stmt.query_map([], TaskRow::read)?;
        collect_decoded(rows, TaskRow::into_task)
    }

    fn list_enabled_tasks(&self) -> Result<Vec<Task>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE enabled = 1 ORDER BY created_at"
        ))?;
        let rows = stmt.query_map([], TaskRow::read)?;
        collect_decoded(rows, TaskRow::into_task)
    }

    fn delete_task(&self, id: &TaskId) -> Result<()> {
        let n = self
            .conn()
            .execute("DELETE FROM tasks WHERE id = ?1", [id.as_str()])?;
        if n == 0 {
            return Err(StoreError::NotFound {
                kind: "task",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    fn insert_execution(&self, execution: &Execution) -> Result<()> {
        self.conn().execute(
            "INSERT INTO executions
             (id, task_id, status, start_time, end_time, duration_ms, exit_code, error_message)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
            params![
                execution.id.as_str(),
                execution.task_id.as_str(),
                execution.status.to_string(),
                format_timestamp(&execution.start_time),
                execution.end_time.as_ref().map(format_timestamp),
                execution.duration_ms,
                execution.exit_code,
                execution.error_message,
            ],
        )?;
        Ok(())
    }

    fn list_executions(&self, task_id: Option<&TaskId>, limit: usize) -> Result<Vec<Execution>> {
        let conn = self.conn();
        let limit = clamp_limit(limit);
        match task_id {
            Some(task_id) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {EXECUTION_COLUMNS} FROM executions
                     WHERE task_id = ?1 ORDER BY start_time DESC LIMIT ?2"
                ))?;
                let rows = stmt.query_map(params![task_id.as_str(), limit], read_execution)?;
                collect_decoded(rows, decode_execution)
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {EXECUTION_COLUMNS} FROM executions
                     ORDER BY start_time DESC LIMIT ?1"
                ))?;
                let rows = stmt.query_map([limit], read_execution)?;
                collect_decoded(rows, decode_execution)
            }
        }
    }

    fn insert_log(&self, entry: &LogEntry) -> Result<()> {
        insert_log_with(&self.conn(), entry)?;
        Ok(())
    }

    fn insert_logs(&self, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        for entry in entries {
            insert_log_with(&tx, entry)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn list_logs(&self, filter: LogFilter<'_>, limit: usize) -> Result<Vec<LogEntry>> {
        let conn = self.conn();
        let limit = clamp_limit(limit);
        let columns = "id, execution_id, task_id, timestamp, level, content";
        let mut entries = match filter {
            LogFilter::All => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {columns} FROM logs ORDER BY timestamp DESC, seq DESC LIMIT ?1"
                ))?;
                let rows = stmt.query_map([limit], read_log)?;
                collect_decoded(rows, decode_log)?
            }
            LogFilter::Execution(execution_id) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {columns} FROM logs WHERE execution_id = ?1
                     ORDER BY timestamp DESC, seq DESC LIMIT ?2"
                ))?;
                let rows = stmt.query_map(params![execution_id.as_str(), limit], read_log)?;
                collect_decoded(rows, decode_log)?
            }
            LogFilter::Task(task_id) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {columns} FROM logs WHERE task_id = ?1
                     ORDER BY timestamp DESC, seq DESC LIMIT ?2"
                ))?;
                let rows = stmt.query_map(params![task_id.as_str(), limit], read_log)?;
                collect_decoded(rows, decode_log)?
            }
        };
        // Newest N were selected; hand them back oldest first.
        entries.reverse();
        Ok(entries)
    }

    fn get_config(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn()
            .query_row("SELECT value FROM config WHERE key = ?1", [key], |row| {
                row.get::<_, String>(0)
            })
            .optional()?;
        Ok(value)
    }

    fn set_config(&self, key: &str, value: &str) -> Result<()> {
        let now = format_timestamp(&self.clock.now());
        self.conn().execute(
            "INSERT INTO config (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now],
        )?;
        Ok(())
    }

    fn all_config(&self) -> Result<BTreeMap<String, String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT key, value FROM config")?;
        let pairs = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<rusqlite::Result<BTreeMap<_, _>>>()?;
        Ok(pairs)
    }

    fn seed_config(&self, defaults: &[(&str, String)]) -> Result<()> {
        let now = format_timestamp(&self.clock.now());
        let conn = self.conn();
        for (key, value) in defaults {
            conn.execute(
                "INSERT OR IGNORE INTO config (key, value, updated_at) VALUES (?1, ?2, ?3)",
                params![key, value, now],
            )?;
        }
        Ok(())
    }

    fn purge_before(&self, cutoff: DateTime<FixedOffset>) -> Result<PurgeReport> {
        let cutoff = format_timestamp(&cutoff.with_timezone(&self.clock.offset()));
        let conn = self.conn();
        let logs = conn.execute("DELETE FROM logs WHERE timestamp < ?1", [&cutoff])?;
        let executions = conn.execute(
            "DELETE FROM executions WHERE end_time IS NOT NULL AND end_time < ?1",
            [&cutoff],
        )?;
        Ok(PurgeReport { logs, executions })
    }

    fn vacuum(&self) -> Result<()> {
        self.conn().execute_batch("VACUUM")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use scriptguard_core::{LogMessage, ManualClock};
    use std::sync::Arc;

    fn t0() -> DateTime<FixedOffset> {
        FixedOffset::east_opt(8 * 3600)
            .unwrap()
            .with_ymd_and_hms(2026, 5, 1, 9, 0, 0)
            .unwrap()
    }

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory(Arc::new(ManualClock::new(t0()))).unwrap()
    }

    fn task() -> Task {
        Task::new(
            "nightly",
            "/opt/jobs/nightly.py",
            "base",
            vec!["0 0 9 * * *".into(), "0 0 18 * * *".into()],
            t0(),
        )
    }

    fn log(task: &Task, exec: Option<&ExecutionId>, at: DateTime<FixedOffset>, text: &str) -> LogEntry {
        LogMessage::new(exec.cloned(), task.id.clone(), at, LogLevel::Stdout, text).into()
    }

    #[test]
    fn task_round_trip_and_update() {
        let store = store();
        let mut t = task();
        store.insert_task(&t).unwrap();
        assert_eq!(store.get_task(&t.id).unwrap(), t);

        t.enabled = false;
        t.cron_exprs = vec!["@daily".into()];
        t.normalize_cron();
        store.save_task(&t).unwrap();

        let loaded = store.get_task(&t.id).unwrap();
        assert!(!loaded.enabled);
        assert_eq!(loaded.cron_exprs, vec!["@daily".to_string()]);
        assert_eq!(loaded.cron_expr, "@daily");
        assert!(store.list_enabled_tasks().unwrap().is_empty());
        assert_eq!(store.list_tasks().unwrap().len(), 1);
    }

    #[test]
    fn legacy_row_is_normalized_on_load() {
        let store = store();
        store
            .conn()
            .execute(
                "INSERT INTO tasks (id, name, script_path, env, cron_expr, cron_exprs,
                 enabled, notify_on_failure, created_at, updated_at)
                 VALUES ('old', 'old', '/a.py', 'base', '0 30 8 * * *', '', 1, 1,
                 '2026-01-01T00:00:00.000+08:00', '2026-01-01T00:00:00.000+08:00')",
                [],
            )
            .unwrap();
        let loaded = store.get_task(&TaskId::from("old")).unwrap();
        assert_eq!(loaded.cron_exprs, vec!["0 30 8 * * *".to_string()]);
    }

    #[test]
    fn missing_task_is_not_found() {
        let store = store();
        let id = TaskId::from("nope");
        assert!(matches!(store.get_task(&id), Err(StoreError::NotFound { .. })));
        assert!(matches!(store.delete_task(&id), Err(StoreError::NotFound { .. })));
        assert!(matches!(store.save_task(&task()), Err(StoreError::NotFound { .. })));
    }

    #[test]
    fn executions_list_newest_first() {
        let store = store();
        let t = task();
        for i in 0..3 {
            let mut e = Execution::start(t.id.clone(), t0() + Duration::seconds(i));
            e.succeed(t0() + Duration::seconds(i) + Duration::milliseconds(10));
            store.insert_execution(&e).unwrap();
        }
        let listed = store.list_executions(Some(&t.id), 2).unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed[0].start_time > listed[1].start_time);
        assert_eq!(listed[0].status, ExecutionStatus::Success);
        assert!(store.list_executions(Some(&TaskId::from("x")), 10).unwrap().is_empty());
    }

    #[test]
    fn logs_keep_insertion_order_within_a_millisecond() {
        let store = store();
        let t = task();
        let exec = ExecutionId::new();
        let batch: Vec<LogEntry> = (0..5)
            .map(|i| log(&t, Some(&exec), t0(), &format!("line {i}")))
            .collect();
        store.insert_logs(&batch).unwrap();

        let listed = store.list_logs(LogFilter::Execution(&exec), 100).unwrap();
        let contents: Vec<_> = listed.iter().map(|l| l.content.as_str()).collect();
        assert_eq!(contents, ["line 0", "line 1", "line 2", "line 3", "line 4"]);

        let tail = store.list_logs(LogFilter::Execution(&exec), 2).unwrap();
        assert_eq!(tail[0].content, "line 3");
        assert_eq!(tail[1].content, "line 4");
    }

    #[test]
    fn config_seed_does_not_overwrite() {
        let store = store();
        store.set_config("max_concurrency", "3").unwrap();
        store
            .seed_config(&[
                ("max_concurrency", "5".to_string()),
                ("log_retention_days", "30".to_string()),
            ])
            .unwrap();
        let all = store.all_config().unwrap();
        assert_eq!(all["max_concurrency"], "3");
        assert_eq!(all["log_retention_days"], "30");
        assert_eq!(store.get_config("missing").unwrap(), None);
    }

    #[test]
    fn purge_removes_only_old_rows() {
        let store = store();
        let t = task();

        let mut old = Execution::start(t.id.clone(), t0() - Duration::days(40));
        old.fail(t0() - Duration::days(40), 1, "boom");
        let running = Execution::start(t.id.clone(), t0() - Duration::days(40));
        let mut recent = Execution::start(t.id.clone(), t0());
        recent.succeed(t0());
        for e in [&old, &running, &recent] {
            store.insert_execution(e).unwrap();
        }
        store.insert_log(&log(&t, Some(&old.id), t0() - Duration::days(40), "old")).unwrap();
        store.insert_log(&log(&t, Some(&recent.id), t0(), "new")).unwrap();

        let report = store.purge_before(t0() - Duration::days(30)).unwrap();
        assert_eq!(report, PurgeReport { logs: 1, executions: 1 });

        let remaining = store.list_executions(None, 10).unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().any(|e| e.status == ExecutionStatus::Running));
        store.vacuum().unwrap();
    }

    #[test]
    fn open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("scriptguard.db");
        let store = SqliteStore::open(&path, Arc::new(ManualClock::new(t0()))).unwrap();
        store.insert_task(&task()).unwrap();
        assert!(path.exists());
    }
}
