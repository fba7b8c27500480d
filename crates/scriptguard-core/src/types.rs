use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a task (UUIDv4).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Unique identifier for one run attempt.
///
/// UUIDv7 so ids sort by creation time, which keeps log correlation readable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ExecutionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ExecutionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A user-defined script plus its interpreter environment and firing schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    /// Path handed to the interpreter.
    pub script_path: String,
    /// Interpreter environment, referenced by name only.
    pub env: String,
    /// Legacy single-expression field; mirrors `cron_exprs[0]` after
    /// [`Task::normalize_cron`].
    #[serde(default)]
    pub cron_expr: String,
    /// Six-field cron expressions or `@descriptor`s, one timer each.
    #[serde(default)]
    pub cron_exprs: Vec<String>,
    pub enabled: bool,
    /// Send a failure notification when a scheduled run fails.
    pub notify_on_failure: bool,
    pub created_at: DateTime<FixedOffset>,
    pub updated_at: DateTime<FixedOffset>,
}

impl Task {
    /// A new enabled task with failure notifications on.
    pub fn new(
        name: impl Into<String>,
        script_path: impl Into<String>,
        env: impl Into<String>,
        cron_exprs: Vec<String>,
        now: DateTime<FixedOffset>,
    ) -> Self {
        let mut task = Self {
            id: TaskId::new(),
            name: name.into(),
            script_path: script_path.into(),
            env: env.into(),
            cron_expr: String::new(),
            cron_exprs,
            enabled: true,
            notify_on_failure: true,
            created_at: now,
            updated_at: now,
        };
        task.normalize_cron();
        task
    }

    /// Fold the legacy `cron_expr` into `cron_exprs`, trim every entry and
    /// mirror the first expression back into `cron_expr`.
    ///
    /// Does not validate: empty or duplicate entries survive so the
    /// validator can name them.
    pub fn normalize_cron(&mut self) {
        if self.cron_exprs.is_empty() {
            let legacy = self.cron_expr.trim();
            if !legacy.is_empty() {
                self.cron_exprs = vec![legacy.to_string()];
            }
        }
        for expr in &mut self.cron_exprs {
            let trimmed = expr.trim();
            if trimmed.len() != expr.len() {
                *expr = trimmed.to_string();
            }
        }
        if let Some(first) = self.cron_exprs.first() {
            self.cron_expr = first.clone();
        }
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Success,
    Failed,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "running" => Ok(ExecutionStatus::Running),
            "success" => Ok(ExecutionStatus::Success),
            "failed" => Ok(ExecutionStatus::Failed),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// One concrete attempt to run a task.
///
/// Created `Running`, then finished exactly once via [`Execution::succeed`]
/// or [`Execution::fail`]. Later finish calls are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub task_id: TaskId,
    pub status: ExecutionStatus,
    pub start_time: DateTime<FixedOffset>,
    pub end_time: Option<DateTime<FixedOffset>>,
    pub duration_ms: i64,
    pub exit_code: i32,
    pub error_message: Option<String>,
}

impl Execution {
    pub fn start(task_id: TaskId, at: DateTime<FixedOffset>) -> Self {
        Self {
            id: ExecutionId::new(),
            task_id,
            status: ExecutionStatus::Running,
            start_time: at,
            end_time: None,
            duration_ms: 0,
            exit_code: 0,
            error_message: None,
        }
    }

    pub fn succeed(&mut self, at: DateTime<FixedOffset>) {
        self.finish(at, ExecutionStatus::Success, 0, None);
    }

    pub fn fail(&mut self, at: DateTime<FixedOffset>, exit_code: i32, message: impl Into<String>) {
        self.finish(at, ExecutionStatus::Failed, exit_code, Some(message.into()));
    }

    pub fn is_finished(&self) -> bool {
        self.status != ExecutionStatus::Running
    }

    fn finish(
        &mut self,
        at: DateTime<FixedOffset>,
        status: ExecutionStatus,
        exit_code: i32,
        error_message: Option<String>,
    ) {
        if self.is_finished() {
            return;
        }
        self.status = status;
        self.end_time = Some(at);
        self.duration_ms = (at - self.start_time).num_milliseconds().max(0);
        self.exit_code = exit_code;
        self.error_message = error_message;
    }
}

// ---------------------------------------------------------------------------
// Logs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Stdout,
    Stderr,
    Success,
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Info => "info",
            LogLevel::Stdout => "stdout",
            LogLevel::Stderr => "stderr",
            LogLevel::Success => "success",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "info" => Ok(LogLevel::Info),
            "stdout" => Ok(LogLevel::Stdout),
            "stderr" => Ok(LogLevel::Stderr),
            "success" => Ok(LogLevel::Success),
            "warning" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

/// A log line as streamed live to subscribers.
///
/// `execution_id` is `None` for lines not tied to a run, such as a skipped
/// firing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogMessage {
    pub execution_id: Option<ExecutionId>,
    pub task_id: TaskId,
    pub timestamp: DateTime<FixedOffset>,
    pub level: LogLevel,
    pub content: String,
}

impl LogMessage {
    pub fn new(
        execution_id: Option<ExecutionId>,
        task_id: TaskId,
        timestamp: DateTime<FixedOffset>,
        level: LogLevel,
        content: impl Into<String>,
    ) -> Self {
        Self {
            execution_id,
            task_id,
            timestamp,
            level,
            content: content.into(),
        }
    }
}

/// A persisted log record. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: String,
    pub execution_id: Option<ExecutionId>,
    pub task_id: TaskId,
    pub timestamp: DateTime<FixedOffset>,
    pub level: LogLevel,
    pub content: String,
}

impl From<LogMessage> for LogEntry {
    fn from(msg: LogMessage) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            execution_id: msg.execution_id,
            task_id: msg.task_id,
            timestamp: msg.timestamp,
            level: msg.level,
            content: msg.content,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<FixedOffset> {
        FixedOffset::east_opt(8 * 3600)
            .unwrap()
            .with_ymd_and_hms(2026, 3, 1, 9, 0, 0)
            .unwrap()
    }

    #[test]
    fn legacy_cron_expr_is_folded_in() {
        let mut task = Task::new("t", "/tmp/a.py", "base", vec![], t0());
        task.cron_expr = "  0 0 9 * * *  ".to_string();
        task.normalize_cron();
        assert_eq!(task.cron_exprs, vec!["0 0 9 * * *".to_string()]);
        assert_eq!(task.cron_expr, "0 0 9 * * *");
    }

    #[test]
    fn cron_expr_mirrors_first_entry() {
        let task = Task::new(
            "t",
            "/tmp/a.py",
            "base",
            vec![" 0 0 18 * * *".into(), "0 0 9 * * *".into()],
            t0(),
        );
        assert_eq!(task.cron_expr, "0 0 18 * * *");
        assert_eq!(task.cron_exprs[0], "0 0 18 * * *");
    }

    #[test]
    fn execution_finishes_exactly_once() {
        let mut exec = Execution::start(TaskId::from("task-1"), t0());
        assert_eq!(exec.status, ExecutionStatus::Running);

        exec.fail(t0() + Duration::milliseconds(250), 2, "exit status 2");
        exec.succeed(t0() + Duration::seconds(10));

        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(exec.exit_code, 2);
        assert_eq!(exec.duration_ms, 250);
        assert_eq!(exec.error_message.as_deref(), Some("exit status 2"));
    }

    #[test]
    fn status_and_level_round_trip_through_strings() {
        for s in ["running", "success", "failed"] {
            assert_eq!(s.parse::<ExecutionStatus>().unwrap().to_string(), s);
        }
        for s in ["info", "stdout", "stderr", "success", "warning", "error"] {
            assert_eq!(s.parse::<LogLevel>().unwrap().to_string(), s);
        }
        assert!("bogus".parse::<LogLevel>().is_err());
    }
}
