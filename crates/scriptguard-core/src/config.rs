use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::clock::parse_utc_offset;
use crate::error::{CoreError, Result};

pub const DEFAULT_MAX_CONCURRENCY: usize = 5;
/// 0 disables the run timeout.
pub const DEFAULT_RUN_TIMEOUT_SECS: u64 = 0;
pub const MIN_RUN_TIMEOUT_SECS: u64 = 60;
pub const MAX_RUN_TIMEOUT_SECS: u64 = 86_400;
pub const DEFAULT_UTC_OFFSET: &str = "+08:00";
pub const MAX_CRON_EXPRESSIONS: usize = 60;
pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;
pub const DEFAULT_LOG_QUEUE_CAPACITY: usize = 2000;
pub const DEFAULT_LOG_BATCH_SIZE: usize = 200;
pub const DEFAULT_LOG_FLUSH_INTERVAL_MS: u64 = 200;
pub const DEFAULT_RETENTION_DAYS: u32 = 30;
pub const DEFAULT_CLEANUP_CRON: &str = "0 0 2 * * *";

/// Top-level config (scriptguard.toml + SCRIPTGUARD_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptGuardConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub logs: LogsConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Upper bound on simultaneous runs. Clamped to at least 1 by the gate.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Wall-clock limit per run. 0 = unlimited, otherwise 60..=86400.
    #[serde(default)]
    pub run_timeout_secs: u64,
    /// Canonical civil zone, e.g. "+08:00".
    #[serde(default = "default_utc_offset")]
    pub utc_offset: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            run_timeout_secs: DEFAULT_RUN_TIMEOUT_SECS,
            utc_offset: default_utc_offset(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// argv template. `{env}` and `{script}` are substituted per run.
    #[serde(default = "default_command")]
    pub command: Vec<String>,
    /// `NAME=value` forced into the child environment so interpreter output
    /// has a fixed encoding.
    #[serde(default = "default_encoding_env")]
    pub encoding_env: String,
    /// Per-line byte budget; longer lines are truncated with a marker.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
    #[serde(default = "bool_true")]
    pub strip_ansi: bool,
    /// How long to wait for pipes to close after a timeout kill.
    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            encoding_env: default_encoding_env(),
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            strip_ansi: true,
            kill_grace_secs: default_kill_grace_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsConfig {
    /// Per-run queue between the stream readers and the batch writer.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Capacity of the live broadcast channel.
    #[serde(default = "default_live_buffer")]
    pub live_buffer: usize,
    #[serde(default = "default_cleanup_cron")]
    pub cleanup_cron: String,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_LOG_QUEUE_CAPACITY,
            batch_size: DEFAULT_LOG_BATCH_SIZE,
            flush_interval_ms: DEFAULT_LOG_FLUSH_INTERVAL_MS,
            retention_days: DEFAULT_RETENTION_DAYS,
            live_buffer: default_live_buffer(),
            cleanup_cron: default_cleanup_cron(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default)]
    pub dingtalk_webhook: Option<String>,
    #[serde(default)]
    pub wecom_webhook: Option<String>,
    #[serde(default = "default_notify_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            dingtalk_webhook: None,
            wecom_webhook: None,
            timeout_secs: default_notify_timeout_secs(),
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_max_concurrency() -> usize {
    DEFAULT_MAX_CONCURRENCY
}
fn default_utc_offset() -> String {
    DEFAULT_UTC_OFFSET.to_string()
}
fn default_command() -> Vec<String> {
    ["conda", "run", "-n", "{env}", "python", "{script}"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_encoding_env() -> String {
    "PYTHONIOENCODING=utf-8".to_string()
}
fn default_max_line_bytes() -> usize {
    DEFAULT_MAX_LINE_BYTES
}
fn default_kill_grace_secs() -> u64 {
    5
}
fn default_queue_capacity() -> usize {
    DEFAULT_LOG_QUEUE_CAPACITY
}
fn default_batch_size() -> usize {
    DEFAULT_LOG_BATCH_SIZE
}
fn default_flush_interval_ms() -> u64 {
    DEFAULT_LOG_FLUSH_INTERVAL_MS
}
fn default_retention_days() -> u32 {
    DEFAULT_RETENTION_DAYS
}
fn default_live_buffer() -> usize {
    1024
}
fn default_cleanup_cron() -> String {
    DEFAULT_CLEANUP_CRON.to_string()
}
fn default_notify_timeout_secs() -> u64 {
    8
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.scriptguard/scriptguard.db", home)
}

impl ScriptGuardConfig {
    /// Load config from a TOML file with SCRIPTGUARD_* env var overrides.
    ///
    /// Nested keys use a double underscore:
    /// `SCRIPTGUARD_SCHEDULER__MAX_CONCURRENCY=3`. A missing file is not an
    /// error; every field has a default.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: ScriptGuardConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("SCRIPTGUARD_").split("__"))
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values that cannot be clamped into something meaningful.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.max_concurrency == 0 {
            return Err(CoreError::invalid(
                "scheduler.max_concurrency",
                "must be a positive integer",
            ));
        }
        validate_run_timeout("scheduler.run_timeout_secs", self.scheduler.run_timeout_secs)?;
        parse_utc_offset(&self.scheduler.utc_offset)?;

        if self.runner.command.is_empty() {
            return Err(CoreError::invalid("runner.command", "must not be empty"));
        }
        if self.runner.max_line_bytes == 0 {
            return Err(CoreError::invalid("runner.max_line_bytes", "must be positive"));
        }
        if self.logs.queue_capacity == 0 {
            return Err(CoreError::invalid("logs.queue_capacity", "must be positive"));
        }
        if self.logs.batch_size == 0 {
            return Err(CoreError::invalid("logs.batch_size", "must be positive"));
        }
        if self.logs.flush_interval_ms == 0 {
            return Err(CoreError::invalid("logs.flush_interval_ms", "must be positive"));
        }
        if self.logs.retention_days == 0 {
            return Err(CoreError::invalid("logs.retention_days", "must be positive"));
        }
        Ok(())
    }
}

/// A run timeout is either 0 (unlimited) or within 60..=86400 seconds.
pub fn validate_run_timeout(key: &str, secs: u64) -> Result<()> {
    if secs != 0 && !(MIN_RUN_TIMEOUT_SECS..=MAX_RUN_TIMEOUT_SECS).contains(&secs) {
        return Err(CoreError::invalid(
            key,
            format!(
                "must be 0 (unlimited) or between {MIN_RUN_TIMEOUT_SECS} and {MAX_RUN_TIMEOUT_SECS} seconds, got {secs}"
            ),
        ));
    }
    Ok(())
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.scriptguard/scriptguard.toml", home)
}
