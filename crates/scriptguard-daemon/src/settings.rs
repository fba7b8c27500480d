//! Runtime key-value settings kept in the `config` table.
//!
//! The file config supplies the seed values; after that the stored values
//! win and can be changed while the daemon runs.

use scriptguard_core::config::validate_run_timeout;
use scriptguard_core::{CoreError, ScriptGuardConfig};

pub const KEY_MAX_CONCURRENCY: &str = "max_concurrency";
pub const KEY_EXECUTION_TIMEOUT_SECONDS: &str = "execution_timeout_seconds";
pub const KEY_LOG_RETENTION_DAYS: &str = "log_retention_days";
pub const KEY_DINGTALK_WEBHOOK: &str = "dingtalk_webhook";
pub const KEY_WECOM_WEBHOOK: &str = "wecom_webhook";

/// A parsed, validated runtime setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Setting {
    MaxConcurrency(usize),
    /// Seconds; 0 disables the timeout.
    ExecutionTimeout(u64),
    LogRetentionDays(u32),
    /// `None` when the value is blank.
    DingTalkWebhook(Option<String>),
    WeComWebhook(Option<String>),
    /// A key nothing reads. Stored as-is.
    Other,
}

impl Setting {
    /// Validate `value` for `key`. Errors name the key.
    pub fn parse(key: &str, value: &str) -> Result<Self, CoreError> {
        let value = value.trim();
        match key {
            KEY_MAX_CONCURRENCY => match value.parse::<usize>() {
                Ok(n) if n > 0 => Ok(Setting::MaxConcurrency(n)),
                _ => Err(CoreError::invalid(
                    key,
                    format!("must be a positive integer, got `{value}`"),
                )),
            },
            KEY_EXECUTION_TIMEOUT_SECONDS => {
                let secs = value.parse::<u64>().map_err(|_| {
                    CoreError::invalid(key, format!("must be a whole number of seconds, got `{value}`"))
                })?;
                validate_run_timeout(key, secs)?;
                Ok(Setting::ExecutionTimeout(secs))
            }
            KEY_LOG_RETENTION_DAYS => match value.parse::<u32>() {
                Ok(days) if days > 0 => Ok(Setting::LogRetentionDays(days)),
                _ => Err(CoreError::invalid(
                    key,
                    format!("must be a positive number of days, got `{value}`"),
                )),
            },
            KEY_DINGTALK_WEBHOOK => Ok(Setting::DingTalkWebhook(parse_webhook(key, value)?)),
            KEY_WECOM_WEBHOOK => Ok(Setting::WeComWebhook(parse_webhook(key, value)?)),
            _ => Ok(Setting::Other),
        }
    }
}

fn parse_webhook(key: &str, value: &str) -> Result<Option<String>, CoreError> {
    if value.is_empty() {
        return Ok(None);
    }
    if !(value.starts_with("http://") || value.starts_with("https://")) {
        return Err(CoreError::invalid(key, "must be an http(s) URL or empty"));
    }
    Ok(Some(value.to_string()))
}

/// Values written to the `config` table when a key is absent.
pub fn seed_values(config: &ScriptGuardConfig) -> Vec<(&'static str, String)> {
    vec![
        (KEY_MAX_CONCURRENCY, config.scheduler.max_concurrency.to_string()),
        (
            KEY_EXECUTION_TIMEOUT_SECONDS,
            config.scheduler.run_timeout_secs.to_string(),
        ),
        (KEY_LOG_RETENTION_DAYS, config.logs.retention_days.to_string()),
        (
            KEY_DINGTALK_WEBHOOK,
            config.notify.dingtalk_webhook.clone().unwrap_or_default(),
        ),
        (
            KEY_WECOM_WEBHOOK,
            config.notify.wecom_webhook.clone().unwrap_or_default(),
        ),
    ]
}
