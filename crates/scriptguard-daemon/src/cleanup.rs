//! Retention cleanup: purge old log entries and finished executions on a
//! cron schedule.

use std::sync::Arc;

use chrono::Duration;
use scriptguard_core::config::DEFAULT_RETENTION_DAYS;
use scriptguard_core::SharedClock;
use scriptguard_scheduler::{CronSchedule, SchedulerError, Wake};
use scriptguard_store::{PurgeReport, Store, StoreError};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::settings::{Setting, KEY_LOG_RETENTION_DAYS};

pub struct RetentionCleaner {
    store: Arc<dyn Store>,
    clock: SharedClock,
    schedule: CronSchedule,
}

impl RetentionCleaner {
    pub fn new(
        store: Arc<dyn Store>,
        clock: SharedClock,
        cleanup_cron: &str,
    ) -> Result<Self, SchedulerError> {
        Ok(Self {
            store,
            clock,
            schedule: CronSchedule::parse(cleanup_cron)?,
        })
    }

    /// Days of history to keep, read fresh from the config table.
    pub fn retention_days(&self) -> u32 {
        match self.store.get_config(KEY_LOG_RETENTION_DAYS) {
            Ok(Some(value)) => match Setting::parse(KEY_LOG_RETENTION_DAYS, &value) {
                Ok(Setting::LogRetentionDays(days)) => days,
                _ => {
                    warn!(value = %value, "invalid log retention; using {DEFAULT_RETENTION_DAYS} days");
                    DEFAULT_RETENTION_DAYS
                }
            },
            Ok(None) => {
                warn!("log retention not set; using {DEFAULT_RETENTION_DAYS} days");
                DEFAULT_RETENTION_DAYS
            }
            Err(e) => {
                warn!("failed to read log retention ({e}); using {DEFAULT_RETENTION_DAYS} days");
                DEFAULT_RETENTION_DAYS
            }
        }
    }

    /// One retention pass.
    pub fn run_once(&self) -> Result<PurgeReport, StoreError> {
        let days = self.retention_days();
        let cutoff = self.clock.now() - Duration::days(i64::from(days));
        let report = self.store.purge_before(cutoff)?;
        info!(
            days,
            logs = report.logs,
            executions = report.executions,
            "retention purge complete"
        );
        Ok(report)
    }

    /// Fire [`RetentionCleaner::run_once`] on every occurrence of the
    /// schedule until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(expression = self.schedule.expression(), "retention cleanup scheduled");
        let mut cursor = self.clock.now();
        loop {
            let next = match self
                .schedule
                .sleep_until_next(self.clock.as_ref(), &cursor, &mut shutdown)
                .await
            {
                Wake::Due(next) => next,
                Wake::ShutDown => return,
                Wake::Exhausted => {
                    warn!("cleanup schedule has no future occurrence; stopping");
                    return;
                }
            };
            if let Err(e) = self.run_once() {
                error!("retention purge failed: {e}");
            }
            cursor = next.max(self.clock.now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone};
    use scriptguard_core::{Clock, Execution, LogLevel, LogMessage, ManualClock, TaskId};
    use scriptguard_store::{LogFilter, SqliteStore};

    fn setup() -> (Arc<ManualClock>, Arc<dyn Store>) {
        let start = FixedOffset::east_opt(8 * 3600)
            .unwrap()
            .with_ymd_and_hms(2026, 1, 1, 12, 0, 0)
            .unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory(clock.clone()).unwrap());
        (clock, store)
    }

    fn seed_history(clock: &ManualClock, store: &dyn Store, task: &TaskId) {
        let mut execution = Execution::start(task.clone(), clock.now());
        execution.succeed(clock.now());
        store.insert_execution(&execution).unwrap();
        let message = LogMessage::new(
            Some(execution.id.clone()),
            task.clone(),
            clock.now(),
            LogLevel::Stdout,
            "hello",
        );
        store.insert_log(&message.into()).unwrap();
    }

    #[test]
    fn purges_only_what_is_older_than_retention() {
        let (clock, store) = setup();
        let task = TaskId::from("t1");
        seed_history(&clock, store.as_ref(), &task);
        clock.advance(Duration::days(10));
        seed_history(&clock, store.as_ref(), &task);
        clock.advance(Duration::days(1));

        store.set_config(KEY_LOG_RETENTION_DAYS, "5").unwrap();
        let cleaner = RetentionCleaner::new(store.clone(), clock.clone(), "0 0 2 * * *").unwrap();
        let report = cleaner.run_once().unwrap();

        assert_eq!(report, PurgeReport { logs: 1, executions: 1 });
        assert_eq!(store.list_executions(Some(&task), 10).unwrap().len(), 1);
        assert_eq!(store.list_logs(LogFilter::Task(&task), 10).unwrap().len(), 1);
    }

    #[test]
    fn bad_or_missing_retention_falls_back() {
        let (clock, store) = setup();
        let cleaner = RetentionCleaner::new(store.clone(), clock, "0 0 2 * * *").unwrap();
        assert_eq!(cleaner.retention_days(), DEFAULT_RETENTION_DAYS);

        store.set_config(KEY_LOG_RETENTION_DAYS, "forever").unwrap();
        assert_eq!(cleaner.retention_days(), DEFAULT_RETENTION_DAYS);

        store.set_config(KEY_LOG_RETENTION_DAYS, "7").unwrap();
        assert_eq!(cleaner.retention_days(), 7);
    }

    #[test]
    fn invalid_cleanup_cron_is_rejected() {
        let (clock, store) = setup();
        assert!(RetentionCleaner::new(store, clock, "0 2 * * *").is_err());
    }

    #[tokio::test]
    async fn loop_exits_on_shutdown() {
        let (clock, store) = setup();
        let cleaner = RetentionCleaner::new(store, clock, "0 0 2 * * *").unwrap();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(cleaner.run(rx));
        tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
