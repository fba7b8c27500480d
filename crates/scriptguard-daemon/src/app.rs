use std::collections::BTreeMap;
use std::sync::Arc;

use scriptguard_core::{
    Execution, LogEntry, ScriptGuardConfig, SharedClock, Task, TaskId,
};
use scriptguard_runner::{LiveLog, Supervisor, SupervisorSettings};
use scriptguard_scheduler::{
    validate_expressions, ConcurrencyGate, Dispatcher, Notifier, Scheduler,
};
use scriptguard_store::{LogFilter, Store};
use tracing::{error, info, warn};

use crate::error::{AppError, Result};
use crate::notifier::{WebhookKind, WebhookNotifier};
use crate::settings::{seed_values, Setting};

/// Service layer shared by every CLI command.
///
/// Owns the Gate, Supervisor, Dispatcher and Scheduler and keeps the timer
/// registry consistent with the task table: every mutation that touches
/// both compensates when the second step fails.
pub struct App {
    pub config: ScriptGuardConfig,
    store: Arc<dyn Store>,
    clock: SharedClock,
    gate: Arc<ConcurrencyGate>,
    supervisor: Arc<Supervisor>,
    dispatcher: Arc<Dispatcher>,
    scheduler: Scheduler,
    notifier: Arc<WebhookNotifier>,
}

impl App {
    pub fn new(config: ScriptGuardConfig, store: Arc<dyn Store>, clock: SharedClock) -> Result<Self> {
        let live = LiveLog::new(config.logs.live_buffer);
        let supervisor = Arc::new(Supervisor::new(
            SupervisorSettings::from_config(&config.runner, &config.logs),
            config.scheduler.run_timeout_secs,
            store.clone(),
            live,
            clock.clone(),
        ));
        let gate = Arc::new(ConcurrencyGate::new(config.scheduler.max_concurrency));
        let notifier = Arc::new(WebhookNotifier::new(&config.notify, clock.clone())?);
        let dispatcher = Arc::new(Dispatcher::new(
            gate.clone(),
            supervisor.clone(),
            store.clone(),
            notifier.clone() as Arc<dyn Notifier>,
        ));
        let scheduler = Scheduler::new(dispatcher.clone(), clock.clone());

        Ok(Self {
            config,
            store,
            clock,
            gate,
            supervisor,
            dispatcher,
            scheduler,
            notifier,
        })
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn gate(&self) -> &Arc<ConcurrencyGate> {
        &self.gate
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn notifier(&self) -> &Arc<WebhookNotifier> {
        &self.notifier
    }

    pub fn live(&self) -> &LiveLog {
        self.supervisor.live()
    }

    // -----------------------------------------------------------------------
    // Runtime config
    // -----------------------------------------------------------------------

    /// Seed absent config keys from the file config, then apply every
    /// stored value. A stored value that fails validation is logged and the
    /// file value stays in force.
    pub fn reload_runtime_config(&self) -> Result<()> {
        self.store.seed_config(&seed_values(&self.config))?;
        for (key, value) in self.store.all_config()? {
            match Setting::parse(&key, &value) {
                Ok(setting) => self.apply(setting),
                Err(e) => warn!(key = %key, "ignoring stored config value: {e}"),
            }
        }
        Ok(())
    }

    /// Validate, persist and hot-apply one runtime setting.
    pub fn update_config(&self, key: &str, value: &str) -> Result<()> {
        let value = value.trim();
        let setting = Setting::parse(key, value)?;
        self.store.set_config(key, value)?;
        self.apply(setting);
        Ok(())
    }

    pub fn all_config(&self) -> Result<BTreeMap<String, String>> {
        Ok(self.store.all_config()?)
    }

    fn apply(&self, setting: Setting) {
        match setting {
            Setting::MaxConcurrency(n) => self.gate.set_capacity(n),
            Setting::ExecutionTimeout(secs) => self.supervisor.set_timeout_secs(secs),
            Setting::DingTalkWebhook(url) => self.notifier.set_webhook(WebhookKind::DingTalk, url),
            Setting::WeComWebhook(url) => self.notifier.set_webhook(WebhookKind::WeCom, url),
            // Read by the cleanup loop on every pass.
            Setting::LogRetentionDays(_) | Setting::Other => {}
        }
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    /// Register every enabled task. Per-task failures are logged and the
    /// rest still load. Returns the number of tasks scheduled.
    pub fn load_tasks(&self) -> Result<usize> {
        let tasks = self.store.list_enabled_tasks()?;
        let mut loaded = 0;
        for task in &tasks {
            match self.scheduler.add(task) {
                Ok(_) => loaded += 1,
                Err(e) => error!(task_id = %task.id, name = %task.name, "failed to schedule task: {e}"),
            }
        }
        info!(loaded, total = tasks.len(), "tasks loaded");
        Ok(loaded)
    }

    pub fn create_task(&self, mut task: Task) -> Result<Task> {
        task.normalize_cron();
        validate_expressions(&task.cron_exprs)?;
        task.updated_at = self.clock.now();
        self.store.insert_task(&task)?;

        if let Err(e) = self.scheduler.add(&task) {
            task.enabled = false;
            if let Err(save_err) = self.store.save_task(&task) {
                error!(task_id = %task.id, "failed to disable unschedulable task: {save_err}");
            }
            return Err(AppError::SavedDisabled {
                task_id: task.id,
                source: e,
            });
        }
        info!(task_id = %task.id, name = %task.name, "task created");
        Ok(task)
    }

    pub fn update_task(&self, mut task: Task) -> Result<Task> {
        task.normalize_cron();
        validate_expressions(&task.cron_exprs)?;
        let previous = self.store.get_task(&task.id)?;
        task.created_at = previous.created_at;
        task.updated_at = self.clock.now();

        self.scheduler.remove(&task.id);
        if let Err(e) = self.store.save_task(&task) {
            self.reschedule(&previous);
            return Err(e.into());
        }
        if let Err(e) = self.scheduler.add(&task) {
            if let Err(restore_err) = self.store.save_task(&previous) {
                error!(task_id = %task.id, "failed to restore previous task row: {restore_err}");
            }
            self.reschedule(&previous);
            return Err(e.into());
        }
        info!(task_id = %task.id, name = %task.name, enabled = task.enabled, "task updated");
        Ok(task)
    }

    pub fn delete_task(&self, task_id: &TaskId) -> Result<()> {
        let previous = self.store.get_task(task_id)?;
        self.scheduler.remove(task_id);
        if let Err(e) = self.store.delete_task(task_id) {
            self.reschedule(&previous);
            return Err(e.into());
        }
        info!(task_id = %task_id, name = %previous.name, "task deleted");
        Ok(())
    }

    pub fn set_enabled(&self, task_id: &TaskId, enabled: bool) -> Result<Task> {
        let mut task = self.store.get_task(task_id)?;
        task.enabled = enabled;
        self.update_task(task)
    }

    fn reschedule(&self, previous: &Task) {
        if let Err(e) = self.scheduler.add(previous) {
            error!(task_id = %previous.id, "failed to restore task timers: {e}");
        }
    }

    // -----------------------------------------------------------------------
    // Runs and history
    // -----------------------------------------------------------------------

    pub async fn run_now(&self, task_id: &TaskId) -> Result<Execution> {
        Ok(self.dispatcher.run_now(task_id).await?)
    }

    pub fn list_tasks(&self) -> Result<Vec<Task>> {
        Ok(self.store.list_tasks()?)
    }

    pub fn list_executions(&self, task_id: Option<&TaskId>, limit: usize) -> Result<Vec<Execution>> {
        Ok(self.store.list_executions(task_id, limit)?)
    }

    /// Log entries matching `filter`. Filtering by task also returns the
    /// entries of skipped firings, which carry no execution id.
    pub fn list_logs(&self, filter: LogFilter<'_>, limit: usize) -> Result<Vec<LogEntry>> {
        Ok(self.store.list_logs(filter, limit)?)
    }

    /// Close admission, cancel every timer and wait for in-flight runs.
    pub async fn shutdown(&self) {
        self.gate.close();
        self.scheduler.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{KEY_EXECUTION_TIMEOUT_SECONDS, KEY_MAX_CONCURRENCY, KEY_WECOM_WEBHOOK};
    use chrono::{DateTime, FixedOffset};
    use scriptguard_core::{Clock, FixedOffsetClock};
    use scriptguard_scheduler::SchedulerError;
    use scriptguard_store::{PurgeReport, SqliteStore, StoreError};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Wraps a real store and fails task writes on demand.
    struct FlakyStore {
        inner: SqliteStore,
        fail_writes: AtomicBool,
    }

    impl FlakyStore {
        fn check(&self) -> scriptguard_store::Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StoreError::Io(std::io::Error::other("disk full")));
            }
            Ok(())
        }
    }

    impl Store for FlakyStore {
        fn insert_task(&self, task: &Task) -> scriptguard_store::Result<()> {
            self.check()?;
            self.inner.insert_task(task)
        }
        fn save_task(&self, task: &Task) -> scriptguard_store::Result<()> {
            self.check()?;
            self.inner.save_task(task)
        }
        fn get_task(&self, id: &TaskId) -> scriptguard_store::Result<Task> {
            self.inner.get_task(id)
        }
        fn list_tasks(&self) -> scriptguard_store::Result<Vec<Task>> {
            self.inner.list_tasks()
        }
        fn list_enabled_tasks(&self) -> scriptguard_store::Result<Vec<Task>> {
            self.inner.list_enabled_tasks()
        }
        fn delete_task(&self, id: &TaskId) -> scriptguard_store::Result<()> {
            self.check()?;
            self.inner.delete_task(id)
        }
        fn insert_execution(&self, execution: &Execution) -> scriptguard_store::Result<()> {
            self.inner.insert_execution(execution)
        }
        fn list_executions(
            &self,
            task_id: Option<&TaskId>,
            limit: usize,
        ) -> scriptguard_store::Result<Vec<Execution>> {
            self.inner.list_executions(task_id, limit)
        }
        fn insert_log(&self, entry: &LogEntry) -> scriptguard_store::Result<()> {
            self.inner.insert_log(entry)
        }
        fn insert_logs(&self, entries: &[LogEntry]) -> scriptguard_store::Result<()> {
            self.inner.insert_logs(entries)
        }
        fn list_logs(
            &self,
            filter: LogFilter<'_>,
            limit: usize,
        ) -> scriptguard_store::Result<Vec<LogEntry>> {
            self.inner.list_logs(filter, limit)
        }
        fn get_config(&self, key: &str) -> scriptguard_store::Result<Option<String>> {
            self.inner.get_config(key)
        }
        fn set_config(&self, key: &str, value: &str) -> scriptguard_store::Result<()> {
            self.inner.set_config(key, value)
        }
        fn all_config(&self) -> scriptguard_store::Result<BTreeMap<String, String>> {
            self.inner.all_config()
        }
        fn seed_config(&self, defaults: &[(&str, String)]) -> scriptguard_store::Result<()> {
            self.inner.seed_config(defaults)
        }
        fn purge_before(&self, cutoff: DateTime<FixedOffset>) -> scriptguard_store::Result<PurgeReport> {
            self.inner.purge_before(cutoff)
        }
        fn vacuum(&self) -> scriptguard_store::Result<()> {
            self.inner.vacuum()
        }
    }

    fn build() -> (App, Arc<FlakyStore>) {
        let clock: SharedClock = Arc::new(FixedOffsetClock::from_offset_str("+08:00").unwrap());
        let store = Arc::new(FlakyStore {
            inner: SqliteStore::open_in_memory(clock.clone()).unwrap(),
            fail_writes: AtomicBool::new(false),
        });
        let app = App::new(ScriptGuardConfig::default(), store.clone(), clock).unwrap();
        (app, store)
    }

    fn task(app: &App, exprs: &[&str]) -> Task {
        Task::new(
            "report",
            "/jobs/report.py",
            "base",
            exprs.iter().map(|s| s.to_string()).collect(),
            app.clock().now(),
        )
    }

    #[tokio::test]
    async fn create_persists_and_schedules() {
        let (app, _) = build();
        let created = app
            .create_task(task(&app, &[" 0 0 9 * * * ", "0 0 18 * * *"]))
            .unwrap();
        assert_eq!(created.cron_exprs[0], "0 0 9 * * *");
        assert_eq!(app.scheduler().active_timers(&created.id), 2);
        assert_eq!(app.store().get_task(&created.id).unwrap(), created);
    }

    #[tokio::test]
    async fn invalid_cron_is_rejected_before_persisting() {
        let (app, _) = build();
        let t = task(&app, &["0 0 9 * * *", "61 * * * * *"]);
        let err = app.create_task(t.clone()).unwrap_err();
        assert!(err.to_string().contains("61 * * * * *"));
        assert!(app.store().get_task(&t.id).is_err());
    }

    #[tokio::test]
    async fn unschedulable_task_is_saved_disabled() {
        let (app, _) = build();
        app.scheduler().stop().await;
        let t = task(&app, &["0 0 9 * * *"]);
        let err = app.create_task(t.clone()).unwrap_err();
        assert!(matches!(
            err,
            AppError::SavedDisabled {
                source: SchedulerError::ShutDown,
                ..
            }
        ));
        assert!(!app.store().get_task(&t.id).unwrap().enabled);
    }

    #[tokio::test]
    async fn failed_update_restores_previous_timers() {
        let (app, store) = build();
        let original = app
            .create_task(task(&app, &["0 0 9 * * *", "0 0 18 * * *"]))
            .unwrap();

        let mut changed = original.clone();
        changed.cron_exprs = vec!["0 30 7 * * *".into()];
        store.fail_writes.store(true, Ordering::SeqCst);
        assert!(matches!(app.update_task(changed), Err(AppError::Store(_))));
        store.fail_writes.store(false, Ordering::SeqCst);

        assert_eq!(app.scheduler().active_timers(&original.id), 2);
        assert_eq!(app.store().get_task(&original.id).unwrap().cron_exprs.len(), 2);
    }

    #[tokio::test]
    async fn update_replaces_timers_and_keeps_created_at() {
        let (app, _) = build();
        let original = app
            .create_task(task(&app, &["0 0 9 * * *", "0 0 18 * * *"]))
            .unwrap();
        let mut changed = original.clone();
        changed.cron_exprs = vec!["0 30 7 * * *".into()];
        changed.created_at = changed.created_at + chrono::Duration::days(3);

        let updated = app.update_task(changed).unwrap();
        assert_eq!(updated.created_at, original.created_at);
        assert_eq!(app.scheduler().active_timers(&original.id), 1);
    }

    #[tokio::test]
    async fn disable_and_enable_follow_the_flag() {
        let (app, _) = build();
        let t = app.create_task(task(&app, &["0 0 9 * * *"])).unwrap();

        app.set_enabled(&t.id, false).unwrap();
        assert_eq!(app.scheduler().active_timers(&t.id), 0);
        assert!(!app.store().get_task(&t.id).unwrap().enabled);

        app.set_enabled(&t.id, true).unwrap();
        assert_eq!(app.scheduler().active_timers(&t.id), 1);
    }

    #[tokio::test]
    async fn failed_delete_keeps_task_scheduled() {
        let (app, store) = build();
        let t = app.create_task(task(&app, &["0 0 9 * * *"])).unwrap();

        store.fail_writes.store(true, Ordering::SeqCst);
        assert!(app.delete_task(&t.id).is_err());
        store.fail_writes.store(false, Ordering::SeqCst);
        assert_eq!(app.scheduler().active_timers(&t.id), 1);

        app.delete_task(&t.id).unwrap();
        assert_eq!(app.scheduler().active_timers(&t.id), 0);
        assert!(app.list_tasks().unwrap().is_empty());
    }

    #[tokio::test]
    async fn load_tasks_skips_bad_rows() {
        let (app, _) = build();
        let good = task(&app, &["0 0 9 * * *"]);
        let bad = task(&app, &["every day"]);
        let mut off = task(&app, &["0 0 9 * * *"]);
        off.enabled = false;
        for t in [&good, &bad, &off] {
            app.store().insert_task(t).unwrap();
        }

        assert_eq!(app.load_tasks().unwrap(), 1);
        assert_eq!(app.scheduler().active_timers(&good.id), 1);
        assert_eq!(app.scheduler().active_timers(&bad.id), 0);
        assert_eq!(app.scheduler().active_timers(&off.id), 0);
    }

    #[tokio::test]
    async fn config_updates_are_validated_and_hot_applied() {
        let (app, _) = build();

        let err = app.update_config(KEY_EXECUTION_TIMEOUT_SECONDS, "30").unwrap_err();
        assert!(err.to_string().contains(KEY_EXECUTION_TIMEOUT_SECONDS));
        assert_eq!(app.store().get_config(KEY_EXECUTION_TIMEOUT_SECONDS).unwrap(), None);

        app.update_config(KEY_EXECUTION_TIMEOUT_SECONDS, "120").unwrap();
        assert_eq!(app.supervisor().timeout_secs(), 120);

        app.update_config(KEY_MAX_CONCURRENCY, " 3 ").unwrap();
        assert_eq!(app.gate().capacity(), 3);
        assert_eq!(
            app.store().get_config(KEY_MAX_CONCURRENCY).unwrap().as_deref(),
            Some("3")
        );

        app.update_config(KEY_WECOM_WEBHOOK, "https://example.invalid/hook").unwrap();
        assert_eq!(
            app.notifier().webhook(WebhookKind::WeCom).as_deref(),
            Some("https://example.invalid/hook")
        );
    }

    #[tokio::test]
    async fn stored_values_override_file_config_at_startup() {
        let (app, _) = build();
        app.store().set_config(KEY_MAX_CONCURRENCY, "2").unwrap();
        app.store().set_config(KEY_EXECUTION_TIMEOUT_SECONDS, "5").unwrap();

        app.reload_runtime_config().unwrap();

        assert_eq!(app.gate().capacity(), 2);
        // Out of range: the file default stays.
        assert_eq!(app.supervisor().timeout_secs(), 0);
        let all = app.all_config().unwrap();
        assert_eq!(all.get("log_retention_days").map(String::as_str), Some("30"));
    }

    #[tokio::test]
    async fn task_logs_include_skipped_firings() {
        let (app, _) = build();
        let t = task(&app, &["0 0 9 * * *"]);
        app.gate().set_capacity(1);
        assert!(app.gate().try_acquire());

        let firing = app.dispatcher.fire_scheduled(&t).await.unwrap();
        assert!(matches!(firing, scriptguard_scheduler::Firing::Skipped));
        app.gate().release();

        let logs = app.list_logs(LogFilter::Task(&t.id), 10).unwrap();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].execution_id.is_none());
        assert!(logs[0].content.contains("skipped"));

        let other = TaskId::from("someone-else");
        assert!(app.list_logs(LogFilter::Task(&other), 10).unwrap().is_empty());
    }
}
