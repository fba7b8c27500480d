//! Cron timer registry: one Tokio timer per expression of every enabled
//! task, all cancelled together on removal or shutdown.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use scriptguard_core::{SharedClock, Task, TaskId};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::{Result, SchedulerError};
use crate::schedule::{validate_expressions, CronSchedule, Wake};

/// Receives every timer firing.
#[async_trait]
pub trait FireHandler: Send + Sync {
    async fn fire(&self, task: Task);
}

/// Cron timer registry.
///
/// Each registered task owns one timer task per cron expression. Firings
/// run on their own tracked task, so a long run never delays the next tick
/// of its timer; admission is the handler's business.
pub struct Scheduler {
    timers: Mutex<HashMap<TaskId, Vec<AbortHandle>>>,
    handler: Arc<dyn FireHandler>,
    clock: SharedClock,
    /// In-flight firings, awaited by [`Scheduler::stop`].
    firings: TaskTracker,
    shutdown_tx: watch::Sender<bool>,
}

impl Scheduler {
    pub fn new(handler: Arc<dyn FireHandler>, clock: SharedClock) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            timers: Mutex::new(HashMap::new()),
            handler,
            clock,
            firings: TaskTracker::new(),
            shutdown_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TaskId, Vec<AbortHandle>>> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register one timer per cron expression of `task`.
    ///
    /// A disabled task is a successful no-op. Every expression is parsed
    /// before any timer starts, so on error nothing is registered and an
    /// existing registration for the task is left alone. A successful call
    /// replaces any previous registration. Returns the number of timers.
    pub fn add(&self, task: &Task) -> Result<usize> {
        if !task.enabled {
            debug!(task_id = %task.id, "task disabled; not scheduling");
            return Ok(0);
        }
        let schedules = validate_expressions(&task.cron_exprs)?;

        let mut timers = self.lock();
        if *self.shutdown_tx.borrow() {
            return Err(SchedulerError::ShutDown);
        }
        if let Some(previous) = timers.remove(&task.id) {
            abort_all(&previous);
        }

        let handles: Vec<AbortHandle> = schedules
            .into_iter()
            .map(|schedule| {
                tokio::spawn(run_timer(
                    schedule,
                    task.clone(),
                    Arc::clone(&self.handler),
                    Arc::clone(&self.clock),
                    self.firings.clone(),
                    self.shutdown_tx.subscribe(),
                ))
                .abort_handle()
            })
            .collect();
        let count = handles.len();
        timers.insert(task.id.clone(), handles);

        info!(task_id = %task.id, name = %task.name, timers = count, "task scheduled");
        Ok(count)
    }

    /// Cancel every timer of `task_id`. Returns how many were cancelled.
    /// Firings already running are not interrupted.
    pub fn remove(&self, task_id: &TaskId) -> usize {
        let removed = self.lock().remove(task_id);
        match removed {
            Some(handles) => {
                abort_all(&handles);
                info!(task_id = %task_id, timers = handles.len(), "task unscheduled");
                handles.len()
            }
            None => 0,
        }
    }

    /// `remove` followed by `add`. Not atomic: if `add` fails the task is
    /// left unregistered.
    pub fn update(&self, task: &Task) -> Result<usize> {
        self.remove(&task.id);
        self.add(task)
    }

    /// Timers of `task_id` that are still alive.
    pub fn active_timers(&self, task_id: &TaskId) -> usize {
        self.lock()
            .get(task_id)
            .map(|handles| handles.iter().filter(|h| !h.is_finished()).count())
            .unwrap_or(0)
    }

    pub fn scheduled_tasks(&self) -> Vec<TaskId> {
        self.lock().keys().cloned().collect()
    }

    /// Number of firings currently in flight.
    pub fn in_flight(&self) -> usize {
        self.firings.len()
    }

    /// Stop every timer, then wait for in-flight firings to finish.
    ///
    /// Later `add` calls fail with [`SchedulerError::ShutDown`].
    pub async fn stop(&self) {
        let drained: Vec<(TaskId, Vec<AbortHandle>)> = {
            let mut timers = self.lock();
            self.shutdown_tx.send_replace(true);
            timers.drain().collect()
        };
        let count: usize = drained.iter().map(|(_, handles)| handles.len()).sum();
        for (_, handles) in &drained {
            abort_all(handles);
        }
        info!(timers = count, in_flight = self.firings.len(), "scheduler stopping");

        self.firings.close();
        self.firings.wait().await;
        info!("scheduler stopped");
    }
}

fn abort_all(handles: &[AbortHandle]) {
    for handle in handles {
        handle.abort();
    }
}

async fn run_timer(
    schedule: CronSchedule,
    task: Task,
    handler: Arc<dyn FireHandler>,
    clock: SharedClock,
    firings: TaskTracker,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut cursor = clock.now();
    loop {
        let next = match schedule
            .sleep_until_next(clock.as_ref(), &cursor, &mut shutdown)
            .await
        {
            Wake::Due(next) => next,
            Wake::ShutDown => return,
            Wake::Exhausted => {
                warn!(
                    task_id = %task.id,
                    expression = schedule.expression(),
                    "cron expression has no future occurrence; timer ends"
                );
                return;
            }
        };

        debug!(task_id = %task.id, expression = schedule.expression(), "timer fired");
        let handler = Arc::clone(&handler);
        let fired = task.clone();
        firings.spawn(async move { handler.fire(fired).await });

        // Never evaluate from before the occurrence just fired, even if the
        // sleep woke a little early.
        cursor = next.max(clock.now());
    }
}
