//! Dispatcher: turns timer firings and on-demand requests into recorded
//! runs, or into a skip entry when the gate is full.

use std::sync::Arc;

use async_trait::async_trait;
use scriptguard_core::{Execution, LogLevel, LogMessage, Task, TaskId};
use scriptguard_runner::{RunOutcome, Supervisor};
use scriptguard_store::{Store, StoreError};
use tracing::{error, info, warn};

use crate::engine::FireHandler;
use crate::error::DispatchError;
use crate::gate::{Admission, ConcurrencyGate};
use crate::notify::{FailureNotice, Notifier};

/// What a scheduled firing ended up doing.
#[derive(Debug)]
pub enum Firing {
    /// The script ran; the execution is recorded whatever its status.
    Ran(Execution),
    /// The gate was full. A skip log was written instead.
    Skipped,
    /// The gate is closed for shutdown.
    Closed,
}

/// Turns a firing or an on-demand request into a supervised, recorded run.
pub struct Dispatcher {
    gate: Arc<ConcurrencyGate>,
    supervisor: Arc<Supervisor>,
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
}

impl Dispatcher {
    pub fn new(
        gate: Arc<ConcurrencyGate>,
        supervisor: Arc<Supervisor>,
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            gate,
            supervisor,
            store,
            notifier,
        }
    }

    pub fn gate(&self) -> &Arc<ConcurrencyGate> {
        &self.gate
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Handle one timer firing for `task`.
    ///
    /// A full gate is not a failure: the firing is skipped and leaves an
    /// `info` log entry without an execution id. A failed run is notified
    /// when the task asks for it. The only error is a run that could not be
    /// recorded.
    pub async fn fire_scheduled(&self, task: &Task) -> Result<Firing, DispatchError> {
        let permit = match self.gate.admit() {
            Admission::Admitted(permit) => permit,
            Admission::Skipped { running, capacity } => {
                warn!(
                    task_id = %task.id,
                    name = %task.name,
                    running,
                    capacity,
                    "concurrency limit reached; skipping scheduled firing"
                );
                self.record_skip(task);
                return Ok(Firing::Skipped);
            }
            Admission::Closed => {
                info!(task_id = %task.id, "gate closed; dropping scheduled firing");
                return Ok(Firing::Closed);
            }
        };

        let RunOutcome { execution, error } = self.supervisor.execute(task).await;
        let recorded = self.store.insert_execution(&execution);
        drop(permit);

        if let Some(run_error) = &error {
            if task.notify_on_failure {
                let notice = FailureNotice::new(task, &execution, run_error.to_string());
                if let Err(e) = self.notifier.notify_failure(&notice).await {
                    warn!(
                        task_id = %task.id,
                        execution_id = %execution.id,
                        "failure notification not sent: {e}"
                    );
                }
            }
        }

        match recorded {
            Ok(()) => Ok(Firing::Ran(execution)),
            Err(source) => Err(DispatchError::NotRecorded {
                execution: Box::new(execution),
                run_error: error,
                source,
            }),
        }
    }

    /// Run a task right now on behalf of a caller.
    ///
    /// Admission is checked before anything else, so a full gate is
    /// reported synchronously without spawning or recording anything. No
    /// failure notification is sent; the caller gets the error directly.
    pub async fn run_now(&self, task_id: &TaskId) -> Result<Execution, DispatchError> {
        let permit = match self.gate.admit() {
            Admission::Admitted(permit) => permit,
            Admission::Skipped { running, capacity } => {
                return Err(DispatchError::AdmissionDenied { running, capacity })
            }
            Admission::Closed => return Err(DispatchError::GateClosed),
        };

        let task = self.store.get_task(task_id).map_err(|e| match e {
            StoreError::NotFound { .. } => DispatchError::TaskNotFound(task_id.clone()),
            other => DispatchError::Store(other),
        })?;

        info!(task_id = %task.id, name = %task.name, "on-demand run");
        let RunOutcome { execution, error } = self.supervisor.execute(&task).await;
        let recorded = self.store.insert_execution(&execution);
        drop(permit);

        match (recorded, error) {
            (Ok(()), None) => Ok(execution),
            (Ok(()), Some(source)) => Err(DispatchError::RunFailed {
                execution: Box::new(execution),
                source,
            }),
            (Err(source), run_error) => Err(DispatchError::NotRecorded {
                execution: Box::new(execution),
                run_error,
                source,
            }),
        }
    }

    fn record_skip(&self, task: &Task) {
        let message = LogMessage::new(
            None,
            task.id.clone(),
            self.supervisor.clock().now(),
            LogLevel::Info,
            "concurrency limit reached; scheduled firing skipped",
        );
        self.supervisor.live().publish(message.clone());
        if let Err(e) = self.store.insert_log(&message.into()) {
            error!(task_id = %task.id, "failed to record skipped firing: {e}");
        }
    }
}

#[async_trait]
impl FireHandler for Dispatcher {
    async fn fire(&self, task: Task) {
        if let Err(e) = self.fire_scheduled(&task).await {
            error!(task_id = %task.id, "{e}");
        }
    }
}
