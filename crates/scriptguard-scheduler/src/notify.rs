use async_trait::async_trait;
use scriptguard_core::{Execution, ExecutionId, Task, TaskId};

use crate::error::NotifyError;

/// Everything a failure notification carries.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureNotice {
    pub task_id: TaskId,
    pub task_name: String,
    pub script_path: String,
    pub env: String,
    pub execution_id: ExecutionId,
    pub error: String,
}

impl FailureNotice {
    pub fn new(task: &Task, execution: &Execution, error: impl Into<String>) -> Self {
        Self {
            task_id: task.id.clone(),
            task_name: task.name.clone(),
            script_path: task.script_path.clone(),
            env: task.env.clone(),
            execution_id: execution.id.clone(),
            error: error.into(),
        }
    }

    /// Plain-text body used by the chat webhooks.
    pub fn message(&self) -> String {
        format!(
            "[ScriptGuard] task failed\n\
             Task: {}\n\
             Script: {}\n\
             Environment: {}\n\
             Error: {}\n\
             Execution: {}",
            self.task_name, self.script_path, self.env, self.error, self.execution_id
        )
    }
}

/// Outbound failure notification. Called at most once per failed scheduled
/// run, and only when the task opted in.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_failure(&self, notice: &FailureNotice) -> Result<(), NotifyError>;
}

/// Discards every notice.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify_failure(&self, _notice: &FailureNotice) -> Result<(), NotifyError> {
        Ok(())
    }
}
