use scriptguard_core::{Execution, TaskId};
use scriptguard_runner::RunError;
use scriptguard_store::StoreError;
use thiserror::Error;

/// Errors from cron validation and timer registration.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The expression could not be parsed.
    #[error("Invalid cron expression {expression:?}: {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("Duplicate cron expression {expression:?}")]
    DuplicateCron { expression: String },

    #[error("Too many cron expressions: {count} (at most {max})")]
    TooManyCrons { count: usize, max: usize },

    #[error("At least one cron expression is required")]
    EmptyCronSet,

    /// `add` was called after [`Scheduler::stop`](crate::Scheduler::stop).
    #[error("Scheduler is shut down")]
    ShutDown,
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Errors surfaced by the firing and on-demand paths.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Every slot of the Concurrency Gate is taken. Not a task failure.
    #[error("Concurrency limit reached ({running}/{capacity} runs in progress)")]
    AdmissionDenied { running: usize, capacity: usize },

    #[error("Scheduler is shutting down; no new runs are admitted")]
    GateClosed,

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The run finished, was recorded, and failed.
    #[error("Run {} failed: {source}", .execution.id)]
    RunFailed {
        execution: Box<Execution>,
        source: RunError,
    },

    /// The run finished but its Execution could not be persisted.
    #[error(
        "Run {} {} but could not be recorded: {source}",
        .execution.id,
        describe_run(.run_error)
    )]
    NotRecorded {
        execution: Box<Execution>,
        run_error: Option<RunError>,
        source: StoreError,
    },
}

impl DispatchError {
    /// The finished execution, when the run got that far.
    pub fn execution(&self) -> Option<&Execution> {
        match self {
            DispatchError::RunFailed { execution, .. }
            | DispatchError::NotRecorded { execution, .. } => Some(execution),
            _ => None,
        }
    }
}

fn describe_run(run_error: &Option<RunError>) -> String {
    match run_error {
        None => "succeeded".to_string(),
        Some(e) => format!("failed ({e})"),
    }
}

/// Failure delivering a notification.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("No webhook configured for {0}")]
    NotConfigured(String),

    #[error("Notification request failed: {0}")]
    Request(String),

    #[error("Webhook returned {status}: {body}")]
    Rejected { status: u16, body: String },
}
