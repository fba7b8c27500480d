use scriptguard_core::{CoreError, TaskId};
use scriptguard_scheduler::{DispatchError, NotifyError, SchedulerError};
use scriptguard_store::StoreError;
use thiserror::Error;

/// Errors surfaced by the service layer.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] CoreError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Schedule(#[from] SchedulerError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Notify(#[from] NotifyError),

    /// The row was written but no timer could be registered, so it was
    /// flipped to disabled.
    #[error("Task {task_id} was saved disabled because it could not be scheduled: {source}")]
    SavedDisabled {
        task_id: TaskId,
        #[source]
        source: SchedulerError,
    },
}

pub type Result<T> = std::result::Result<T, AppError>;
