//! `scriptguard-core`: types shared by every scriptguard crate.
//!
//! Holds the task/execution/log data model, the fixed-offset Time Source and
//! the file configuration. Nothing in here touches the database or spawns
//! processes.

pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use clock::{format_timestamp, Clock, FixedOffsetClock, ManualClock, SharedClock};
pub use config::ScriptGuardConfig;
pub use error::{CoreError, Result};
pub use types::{
    Execution, ExecutionId, ExecutionStatus, LogEntry, LogLevel, LogMessage, Task, TaskId,
};
