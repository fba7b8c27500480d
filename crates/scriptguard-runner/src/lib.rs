//! scriptguard-runner: runs one script to completion and captures its output.
//!
//! - [`Supervisor`]: spawns the interpreter, enforces the run timeout and
//!   finalises the [`Execution`](scriptguard_core::Execution).
//! - [`LineReader`]: bounded line reader that never stops draining a pipe.
//! - [`LogPipeline`]: per-run bounded queue plus batching writer.
//! - [`LiveLog`]: best-effort broadcast of log lines to live subscribers.

pub mod error;
pub mod line;
pub mod live;
pub mod pipeline;
pub mod supervisor;

pub use error::{Result, RunError};
pub use line::{LineReader, TRUNCATION_MARKER};
pub use live::LiveLog;
pub use pipeline::{DropCounts, LogPipeline, LogSink, PipelineSettings};
pub use supervisor::{RunOutcome, Supervisor, SupervisorSettings};
