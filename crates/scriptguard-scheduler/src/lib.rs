//! `scriptguard-scheduler`: cron timers, admission control and dispatch.
//!
//! # Overview
//!
//! The [`Scheduler`] keeps one Tokio timer per cron expression of every
//! enabled task. When a timer fires it hands the task to a [`FireHandler`];
//! in production that is the [`Dispatcher`], which asks the
//! [`ConcurrencyGate`] for admission, runs the script through the
//! [`Supervisor`](scriptguard_runner::Supervisor), records the
//! [`Execution`](scriptguard_core::Execution) and notifies on failure.
//!
//! | Firing outcome | What is recorded                                  |
//! |----------------|---------------------------------------------------|
//! | Admitted       | One Execution row plus its log entries            |
//! | Skipped        | One `info` log entry with no execution id         |
//! | Closed         | Nothing; the scheduler is shutting down           |

pub mod dispatch;
pub mod engine;
pub mod error;
pub mod gate;
pub mod notify;
pub mod schedule;

pub use dispatch::{Dispatcher, Firing};
pub use engine::{FireHandler, Scheduler};
pub use error::{DispatchError, NotifyError, Result, SchedulerError};
pub use gate::{Admission, ConcurrencyGate, GatePermit};
pub use notify::{FailureNotice, NoopNotifier, Notifier};
pub use schedule::{validate_expressions, CronSchedule, Wake};
