//! `scriptguard-store`: SQLite persistence for tasks, executions, log
//! entries and the runtime key-value config.
//!
//! The rest of the workspace talks to the [`Store`] trait; [`SqliteStore`]
//! is the production implementation. All calls are synchronous and either
//! happen or don't; there are no multi-call transactions.

pub mod db;
pub mod error;
pub mod store;

pub use error::{Result, StoreError};
pub use store::{LogFilter, PurgeReport, SqliteStore, Store, MAX_QUERY_LIMIT};
