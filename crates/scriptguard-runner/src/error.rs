//! Error types for the scriptguard-runner crate.

use thiserror::Error;

/// Why a run did not succeed.
///
/// The `Display` text is what ends up in `Execution.error_message`, so each
/// variant reads as an operator-facing sentence.
#[derive(Debug, Error)]
pub enum RunError {
    /// The interpreter process (or its pipes) could not be created.
    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The script ran to completion with a non-zero status.
    #[error("script exited with status {code}")]
    NonZeroExit { code: i32 },

    /// The run exceeded its deadline and was killed.
    #[error("execution timed out after {secs}s and was killed")]
    Timeout { secs: u64 },

    /// Waiting on the child failed.
    #[error("I/O error while supervising script: {0}")]
    Io(#[from] std::io::Error),
}

impl RunError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RunError::Timeout { .. })
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, RunError>;
