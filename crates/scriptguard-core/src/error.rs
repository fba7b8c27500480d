use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// The config file or environment could not be read or deserialised.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A config value was readable but out of range.
    #[error("Invalid value for {key}: {reason}")]
    InvalidConfig { key: String, reason: String },

    /// A UTC offset string such as "+08:00" could not be parsed.
    #[error("Invalid UTC offset: {0}")]
    InvalidOffset(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        CoreError::InvalidConfig {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
