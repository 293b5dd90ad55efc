//! Error types for the pump_core library.

use std::io;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for pump_core operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The device did not acknowledge a command. Retryable by the caller.
    #[error("Communication failure: {0}")]
    Communication(String),

    /// The command is invalid for the current pump state
    #[error("Device state error: {0}")]
    DeviceState(String),

    /// Caller-supplied parameters are out of the supported range
    #[error("Validation error: {0}")]
    Validation(String),

    /// The delegate rejected or failed to record reported data
    #[error("Delegate error: {0}")]
    Delegate(String),

    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Persisted state could not be restored
    #[error("State error: {0}")]
    State(String),
}

impl Error {
    /// Whether retrying the same command without changing pump state may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Communication(_))
    }
}
