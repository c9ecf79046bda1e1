//! Common error types for Offsync.

use thiserror::Error;

/// Top-level error type for Offsync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The persistent store could not be opened or prepared. Fatal.
    #[error("Initialization error: {0}")]
    Initialization(String),

    /// Non-success response or transport failure.
    #[error("Network error: {0}")]
    Network(String),

    /// A request did not settle before its deadline.
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// The device is offline.
    #[error("Offline: {0}")]
    Offline(String),

    /// A conflict could not be resolved automatically.
    #[error("Manual conflict resolution required: {0}")]
    ManualResolutionRequired(String),

    /// A local read or write against the store failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A status change that would move an action out of a terminal state.
    #[error("Invalid status transition: {0}")]
    InvalidTransition(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Another sync pass is already running on this engine.
    #[error("Sync already in progress")]
    SyncInProgress,

    /// The engine has been shut down.
    #[error("Shut down: {0}")]
    Shutdown(String),
}

impl Error {
    /// Whether a failed sync attempt with this error may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Timeout(_) | Error::Io(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
