//! Common error types for tandem.

use thiserror::Error;

/// Top-level error type for tandem operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Remote host unreachable or the request failed in transit.
    #[error("Network error: {0}")]
    Network(String),

    /// A remote call exceeded its time budget.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// No valid credential, or the server rejected it.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Storage backend failure.
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

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Conflict detected.
    #[error("Conflict: {0}")]
    Conflict(String),
}

impl Error {
    /// Whether this failure means "the remote side is unusable right now".
    ///
    /// Malformed payloads count as connectivity failures: the caller falls
    /// back to local data instead of trusting a half-parsed response.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Error::Network(_) | Error::Timeout(_) | Error::Authentication(_) | Error::Serialization(_)
        )
    }

    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Timeout(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
