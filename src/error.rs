//! Error types for the cluster server.

use thiserror::Error;

/// Main error type for the cluster server.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors (bad values, unusable database paths)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network errors (bind failures, backend transport)
    #[error("Network error: {0}")]
    Network(String),

    /// Protocol errors (malformed upstream responses, bad frames)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Work validation errors (bad header length, bad mask)
    #[error("Work error: {0}")]
    Work(String),

    /// Storage errors
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// JSON parsing errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type alias for the cluster server.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a network error
    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a work validation error
    pub fn work(msg: impl Into<String>) -> Self {
        Self::Work(msg.into())
    }
}
