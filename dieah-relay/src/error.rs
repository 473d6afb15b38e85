//! Error types for dieah-relay

use thiserror::Error;

/// Result type alias for dieah-relay operations
pub type Result<T> = std::result::Result<T, Error>;

/// Local errors. These are the only errors the capture path ever surfaces.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid status transition: {0}")]
    InvalidTransition(String),
}

impl Error {
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn invalid_transition(msg: impl Into<String>) -> Self {
        Self::InvalidTransition(msg.into())
    }
}

/// A failure reported by (or on the way to) the memory worker
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Network trouble, timeouts, 5xx. Worth retrying later.
    #[error("transient remote error: {0}")]
    Transient(String),

    /// The worker answered but rejected the request (4xx, malformed payload)
    #[error("permanent remote error: {0}")]
    Permanent(String),
}

impl RemoteError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Outcome of a call made through the circuit breaker
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// The breaker rejected the call without attempting it
    #[error("short-circuited: memory worker breaker is open")]
    ShortCircuited,

    #[error(transparent)]
    Remote(#[from] RemoteError),
}
