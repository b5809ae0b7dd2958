//! Error types for the key/value stores.

use thiserror::Error;

/// Errors that can occur in database operations.
#[derive(Debug, Error)]
pub enum DbError {
    /// Key not present.
    #[error("key not found: {0}")]
    NotFound(String),

    /// Malformed key or value.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
