//! Error types for state replication.

use thiserror::Error;

/// Errors that can occur while applying or routing diffs.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A diff arrived out of sequence.
    #[error("version gap: expected {expected}, got {got}")]
    Gap { expected: u64, got: u64 },

    /// A diff addressed a location that does not exist.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Unknown topic name.
    #[error("unknown topic: {0}")]
    UnknownTopic(String),
}
