//! Error types for the scheduler.

use thiserror::Error;

use crate::{RunId, RunStatus};

/// Errors that can occur in scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Run not found.
    #[error("run not found: {0}")]
    NotFound(RunId),

    /// Malformed submission.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation not valid for the run's current status.
    #[error("cannot {operation} run {id} while it is {status}")]
    InvalidState {
        id: RunId,
        status: RunStatus,
        operation: &'static str,
    },

    /// Periodic template id already registered.
    #[error("periodic entry already exists: {0}")]
    Conflict(String),

    /// Periodic template not found.
    #[error("periodic entry not found: {0}")]
    PeriodicNotFound(String),
}
