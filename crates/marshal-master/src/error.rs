//! Error types for the coordinator.

use thiserror::Error;

use marshal_db::DbError;
use marshal_scheduler::SchedulerError;

/// Errors returned by coordinator requests.
#[derive(Debug, Error)]
pub enum MasterError {
    /// Scheduler rejected the request.
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// Key/value store rejected the request.
    #[error(transparent)]
    Db(#[from] DbError),

    /// No store with this name.
    #[error("unknown database: {0}")]
    UnknownDatabase(String),

    /// The coordinator is no longer accepting requests.
    #[error("coordinator channel closed")]
    ChannelClosed,

    /// The coordinator stopped before answering.
    #[error("coordinator response dropped")]
    ResponseDropped,
}
