//! Error types for the HTTP surface.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use marshal_db::DbError;
use marshal_master::MasterError;
use marshal_scheduler::SchedulerError;
use marshal_sync::SyncError;

/// Errors returned by HTTP handlers.
#[derive(Debug, Error)]
pub enum WebError {
    /// Request rejected by the coordinator.
    #[error(transparent)]
    Master(#[from] MasterError),

    /// Bad topic name.
    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl WebError {
    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            WebError::Master(MasterError::Scheduler(e)) => match e {
                SchedulerError::NotFound(_) | SchedulerError::PeriodicNotFound(_) => {
                    StatusCode::NOT_FOUND
                }
                SchedulerError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
                SchedulerError::InvalidState { .. } | SchedulerError::Conflict(_) => {
                    StatusCode::CONFLICT
                }
            },
            WebError::Master(MasterError::Db(e)) => match e {
                DbError::NotFound(_) => StatusCode::NOT_FOUND,
                DbError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
                DbError::Io(_) | DbError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            WebError::Master(MasterError::UnknownDatabase(_)) => StatusCode::NOT_FOUND,
            WebError::Master(MasterError::ChannelClosed | MasterError::ResponseDropped) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            WebError::Sync(SyncError::UnknownTopic(_)) => StatusCode::NOT_FOUND,
            WebError::Sync(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
