//! Control routes.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    response::IntoResponse,
    routing::{get, post},
};
use serde::Serialize;
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;
use tracing::debug;

use marshal_master::{Database, MasterHandle};
use marshal_scheduler::{RunId, RunSpec};

use crate::WebError;

/// Shared state for both routers.
pub struct AppState {
    pub master: MasterHandle,
}

impl AppState {
    pub fn new(master: MasterHandle) -> Self {
        Self { master }
    }
}

/// Create the control router.
pub fn create_control_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/schedule/submit", post(submit))
        .route("/schedule/{id}/pause", post(pause))
        .route("/schedule/{id}/resume", post(resume))
        .route("/schedule/{id}/delete", post(delete))
        .route("/schedule/periodic/{id}/cancel", post(cancel_periodic))
        .route("/db/{store}/{key}", get(db_request).post(db_set))
        .route("/db/{store}/{key}/delete", post(db_delete))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

fn ack() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn submit(
    State(state): State<Arc<AppState>>,
    Json(spec): Json<RunSpec>,
) -> Result<Json<Value>, WebError> {
    debug!(pipeline = %spec.pipeline, file = %spec.experiment.file, "submit requested");
    let id = state.master.submit(spec).await?;
    Ok(Json(json!({ "id": id })))
}

async fn pause(
    State(state): State<Arc<AppState>>,
    Path(id): Path<RunId>,
) -> Result<Json<Value>, WebError> {
    state.master.pause(id).await?;
    Ok(ack())
}

async fn resume(
    State(state): State<Arc<AppState>>,
    Path(id): Path<RunId>,
) -> Result<Json<Value>, WebError> {
    state.master.resume(id).await?;
    Ok(ack())
}

async fn delete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<RunId>,
) -> Result<Json<Value>, WebError> {
    state.master.delete(id).await?;
    Ok(ack())
}

async fn cancel_periodic(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, WebError> {
    state.master.cancel_periodic(&id).await?;
    Ok(ack())
}

async fn db_request(
    State(state): State<Arc<AppState>>,
    Path((store, key)): Path<(String, String)>,
) -> Result<Json<Value>, WebError> {
    let db: Database = store.parse()?;
    let value = state.master.db_request(db, &key).await?;
    Ok(Json(json!({ "value": value })))
}

async fn db_set(
    State(state): State<Arc<AppState>>,
    Path((store, key)): Path<(String, String)>,
    Json(value): Json<Value>,
) -> Result<Json<Value>, WebError> {
    let db: Database = store.parse()?;
    state.master.db_set(db, &key, value).await?;
    Ok(ack())
}

async fn db_delete(
    State(state): State<Arc<AppState>>,
    Path((store, key)): Path<(String, String)>,
) -> Result<Json<Value>, WebError> {
    let db: Database = store.parse()?;
    let value = state.master.db_delete(db, &key).await?;
    Ok(Json(json!({ "value": value })))
}
