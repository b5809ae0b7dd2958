//! Server-Sent Events notification stream.
//!
//! `GET /notify/{topic}` opens a session on the topic. The first event is
//! `snapshot` carrying `{version, value}`; every later event is `diff`
//! carrying `{version, op, path, payload}` with the version as event id.
//! Closing the connection drops the session's queue, which the coordinator
//! notices on its next delivery.

use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, State},
    http::Method,
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tower_http::cors::{Any, CorsLayer};
use tracing::debug;

use marshal_sync::{Subscription, Topic};

use crate::{AppState, WebError};

/// Create the notification router.
pub fn create_notify_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET]);

    Router::new()
        .route("/notify/{topic}", get(notify))
        .layer(cors)
        .with_state(state)
}

async fn notify(
    State(state): State<Arc<AppState>>,
    Path(topic): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, WebError> {
    let topic: Topic = topic.parse()?;
    let subscription = state.master.subscribe(topic).await?;
    debug!(
        topic = %topic,
        session = subscription.session,
        version = subscription.snapshot.version,
        "notify stream opened"
    );
    Ok(Sse::new(event_stream(subscription)).keep_alive(KeepAlive::default()))
}

/// Turn a subscription into its event sequence: snapshot first, then diffs.
fn event_stream(subscription: Subscription) -> impl Stream<Item = Result<Event, axum::Error>> {
    let snapshot = Event::default()
        .event("snapshot")
        .json_data(&subscription.snapshot);
    let diffs = UnboundedReceiverStream::new(subscription.updates).map(|diff| {
        Event::default()
            .event("diff")
            .id(diff.version.to_string())
            .json_data(&diff)
    });
    tokio_stream::once(snapshot).chain(diffs)
}
