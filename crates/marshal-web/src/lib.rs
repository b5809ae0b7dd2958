//! Network surface for marshal.
//!
//! Two routers over one [`MasterHandle`](marshal_master::MasterHandle):
//! - Control: scheduler and store methods as JSON endpoints
//! - Notify: one Server-Sent Events stream per topic, a `snapshot` event
//!   followed by `diff` events in version order

mod error;
mod routes;
mod sse;

pub use error::WebError;
pub use routes::{AppState, create_control_router};
pub use sse::create_notify_router;
