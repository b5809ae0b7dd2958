//! Structured-state replication for marshal.
//!
//! This crate provides:
//! - Named topics holding canonical JSON values with a version counter
//! - Minimal path-addressed diffs (`set`, `insert`, `delete`, `append`)
//! - A publisher that hands out atomic snapshots and fans out ordered diffs
//! - A bounded history of parameter writes
//! - A client-side mirror that applies diffs and detects gaps

mod diff;
mod error;
mod history;
mod mirror;
mod publisher;
mod store;
mod topic;

pub use diff::{Mod, Op, PathSegment, compute_mods};
pub use error::SyncError;
pub use history::{HistoryBuffer, HistoryEntry};
pub use mirror::Mirror;
pub use publisher::{Publisher, SessionId, Subscription};
pub use store::{Diff, Snapshot, StateStore};
pub use topic::Topic;
