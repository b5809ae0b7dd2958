//! Run scheduler for marshal.
//!
//! This crate provides the in-memory scheduling core:
//! - Runs ordered by priority, due time and id
//! - Named pipelines with at most one active run each
//! - Cooperative pause and delete, honoured at phase boundaries
//! - Periodic templates that resubmit runs, coalescing missed firings
//!
//! Nothing here performs I/O or keeps time; callers pass `now` explicitly.

mod error;
mod periodic;
mod queue;
mod scheduler;
mod types;

pub use error::SchedulerError;
pub use periodic::{Firing, PeriodicEntry, PeriodicSet};
pub use queue::RunQueue;
pub use scheduler::{Activation, Changes, Scheduler};
pub use types::{Experiment, Phase, Run, RunId, RunSpec, RunStatus};
