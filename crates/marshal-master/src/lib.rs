//! Coordination context for marshal.
//!
//! A single actor owns every piece of mutable state: the scheduler, the
//! published topics, the subscriber sessions, both key/value stores and the
//! parameter history. Everything else talks to it through [`MasterHandle`].
//!
//! Run phases execute outside the actor on a [`PhaseExecutor`]; their
//! completion comes back as a message and is applied as a phase boundary.

mod config;
mod coordinator;
mod database;
mod error;
mod executor;

pub use config::{DEFAULT_HISTORY_CAPACITY, MasterConfig};
pub use coordinator::{Master, MasterHandle, MasterOp};
pub use database::Database;
pub use error::MasterError;
pub use executor::{PhaseExecutor, command_executor, noop_executor};
