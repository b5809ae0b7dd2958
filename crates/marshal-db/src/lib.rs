//! Key/value stores for marshal.
//!
//! This crate provides the database facade used for devices and
//! parameters:
//! - A flat JSON file per store, rewritten atomically on every change
//! - `request`/`set`/`delete` operations
//! - Explicit change hooks invoked synchronously after each write

mod error;
mod flat_file;
mod hook;

pub use error::DbError;
pub use flat_file::FlatFileDb;
pub use hook::{Change, ChangeHook};
