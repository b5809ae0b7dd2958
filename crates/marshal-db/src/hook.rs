//! Change notification for key/value stores.

use serde_json::Value;

/// A committed change to a store.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Set { key: String, value: Value },
    Delete { key: String },
}

/// Observer of store changes.
///
/// Hooks run synchronously inside the write that triggered them, after the
/// change has been persisted.
pub trait ChangeHook: Send {
    fn on_change(&mut self, change: &Change);
}

impl<F> ChangeHook for F
where
    F: FnMut(&Change) + Send,
{
    fn on_change(&mut self, change: &Change) {
        self(change)
    }
}
