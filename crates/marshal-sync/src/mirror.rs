//! Client-side replica of a topic.

use serde_json::Value;

use crate::{Diff, Snapshot, SyncError};

/// Local copy of a topic kept current by applying diffs in order.
///
/// Any gap in the version sequence is reported as [`SyncError::Gap`];
/// the owner must then resubscribe and start over from a fresh snapshot.
#[derive(Debug, Clone)]
pub struct Mirror {
    version: u64,
    value: Value,
}

impl Mirror {
    pub fn new(snapshot: Snapshot) -> Self {
        Self {
            version: snapshot.version,
            value: snapshot.value,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Apply the next diff. The mirror is left untouched on error.
    pub fn apply(&mut self, diff: &Diff) -> Result<(), SyncError> {
        let expected = self.version + 1;
        if diff.version != expected {
            return Err(SyncError::Gap {
                expected,
                got: diff.version,
            });
        }

        let mut next = self.value.clone();
        diff.change.apply(&mut next)?;
        self.value = next;
        self.version = diff.version;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{StateStore, Topic};
    use serde_json::json;

    #[test]
    fn test_follows_store() {
        let mut store = StateStore::new();
        store.update(Topic::Devices, json!({"ttl0": {"type": "ttl"}}));
        let mut mirror = Mirror::new(store.snapshot(Topic::Devices));

        let diffs = store.update(Topic::Devices, json!({"ttl1": {"type": "ttl"}}));
        for diff in &diffs {
            mirror.apply(diff).unwrap();
        }
        assert_eq!(mirror.value(), store.value(Topic::Devices));
        assert_eq!(mirror.version(), store.version(Topic::Devices));
    }

    #[test]
    fn test_rejects_gap_and_duplicate() {
        let mut store = StateStore::new();
        let mut mirror = Mirror::new(store.snapshot(Topic::Parameters));
        let diffs = store.update(Topic::Parameters, json!({"a": 1, "b": 2}));

        let err = mirror.apply(&diffs[1]).unwrap_err();
        assert!(matches!(err, SyncError::Gap { expected: 1, got: 2 }));

        mirror.apply(&diffs[0]).unwrap();
        let err = mirror.apply(&diffs[0]).unwrap_err();
        assert!(matches!(err, SyncError::Gap { expected: 2, got: 1 }));
        assert_eq!(mirror.value(), &json!({"a": 1}));
    }
}
