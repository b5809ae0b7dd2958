//! Canonical versioned topic values.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

use crate::{Mod, Topic, compute_mods};

/// Full copy of a topic at a given version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u64,
    pub value: Value,
}

/// A modification tagged with the topic version it produces.
///
/// Applying the diff with version `v` to the value at version `v - 1`
/// yields the value at version `v`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diff {
    pub version: u64,
    #[serde(flatten)]
    pub change: Mod,
}

#[derive(Debug)]
struct TopicState {
    value: Value,
    version: u64,
}

/// Holds the canonical value of every topic.
///
/// Only the coordination context mutates a store, so reading a snapshot
/// is always consistent with the diffs already handed out.
#[derive(Debug)]
pub struct StateStore {
    topics: HashMap<Topic, TopicState>,
}

impl StateStore {
    /// Create a store with every topic at version 0 holding its initial value.
    pub fn new() -> Self {
        let topics = Topic::ALL
            .into_iter()
            .map(|topic| {
                let state = TopicState {
                    value: topic.initial_value(),
                    version: 0,
                };
                (topic, state)
            })
            .collect();
        Self { topics }
    }

    /// Current value and version of a topic.
    pub fn snapshot(&self, topic: Topic) -> Snapshot {
        let state = self.state(topic);
        Snapshot {
            version: state.version,
            value: state.value.clone(),
        }
    }

    /// Current version of a topic.
    pub fn version(&self, topic: Topic) -> u64 {
        self.state(topic).version
    }

    /// Current value of a topic.
    pub fn value(&self, topic: Topic) -> &Value {
        &self.state(topic).value
    }

    /// Replace a topic's value, returning the versioned diffs that describe
    /// the change. Returns an empty list when nothing changed.
    pub fn update(&mut self, topic: Topic, new_value: Value) -> Vec<Diff> {
        let state = self
            .topics
            .entry(topic)
            .or_insert_with(|| TopicState {
                value: topic.initial_value(),
                version: 0,
            });

        let mods = compute_mods(&state.value, &new_value);
        let mut diffs = Vec::with_capacity(mods.len());
        for change in mods {
            if let Err(e) = change.apply(&mut state.value) {
                panic!("computed diff for topic {topic} does not apply: {e}");
            }
            state.version += 1;
            trace!(topic = %topic, version = state.version, op = ?change.op, "topic modified");
            diffs.push(Diff {
                version: state.version,
                change,
            });
        }
        debug_assert_eq!(state.value, new_value);
        diffs
    }

    fn state(&self, topic: Topic) -> &TopicState {
        // Every topic is populated in `new`
        &self.topics[&topic]
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}
