//! Periodic submission templates.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::MAX_REPEAT_SECS;
use crate::{Experiment, RunSpec, SchedulerError};

/// A template that spawns a run every `interval_secs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodicEntry {
    pub id: String,
    pub pipeline: String,
    pub experiment: Experiment,
    pub priority: i32,
    pub arguments: Value,
    pub interval_secs: u64,
    pub next_due: DateTime<Utc>,
}

impl PeriodicEntry {
    pub fn interval(&self) -> TimeDelta {
        TimeDelta::seconds(self.interval_secs.clamp(1, MAX_REPEAT_SECS) as i64)
    }

    /// Spec for the runs this template spawns.
    pub fn run_spec(&self) -> RunSpec {
        RunSpec {
            pipeline: self.pipeline.clone(),
            experiment: self.experiment.clone(),
            priority: self.priority,
            due: None,
            arguments: self.arguments.clone(),
            repeat_secs: Some(self.interval_secs),
            periodic_id: Some(self.id.clone()),
        }
    }
}

/// One firing of a periodic entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Firing {
    pub entry: PeriodicEntry,
    /// The scheduled slot this firing stands for.
    pub slot: DateTime<Utc>,
}

/// Periodic entries ordered by next-due time.
///
/// The heap may hold stale items for entries that were rescheduled or
/// removed; an item is live only while it matches its entry's `next_due`.
#[derive(Debug, Default)]
pub struct PeriodicSet {
    entries: HashMap<String, PeriodicEntry>,
    heap: BinaryHeap<Reverse<(DateTime<Utc>, String)>>,
}

impl PeriodicSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: PeriodicEntry) -> Result<(), SchedulerError> {
        if self.entries.contains_key(&entry.id) {
            return Err(SchedulerError::Conflict(entry.id));
        }
        self.heap.push(Reverse((entry.next_due, entry.id.clone())));
        self.entries.insert(entry.id.clone(), entry);
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> Option<PeriodicEntry> {
        self.entries.remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&PeriodicEntry> {
        self.entries.get(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Earliest next-due time among live entries.
    pub fn next_due(&mut self) -> Option<DateTime<Utc>> {
        self.discard_stale();
        self.heap.peek().map(|Reverse((due, _))| *due)
    }

    /// Fire every entry due at `now`.
    ///
    /// Each due entry fires once even if several intervals elapsed; its
    /// next-due time moves to the first slot after `now`.
    pub fn fire(&mut self, now: DateTime<Utc>) -> Vec<Firing> {
        let mut firings = Vec::new();
        loop {
            self.discard_stale();
            let due = match self.heap.peek() {
                Some(Reverse((due, _))) if *due <= now => *due,
                _ => break,
            };
            let Some(Reverse((_, id))) = self.heap.pop() else {
                break;
            };
            let Some(entry) = self.entries.get_mut(&id) else {
                continue;
            };

            let interval = entry.interval();
            let step = interval.num_milliseconds().max(1);
            let missed = (now - due).num_milliseconds() / step;
            let slot = due + TimeDelta::milliseconds(missed.saturating_mul(step));
            entry.next_due = slot + interval;

            self.heap.push(Reverse((entry.next_due, id)));
            firings.push(Firing {
                entry: entry.clone(),
                slot,
            });
        }
        firings
    }

    /// Published form: a map from template id to entry.
    pub fn to_value(&self) -> Value {
        Value::Object(
            self.entries
                .iter()
                .map(|(id, entry)| {
                    // Only string-keyed maps and plain fields: cannot fail
                    let value =
                        serde_json::to_value(entry).expect("periodic entry serializes to JSON");
                    (id.clone(), value)
                })
                .collect(),
        )
    }

    fn discard_stale(&mut self) {
        while let Some(Reverse((due, id))) = self.heap.peek() {
            match self.entries.get(id) {
                Some(entry) if entry.next_due == *due => break,
                _ => {
                    self.heap.pop();
                }
            }
        }
    }
}
