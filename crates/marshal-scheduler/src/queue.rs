//! Run queue with per-pipeline occupancy.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::{Phase, Run, RunId, RunStatus};

/// Ordered collection of runs.
///
/// Tracks which run, if any, occupies each pipeline. Activating a run on
/// a pipeline that is already occupied is a defect and panics.
#[derive(Debug, Default)]
pub struct RunQueue {
    runs: BTreeMap<RunId, Run>,
    active: HashMap<String, RunId>,
}

impl RunQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, run: Run) {
        debug_assert!(!run.status.is_active(), "runs enter the queue inactive");
        self.runs.insert(run.id, run);
    }

    pub fn get(&self, id: RunId) -> Option<&Run> {
        self.runs.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: RunId) -> Option<&mut Run> {
        self.runs.get_mut(&id)
    }

    /// Remove a run, freeing its pipeline if it held it.
    pub fn remove(&mut self, id: RunId) -> Option<Run> {
        let run = self.runs.remove(&id)?;
        if self.active.get(&run.pipeline) == Some(&id) {
            self.active.remove(&run.pipeline);
        }
        Some(run)
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Runs in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Run> {
        self.runs.values()
    }

    /// Run currently occupying `pipeline`.
    pub fn active_run(&self, pipeline: &str) -> Option<RunId> {
        self.active.get(pipeline).copied()
    }

    /// Pipelines that have at least one run waiting to start.
    pub fn pipelines_with_pending(&self) -> BTreeSet<&str> {
        self.runs
            .values()
            .filter(|run| run.status == RunStatus::Pending)
            .map(|run| run.pipeline.as_str())
            .collect()
    }

    /// Best ready run for `pipeline`: highest priority, then earliest due,
    /// then lowest id.
    pub fn next_ready(&self, pipeline: &str, now: DateTime<Utc>) -> Option<RunId> {
        self.runs
            .values()
            .filter(|run| run.pipeline == pipeline && run.is_ready(now))
            .min_by_key(|run| run.selection_key())
            .map(|run| run.id)
    }

    /// Earliest due time among pending runs that are not ready yet.
    pub fn next_due_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.runs
            .values()
            .filter(|run| run.status == RunStatus::Pending && run.due > now)
            .map(|run| run.due)
            .min()
    }

    /// Put a run on its pipeline in the given phase.
    pub(crate) fn activate(&mut self, id: RunId, phase: Phase) -> Option<&Run> {
        let run = self.runs.get_mut(&id)?;
        if let Some(holder) = self.active.get(&run.pipeline) {
            panic!(
                "pipeline {} already occupied by run {holder}, refusing to activate run {id}",
                run.pipeline
            );
        }
        run.status = phase.status();
        self.active.insert(run.pipeline.clone(), id);
        Some(run)
    }

    /// Free the pipeline held by `id`.
    pub(crate) fn release(&mut self, id: RunId) {
        if let Some(run) = self.runs.get(&id)
            && self.active.get(&run.pipeline) == Some(&id)
        {
            self.active.remove(&run.pipeline);
        }
    }

    /// Remove every run that reached an outcome.
    pub fn expire_terminal(&mut self) -> Vec<Run> {
        let expired: Vec<RunId> = self
            .runs
            .values()
            .filter(|run| run.status.is_terminal())
            .map(|run| run.id)
            .collect();
        expired.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    /// Published form: a map from run id to run.
    pub fn to_value(&self) -> Value {
        Value::Object(
            self.runs
                .iter()
                .map(|(id, run)| {
                    // Only string-keyed maps and plain fields: cannot fail
                    let value = serde_json::to_value(run).expect("run serializes to JSON");
                    (id.to_string(), value)
                })
                .collect(),
        )
    }
}
