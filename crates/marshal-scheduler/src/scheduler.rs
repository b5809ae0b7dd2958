//! The scheduler state machine.
//!
//! All mutation of the run queue and the periodic set passes through
//! [`Scheduler`]. It performs no I/O and never reads the clock itself:
//! every time-dependent operation takes `now` from its caller, which keeps
//! the owner in charge of wake-ups and makes every transition replayable.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    PeriodicEntry, PeriodicSet, Phase, Run, RunId, RunQueue, RunSpec, RunStatus, SchedulerError,
};

/// A run that was just put on its pipeline, and the phase to execute.
#[derive(Debug, Clone, PartialEq)]
pub struct Activation {
    pub run: Run,
    pub phase: Phase,
}

/// Which published collections changed since the last [`Scheduler::take_changes`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Changes {
    pub queue: bool,
    pub periodic: bool,
}

/// Single authority over runs and periodic templates.
#[derive(Debug, Default)]
pub struct Scheduler {
    queue: RunQueue,
    periodic: PeriodicSet,
    next_run_id: RunId,
    next_periodic: u64,
    changes: Changes,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a run. A spec with a repeat interval also registers a
    /// periodic template whose first firing is one interval after `due`.
    #[tracing::instrument(skip(self, spec), fields(pipeline = %spec.pipeline))]
    pub fn submit(
        &mut self,
        mut spec: RunSpec,
        now: DateTime<Utc>,
    ) -> Result<RunId, SchedulerError> {
        spec.validate()?;
        let due = spec.due.unwrap_or(now);

        if let Some(interval_secs) = spec.repeat_secs {
            let template_id = match spec.periodic_id.take() {
                Some(id) if self.periodic.contains(&id) => return Err(SchedulerError::Conflict(id)),
                Some(id) => id,
                None => self.allocate_periodic_id(),
            };
            let mut entry = PeriodicEntry {
                id: template_id.clone(),
                pipeline: spec.pipeline.clone(),
                experiment: spec.experiment.clone(),
                priority: spec.priority,
                arguments: spec.arguments.clone(),
                interval_secs,
                next_due: due,
            };
            entry.next_due = due + entry.interval();
            info!(
                periodic_id = %template_id,
                interval_secs,
                next_due = %entry.next_due,
                "periodic entry registered"
            );
            self.periodic.insert(entry)?;
            self.changes.periodic = true;
            spec.periodic_id = Some(template_id);
        }

        let id = self.allocate_run_id();
        self.queue.insert(Run::from_spec(id, &spec, due));
        self.changes.queue = true;
        info!(run_id = id, priority = spec.priority, %due, "run submitted");
        Ok(id)
    }

    /// Pause a run. Pending runs pause at once; active runs pause at
    /// their next phase boundary.
    #[tracing::instrument(skip(self))]
    pub fn pause(&mut self, id: RunId) -> Result<(), SchedulerError> {
        let run = self.queue.get_mut(id).ok_or(SchedulerError::NotFound(id))?;
        match run.status {
            RunStatus::Pending => {
                run.status = RunStatus::Paused;
                self.changes.queue = true;
                info!(run_id = id, "run paused");
                Ok(())
            }
            RunStatus::Preparing | RunStatus::Running | RunStatus::Analyzing
                if !run.pause_requested =>
            {
                run.pause_requested = true;
                self.changes.queue = true;
                info!(run_id = id, status = %run.status, "pause requested");
                Ok(())
            }
            _ => Err(SchedulerError::InvalidState {
                id,
                status: run.status.clone(),
                operation: "pause",
            }),
        }
    }

    /// Return a paused run to the pending pool keeping its priority and due time.
    #[tracing::instrument(skip(self))]
    pub fn resume(&mut self, id: RunId) -> Result<(), SchedulerError> {
        let run = self.queue.get_mut(id).ok_or(SchedulerError::NotFound(id))?;
        if run.status != RunStatus::Paused {
            return Err(SchedulerError::InvalidState {
                id,
                status: run.status.clone(),
                operation: "resume",
            });
        }
        run.status = RunStatus::Pending;
        self.changes.queue = true;
        info!(run_id = id, resume_at = ?run.resume_at, "run resumed");
        Ok(())
    }

    /// Delete a run. Inactive runs go at once; active runs are marked
    /// `deleting` and leave at their next phase boundary.
    #[tracing::instrument(skip(self))]
    pub fn delete(&mut self, id: RunId) -> Result<(), SchedulerError> {
        let run = self.queue.get_mut(id).ok_or(SchedulerError::NotFound(id))?;
        match run.status {
            RunStatus::Pending | RunStatus::Paused => {
                self.queue.remove(id);
                self.changes.queue = true;
                info!(run_id = id, "run deleted");
            }
            RunStatus::Preparing | RunStatus::Running | RunStatus::Analyzing => {
                run.status = RunStatus::Deleting;
                self.changes.queue = true;
                info!(run_id = id, "run marked for deletion");
            }
            // Already leaving
            _ => {}
        }
        Ok(())
    }

    /// Remove a periodic template. Runs it already spawned are unaffected.
    #[tracing::instrument(skip(self))]
    pub fn cancel_periodic(&mut self, id: &str) -> Result<PeriodicEntry, SchedulerError> {
        let entry = self
            .periodic
            .remove(id)
            .ok_or_else(|| SchedulerError::PeriodicNotFound(id.to_string()))?;
        self.changes.periodic = true;
        info!(periodic_id = id, "periodic entry cancelled");
        Ok(entry)
    }

    /// Advance the scheduler to `now`.
    ///
    /// Expires runs that reached an outcome, fires due periodic templates,
    /// then starts the best ready run on every idle pipeline.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<Activation> {
        for run in self.queue.expire_terminal() {
            debug!(run_id = run.id, status = %run.status, "run expired");
            self.changes.queue = true;
        }

        for firing in self.periodic.fire(now) {
            self.changes.queue = true;
            self.changes.periodic = true;
            let spec = firing.entry.run_spec();
            let id = self.allocate_run_id();
            self.queue.insert(Run::from_spec(id, &spec, firing.slot));
            info!(
                run_id = id,
                periodic_id = %firing.entry.id,
                slot = %firing.slot,
                "periodic run spawned"
            );
        }

        let idle: Vec<String> = self
            .queue
            .pipelines_with_pending()
            .into_iter()
            .filter(|pipeline| self.queue.active_run(pipeline).is_none())
            .map(str::to_string)
            .collect();

        let mut activations = Vec::new();
        for pipeline in idle {
            let Some(id) = self.queue.next_ready(&pipeline, now) else {
                continue;
            };
            if let Some(activation) = self.activate(id) {
                activations.push(activation);
            }
        }
        activations
    }

    /// Record that `phase` of run `id` ended.
    ///
    /// This is the phase boundary: pending deletions and pauses take effect
    /// here. Returns the next phase to execute if the run keeps its pipeline.
    #[tracing::instrument(skip(self, outcome))]
    pub fn phase_finished(
        &mut self,
        id: RunId,
        phase: Phase,
        outcome: Result<(), String>,
    ) -> Option<Activation> {
        let Some(run) = self.queue.get_mut(id) else {
            warn!(run_id = id, "phase finished for unknown run");
            return None;
        };
        if run.status != phase.status() && run.status != RunStatus::Deleting {
            warn!(run_id = id, status = %run.status, "stale phase completion ignored");
            return None;
        }

        self.changes.queue = true;
        let next = if run.status == RunStatus::Deleting {
            run.status = RunStatus::Deleted;
            info!(run_id = id, "run deleted at phase boundary");
            None
        } else if let Err(error) = outcome {
            warn!(run_id = id, %error, "run failed");
            run.status = RunStatus::Failed { error };
            None
        } else {
            match phase.next() {
                None => {
                    run.status = RunStatus::Completed;
                    info!(run_id = id, "run completed");
                    None
                }
                Some(next) if run.pause_requested => {
                    run.pause_requested = false;
                    run.resume_at = Some(next);
                    run.status = RunStatus::Paused;
                    info!(run_id = id, resume_at = %next, "run paused at phase boundary");
                    None
                }
                Some(next) => {
                    run.status = next.status();
                    debug!(run_id = id, phase = %next, "run advanced");
                    Some(Activation {
                        run: run.clone(),
                        phase: next,
                    })
                }
            }
        };

        if next.is_none() {
            self.queue.release(id);
        }
        next
    }

    pub fn queue(&self) -> &RunQueue {
        &self.queue
    }

    pub fn periodic(&self) -> &PeriodicSet {
        &self.periodic
    }

    /// Report what changed since the previous call, and reset.
    pub fn take_changes(&mut self) -> Changes {
        std::mem::take(&mut self.changes)
    }

    /// Earliest future time at which `tick` could change anything.
    pub fn next_wakeup(&mut self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let periodic = self.periodic.next_due();
        let pending = self.queue.next_due_after(now);
        match (periodic, pending) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Published form of the run queue.
    pub fn queue_value(&self) -> Value {
        self.queue.to_value()
    }

    /// Published form of the periodic templates.
    pub fn periodic_value(&self) -> Value {
        self.periodic.to_value()
    }

    fn activate(&mut self, id: RunId) -> Option<Activation> {
        let phase = self.queue.get_mut(id)?.resume_at.take().unwrap_or(Phase::Prepare);
        let run = self.queue.activate(id, phase)?;
        self.changes.queue = true;
        info!(run_id = id, pipeline = %run.pipeline, %phase, "run activated");
        Some(Activation {
            run: run.clone(),
            phase,
        })
    }

    fn allocate_run_id(&mut self) -> RunId {
        let id = self.next_run_id;
        self.next_run_id += 1;
        id
    }

    fn allocate_periodic_id(&mut self) -> String {
        loop {
            let id = format!("periodic-{}", self.next_periodic);
            self.next_periodic += 1;
            if !self.periodic.contains(&id) {
                return id;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Experiment;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn spec(pipeline: &str, priority: i32) -> RunSpec {
        RunSpec::new(pipeline, Experiment::new("repository/scan.py")).with_priority(priority)
    }

    /// Drive an activation through its remaining phases.
    fn run_to_end(scheduler: &mut Scheduler, activation: Activation) {
        let id = activation.run.id;
        let mut phase = activation.phase;
        while let Some(next) = scheduler.phase_finished(id, phase, Ok(())) {
            phase = next.phase;
        }
    }

    fn status(scheduler: &Scheduler, id: RunId) -> Option<RunStatus> {
        scheduler.queue().get(id).map(|run| run.status.clone())
    }

    #[test]
    fn test_higher_priority_selected_first() {
        let mut scheduler = Scheduler::new();
        let a = scheduler.submit(spec("p", 1), t(0)).unwrap();
        let b = scheduler.submit(spec("p", 5), t(0)).unwrap();

        let activations = scheduler.tick(t(0));
        assert_eq!(activations.len(), 1);
        assert_eq!(activations[0].run.id, b);
        assert_eq!(activations[0].phase, Phase::Prepare);
        assert_eq!(status(&scheduler, a), Some(RunStatus::Pending));

        run_to_end(&mut scheduler, activations[0].clone());
        assert_eq!(status(&scheduler, b), Some(RunStatus::Completed));

        // Completed run expires and frees the pipeline for A
        let activations = scheduler.tick(t(1));
        assert_eq!(status(&scheduler, b), None);
        assert_eq!(activations[0].run.id, a);
    }

    #[test]
    fn test_phases_advance_in_order() {
        let mut scheduler = Scheduler::new();
        let id = scheduler.submit(spec("p", 0), t(0)).unwrap();
        scheduler.tick(t(0));
        assert_eq!(status(&scheduler, id), Some(RunStatus::Preparing));

        let next = scheduler.phase_finished(id, Phase::Prepare, Ok(())).unwrap();
        assert_eq!(next.phase, Phase::Run);
        assert_eq!(status(&scheduler, id), Some(RunStatus::Running));

        let next = scheduler.phase_finished(id, Phase::Run, Ok(())).unwrap();
        assert_eq!(next.phase, Phase::Analyze);
        assert!(scheduler.phase_finished(id, Phase::Analyze, Ok(())).is_none());
        assert_eq!(status(&scheduler, id), Some(RunStatus::Completed));
        assert_eq!(scheduler.queue().active_run("p"), None);
    }

    #[test]
    fn test_pipelines_run_independently() {
        let mut scheduler = Scheduler::new();
        scheduler.submit(spec("p", 0), t(0)).unwrap();
        scheduler.submit(spec("p", 0), t(0)).unwrap();
        scheduler.submit(spec("q", 0), t(0)).unwrap();

        let activations = scheduler.tick(t(0));
        let pipelines: Vec<_> = activations.iter().map(|a| a.run.pipeline.as_str()).collect();
        assert_eq!(pipelines, vec!["p", "q"]);

        // Occupied pipelines start nothing new
        assert!(scheduler.tick(t(1)).is_empty());
    }

    #[test]
    fn test_future_due_waits() {
        let mut scheduler = Scheduler::new();
        let id = scheduler.submit(spec("p", 0).with_due(t(30)), t(0)).unwrap();
        assert!(scheduler.tick(t(10)).is_empty());
        assert_eq!(scheduler.next_wakeup(t(10)), Some(t(30)));

        let activations = scheduler.tick(t(30));
        assert_eq!(activations[0].run.id, id);
    }

    #[test]
    fn test_periodic_coalesces_missed_firings() {
        let mut scheduler = Scheduler::new();
        scheduler.submit(spec("p", 0).with_repeat(10), t(0)).unwrap();
        assert_eq!(scheduler.queue().len(), 1);
        let template = scheduler.periodic().get("periodic-0").unwrap();
        assert_eq!(template.next_due, t(10));

        // No ticks between 0 and 25: one new run for slot 20, not three
        scheduler.tick(t(25));
        assert_eq!(scheduler.queue().len(), 2);
        let spawned = scheduler.queue().iter().last().unwrap();
        assert_eq!(spawned.due, t(20));
        assert_eq!(spawned.periodic_id.as_deref(), Some("periodic-0"));
        assert_eq!(scheduler.periodic().get("periodic-0").unwrap().next_due, t(30));
    }

    #[test]
    fn test_periodic_id_conflict_and_cancel() {
        let mut scheduler = Scheduler::new();
        let repeating = spec("p", 0).with_repeat(60).with_periodic_id("calib");
        scheduler.submit(repeating.clone(), t(0)).unwrap();

        assert!(matches!(
            scheduler.submit(repeating, t(0)),
            Err(SchedulerError::Conflict(id)) if id == "calib"
        ));
        // The rejected submission queued nothing
        assert_eq!(scheduler.queue().len(), 1);

        assert_eq!(scheduler.cancel_periodic("calib").unwrap().id, "calib");
        assert!(matches!(
            scheduler.cancel_periodic("calib"),
            Err(SchedulerError::PeriodicNotFound(_))
        ));
        scheduler.tick(t(120));
        assert_eq!(scheduler.queue().len(), 1);
    }

    #[test]
    fn test_generated_periodic_ids_skip_explicit_ones() {
        let mut scheduler = Scheduler::new();
        scheduler
            .submit(spec("p", 0).with_repeat(5).with_periodic_id("periodic-0"), t(0))
            .unwrap();
        scheduler.submit(spec("p", 0).with_repeat(5), t(0)).unwrap();
        assert!(scheduler.periodic().contains("periodic-1"));
    }

    #[test]
    fn test_delete_running_waits_for_boundary() {
        let mut scheduler = Scheduler::new();
        let id = scheduler.submit(spec("p", 0), t(0)).unwrap();
        scheduler.tick(t(0));
        scheduler.phase_finished(id, Phase::Prepare, Ok(())).unwrap();
        assert_eq!(status(&scheduler, id), Some(RunStatus::Running));

        scheduler.delete(id).unwrap();
        assert_eq!(status(&scheduler, id), Some(RunStatus::Deleting));
        assert!(scheduler.queue_value().get(id.to_string()).is_some());
        assert_eq!(scheduler.queue().active_run("p"), Some(id));

        // Repeated delete is harmless
        scheduler.delete(id).unwrap();

        assert!(scheduler.phase_finished(id, Phase::Run, Ok(())).is_none());
        scheduler.tick(t(1));
        assert_eq!(status(&scheduler, id), None);
        assert!(scheduler.queue_value().get(id.to_string()).is_none());
    }

    #[test]
    fn test_delete_pending_is_immediate() {
        let mut scheduler = Scheduler::new();
        let id = scheduler.submit(spec("p", 0), t(0)).unwrap();
        scheduler.delete(id).unwrap();
        assert!(scheduler.queue().is_empty());
        assert!(matches!(scheduler.delete(id), Err(SchedulerError::NotFound(_))));
    }

    #[test]
    fn test_pause_pending_and_resume() {
        let mut scheduler = Scheduler::new();
        let id = scheduler.submit(spec("p", 0), t(0)).unwrap();
        scheduler.pause(id).unwrap();
        assert_eq!(status(&scheduler, id), Some(RunStatus::Paused));
        assert!(scheduler.tick(t(1)).is_empty());

        assert!(matches!(
            scheduler.pause(id),
            Err(SchedulerError::InvalidState { operation: "pause", .. })
        ));

        scheduler.resume(id).unwrap();
        let activations = scheduler.tick(t(2));
        assert_eq!(activations[0].run.id, id);
        assert_eq!(activations[0].phase, Phase::Prepare);
    }

    #[test]
    fn test_pause_active_takes_effect_at_boundary() {
        let mut scheduler = Scheduler::new();
        let id = scheduler.submit(spec("p", 0), t(0)).unwrap();
        let other = scheduler.submit(spec("p", 0), t(0)).unwrap();
        scheduler.tick(t(0));

        scheduler.pause(id).unwrap();
        assert_eq!(status(&scheduler, id), Some(RunStatus::Preparing));
        assert!(matches!(
            scheduler.pause(id),
            Err(SchedulerError::InvalidState { .. })
        ));

        // Boundary: the run parks and the pipeline frees up for the next run
        assert!(scheduler.phase_finished(id, Phase::Prepare, Ok(())).is_none());
        assert_eq!(status(&scheduler, id), Some(RunStatus::Paused));
        let activations = scheduler.tick(t(1));
        assert_eq!(activations[0].run.id, other);
        run_to_end(&mut scheduler, activations[0].clone());

        // Resumed run continues where it stopped
        scheduler.resume(id).unwrap();
        let activations = scheduler.tick(t(2));
        assert_eq!(activations[0].run.id, id);
        assert_eq!(activations[0].phase, Phase::Run);
        assert_eq!(status(&scheduler, id), Some(RunStatus::Running));
    }

    #[test]
    fn test_resume_requires_paused() {
        let mut scheduler = Scheduler::new();
        let id = scheduler.submit(spec("p", 0), t(0)).unwrap();
        assert!(matches!(
            scheduler.resume(id),
            Err(SchedulerError::InvalidState {
                status: RunStatus::Pending,
                operation: "resume",
                ..
            })
        ));
        assert!(matches!(scheduler.resume(99), Err(SchedulerError::NotFound(99))));
    }

    #[test]
    fn test_failed_phase_is_terminal() {
        let mut scheduler = Scheduler::new();
        let id = scheduler.submit(spec("p", 0), t(0)).unwrap();
        scheduler.tick(t(0));

        assert!(
            scheduler
                .phase_finished(id, Phase::Prepare, Err("device unreachable".to_string()))
                .is_none()
        );
        assert_eq!(
            status(&scheduler, id),
            Some(RunStatus::Failed {
                error: "device unreachable".to_string()
            })
        );
        assert_eq!(scheduler.queue().active_run("p"), None);
        assert!(matches!(
            scheduler.pause(id),
            Err(SchedulerError::InvalidState { .. })
        ));

        scheduler.tick(t(1));
        assert!(scheduler.queue().is_empty());
    }

    #[test]
    fn test_stale_phase_completion_ignored() {
        let mut scheduler = Scheduler::new();
        let id = scheduler.submit(spec("p", 0), t(0)).unwrap();
        scheduler.tick(t(0));
        assert!(scheduler.phase_finished(id, Phase::Analyze, Ok(())).is_none());
        assert_eq!(status(&scheduler, id), Some(RunStatus::Preparing));
        assert_eq!(scheduler.queue().active_run("p"), Some(id));
        assert!(scheduler.phase_finished(42, Phase::Run, Ok(())).is_none());
    }

    #[test]
    fn test_changes_track_touched_collections() {
        let mut scheduler = Scheduler::new();
        assert_eq!(scheduler.take_changes(), Changes::default());

        let id = scheduler.submit(spec("p", 0).with_due(t(100)), t(0)).unwrap();
        assert_eq!(
            scheduler.take_changes(),
            Changes {
                queue: true,
                periodic: false
            }
        );

        // Nothing due yet
        scheduler.tick(t(1));
        assert_eq!(scheduler.take_changes(), Changes::default());

        // Rejected operations change nothing
        assert!(scheduler.resume(id).is_err());
        assert!(scheduler.phase_finished(id, Phase::Run, Ok(())).is_none());
        assert_eq!(scheduler.take_changes(), Changes::default());

        scheduler.submit(spec("q", 0).with_repeat(10), t(1)).unwrap();
        assert_eq!(
            scheduler.take_changes(),
            Changes {
                queue: true,
                periodic: true
            }
        );

        scheduler.cancel_periodic("periodic-0").unwrap();
        assert_eq!(
            scheduler.take_changes(),
            Changes {
                queue: false,
                periodic: true
            }
        );
    }

    #[test]
    fn test_overdue_periodic_is_next_wakeup() {
        let mut scheduler = Scheduler::new();
        scheduler.submit(spec("p", 0).with_due(t(-11)).with_repeat(10), t(0)).unwrap();
        // The slot at t(-1) has not fired yet
        assert_eq!(scheduler.next_wakeup(t(0)), Some(t(-1)));

        scheduler.tick(t(0));
        assert_eq!(scheduler.queue().len(), 2);
        assert_eq!(scheduler.next_wakeup(t(0)), Some(t(9)));
    }

    #[test]
    fn test_invalid_submission_rejected() {
        let mut scheduler = Scheduler::new();
        assert!(matches!(
            scheduler.submit(spec("bad pipeline", 0), t(0)),
            Err(SchedulerError::InvalidArgument(_))
        ));
        assert!(scheduler.queue().is_empty());
    }

    #[test]
    fn test_ids_are_monotonic() {
        let mut scheduler = Scheduler::new();
        let a = scheduler.submit(spec("p", 0), t(0)).unwrap();
        scheduler.delete(a).unwrap();
        let b = scheduler.submit(spec("p", 0), t(0)).unwrap();
        assert!(b > a);
    }
}
