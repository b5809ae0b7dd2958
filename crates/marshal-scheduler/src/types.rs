//! Scheduler types.

use std::cmp::Reverse;
use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::SchedulerError;

/// Run identifier. Monotonically increasing; also the final ordering tie-break.
pub type RunId = u64;

/// Lowest accepted priority.
pub const MIN_PRIORITY: i32 = -99;

/// Highest accepted priority.
pub const MAX_PRIORITY: i32 = 99;

/// Longest accepted repeat interval (about a century).
pub const MAX_REPEAT_SECS: u64 = 100 * 365 * 24 * 3600;

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.\-]{0,63}$").unwrap());

/// Which experiment a run executes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Experiment {
    /// Experiment file, relative to the repository the workers load from.
    pub file: String,
    /// Entry point inside the file, when it holds more than one.
    #[serde(default)]
    pub unit: Option<String>,
}

impl Experiment {
    pub fn new(file: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            unit: None,
        }
    }
}

/// What a caller submits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSpec {
    /// Pipeline the run executes on.
    pub pipeline: String,
    /// Experiment to execute.
    pub experiment: Experiment,
    /// Higher runs first.
    #[serde(default)]
    pub priority: i32,
    /// Earliest time the run may start. Defaults to submission time.
    #[serde(default)]
    pub due: Option<DateTime<Utc>>,
    /// Opaque arguments handed to the experiment.
    #[serde(default)]
    pub arguments: Value,
    /// Resubmit every N seconds.
    #[serde(default)]
    pub repeat_secs: Option<u64>,
    /// Explicit id for the periodic template created by `repeat_secs`.
    #[serde(default)]
    pub periodic_id: Option<String>,
}

impl RunSpec {
    /// Create a one-shot spec with default priority, due immediately.
    pub fn new(pipeline: impl Into<String>, experiment: Experiment) -> Self {
        Self {
            pipeline: pipeline.into(),
            experiment,
            priority: 0,
            due: None,
            arguments: Value::Null,
            repeat_secs: None,
            periodic_id: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_due(mut self, due: DateTime<Utc>) -> Self {
        self.due = Some(due);
        self
    }

    pub fn with_repeat(mut self, seconds: u64) -> Self {
        self.repeat_secs = Some(seconds);
        self
    }

    pub fn with_periodic_id(mut self, id: impl Into<String>) -> Self {
        self.periodic_id = Some(id.into());
        self
    }

    /// Check that the submission is well-formed.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if !NAME_RE.is_match(&self.pipeline) {
            return Err(SchedulerError::InvalidArgument(format!(
                "invalid pipeline name: {:?}",
                self.pipeline
            )));
        }
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&self.priority) {
            return Err(SchedulerError::InvalidArgument(format!(
                "priority {} outside {MIN_PRIORITY}..={MAX_PRIORITY}",
                self.priority
            )));
        }
        if self.experiment.file.trim().is_empty() {
            return Err(SchedulerError::InvalidArgument(
                "experiment file must not be empty".to_string(),
            ));
        }
        if let Some(secs) = self.repeat_secs
            && !(1..=MAX_REPEAT_SECS).contains(&secs)
        {
            return Err(SchedulerError::InvalidArgument(format!(
                "repeat interval {secs}s outside 1..={MAX_REPEAT_SECS}"
            )));
        }
        if let Some(id) = &self.periodic_id {
            if self.repeat_secs.is_none() {
                return Err(SchedulerError::InvalidArgument(
                    "periodic id given without a repeat interval".to_string(),
                ));
            }
            if !NAME_RE.is_match(id) {
                return Err(SchedulerError::InvalidArgument(format!(
                    "invalid periodic id: {id:?}"
                )));
            }
        }
        Ok(())
    }
}

/// Execution phase of an active run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Prepare,
    Run,
    Analyze,
}

impl Phase {
    /// Status a run holds while executing this phase.
    pub fn status(self) -> RunStatus {
        match self {
            Phase::Prepare => RunStatus::Preparing,
            Phase::Run => RunStatus::Running,
            Phase::Analyze => RunStatus::Analyzing,
        }
    }

    /// Phase that follows this one, if any.
    pub fn next(self) -> Option<Phase> {
        match self {
            Phase::Prepare => Some(Phase::Run),
            Phase::Run => Some(Phase::Analyze),
            Phase::Analyze => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Prepare => "prepare",
            Phase::Run => "run",
            Phase::Analyze => "analyze",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Waiting for its due time and a free pipeline.
    #[default]
    Pending,
    Preparing,
    Running,
    Analyzing,
    /// Held until resumed.
    Paused,
    /// Torn down at the next phase boundary.
    Deleting,
    /// Finished every phase.
    Completed,
    /// A phase failed. Not retried.
    Failed { error: String },
    /// Deletion completed.
    Deleted,
}

impl RunStatus {
    /// Whether the run occupies its pipeline.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            RunStatus::Preparing | RunStatus::Running | RunStatus::Analyzing | RunStatus::Deleting
        )
    }

    /// Whether the run has reached an outcome and only awaits expiry.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed { .. } | RunStatus::Deleted
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Preparing => "preparing",
            RunStatus::Running => "running",
            RunStatus::Analyzing => "analyzing",
            RunStatus::Paused => "paused",
            RunStatus::Deleting => "deleting",
            RunStatus::Completed => "completed",
            RunStatus::Failed { .. } => "failed",
            RunStatus::Deleted => "deleted",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scheduled unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub pipeline: String,
    pub experiment: Experiment,
    pub priority: i32,
    /// Ready when `now >= due`.
    pub due: DateTime<Utc>,
    pub status: RunStatus,
    pub arguments: Value,
    pub repeat_secs: Option<u64>,
    /// Template that spawned this run, if any.
    pub periodic_id: Option<String>,
    /// Pause at the next phase boundary.
    pub pause_requested: bool,
    /// Phase to continue with once a paused run is reactivated.
    pub resume_at: Option<Phase>,
}

impl Run {
    /// Create a pending run from a validated spec.
    pub fn from_spec(id: RunId, spec: &RunSpec, due: DateTime<Utc>) -> Self {
        Self {
            id,
            pipeline: spec.pipeline.clone(),
            experiment: spec.experiment.clone(),
            priority: spec.priority,
            due,
            status: RunStatus::Pending,
            arguments: spec.arguments.clone(),
            repeat_secs: spec.repeat_secs,
            periodic_id: spec.periodic_id.clone(),
            pause_requested: false,
            resume_at: None,
        }
    }

    /// Check if this run may be selected for its pipeline.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == RunStatus::Pending && self.due <= now
    }

    /// Selection order: highest priority, then earliest due, then lowest id.
    pub fn selection_key(&self) -> (Reverse<i32>, DateTime<Utc>, RunId) {
        (Reverse(self.priority), self.due, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;
    use test_case::test_case;

    fn spec() -> RunSpec {
        RunSpec::new("main", Experiment::new("repository/flopping.py"))
    }

    #[test]
    fn test_valid_spec() {
        assert!(spec().validate().is_ok());
        assert!(
            spec()
                .with_priority(MAX_PRIORITY)
                .with_repeat(10)
                .with_periodic_id("calib.daily")
                .validate()
                .is_ok()
        );
    }

    #[test_case(spec().with_priority(100) ; "priority too high")]
    #[test_case(spec().with_priority(-100) ; "priority too low")]
    #[test_case(RunSpec::new("", Experiment::new("x.py")) ; "empty pipeline")]
    #[test_case(RunSpec::new("has space", Experiment::new("x.py")) ; "pipeline with space")]
    #[test_case(RunSpec::new("main", Experiment::new(" ")) ; "blank experiment")]
    #[test_case(spec().with_repeat(0) ; "zero repeat")]
    #[test_case(spec().with_repeat(u64::MAX) ; "huge repeat")]
    #[test_case(spec().with_periodic_id("daily") ; "periodic id without repeat")]
    #[test_case(spec().with_repeat(5).with_periodic_id("a/b") ; "bad periodic id")]
    fn test_invalid_spec(spec: RunSpec) {
        assert!(matches!(
            spec.validate(),
            Err(SchedulerError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_phase_sequence() {
        assert_eq!(Phase::Prepare.next(), Some(Phase::Run));
        assert_eq!(Phase::Run.next(), Some(Phase::Analyze));
        assert_eq!(Phase::Analyze.next(), None);
        assert_eq!(Phase::Run.status(), RunStatus::Running);
    }

    #[test]
    fn test_status_classes() {
        assert!(RunStatus::Deleting.is_active());
        assert!(!RunStatus::Paused.is_active());
        assert!(RunStatus::Failed { error: "x".into() }.is_terminal());
        assert!(!RunStatus::Deleting.is_terminal());
    }

    #[test]
    fn test_run_wire_format() {
        let now = Utc::now();
        let run = Run::from_spec(7, &spec().with_priority(3), now);
        let value = serde_json::to_value(&run).unwrap();
        assert_eq!(value["status"], "pending");
        assert_eq!(value["pipeline"], "main");
        assert_eq!(value["priority"], 3);

        let failed = RunStatus::Failed {
            error: "boom".into(),
        };
        assert_eq!(
            serde_json::to_value(&failed).unwrap(),
            serde_json::json!({"failed": {"error": "boom"}})
        );
    }

    #[test]
    fn test_spec_defaults_from_json() {
        let spec: RunSpec = serde_json::from_value(serde_json::json!({
            "pipeline": "main",
            "experiment": {"file": "a.py"}
        }))
        .unwrap();
        assert_eq!(spec.priority, 0);
        assert!(spec.due.is_none());
        assert!(spec.repeat_secs.is_none());
        assert!(spec.arguments.is_null());
    }

    proptest! {
        // Readiness depends only on status and due time
        #[test]
        fn pending_run_ready_iff_due(offset in -1000i64..1000) {
            let now = Utc::now();
            let run = Run::from_spec(1, &spec(), now + Duration::seconds(offset));
            prop_assert_eq!(run.is_ready(now), offset <= 0);
        }

        // Higher priority always sorts first regardless of due time and id
        #[test]
        fn priority_dominates_selection(
            p_a in MIN_PRIORITY..=MAX_PRIORITY,
            p_b in MIN_PRIORITY..=MAX_PRIORITY,
            offset in -100i64..100,
            id_a in 0u64..100,
            id_b in 0u64..100,
        ) {
            let now = Utc::now();
            let a = Run::from_spec(id_a, &spec().with_priority(p_a), now);
            let b = Run::from_spec(id_b, &spec().with_priority(p_b), now + Duration::seconds(offset));
            if p_a > p_b {
                prop_assert!(a.selection_key() < b.selection_key());
            }
        }
    }
}
