//! Run phase execution.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::process::Command;
use tracing::{debug, warn};

use marshal_scheduler::Activation;

/// Executes one phase of a run. The coordinator spawns the returned future
/// and treats its completion as the phase boundary.
pub type PhaseExecutor = Box<
    dyn Fn(Activation) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send>> + Send + Sync,
>;

/// Executor that completes every phase immediately.
pub fn noop_executor() -> PhaseExecutor {
    Box::new(|activation: Activation| {
        Box::pin(async move {
            debug!(run_id = activation.run.id, phase = %activation.phase, "phase skipped");
            Ok(())
        })
    })
}

/// Executor that runs `program <phase>` once per phase.
///
/// The run is described to the child through `MARSHAL_*` environment
/// variables; arguments are passed as JSON. A non-zero exit fails the run.
pub fn command_executor(program: impl Into<String>) -> PhaseExecutor {
    let program: Arc<str> = Arc::from(program.into());
    Box::new(move |activation: Activation| {
        let program = Arc::clone(&program);
        Box::pin(async move {
            let run = &activation.run;
            let output = Command::new(&*program)
                .arg(activation.phase.as_str())
                .env("MARSHAL_RUN_ID", run.id.to_string())
                .env("MARSHAL_PIPELINE", &run.pipeline)
                .env("MARSHAL_EXPERIMENT", &run.experiment.file)
                .env("MARSHAL_UNIT", run.experiment.unit.as_deref().unwrap_or(""))
                .env("MARSHAL_ARGUMENTS", run.arguments.to_string())
                .kill_on_drop(true)
                .output()
                .await
                .map_err(|e| format!("failed to start {program}: {e}"))?;

            let stderr = String::from_utf8_lossy(&output.stderr);
            if !output.status.success() {
                warn!(run_id = run.id, phase = %activation.phase, stderr = %stderr, "worker failed");
                return Err(format!(
                    "{} phase exited with {}: {}",
                    activation.phase,
                    output.status,
                    stderr.trim()
                ));
            }
            if !stderr.is_empty() {
                debug!(run_id = run.id, stderr = %stderr, "worker stderr (non-fatal)");
            }
            Ok(())
        })
    })
}
