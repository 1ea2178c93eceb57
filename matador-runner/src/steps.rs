//! Initialization and completion steps
//!
//! Local commands run in order around the sweep, each followed by its pause.
//! The first failing step stops the phase.

use anyhow::{Context, Result, bail};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::Step;
use crate::session::ExecutionSurface;

pub async fn run_steps(
    surface: &dyn ExecutionSurface,
    phase: &str,
    steps: &[Step],
    cancel: &CancellationToken,
) -> Result<()> {
    for (idx, step) in steps.iter().enumerate() {
        let label = format!("{}-{}", phase, idx + 1);
        info!(
            "Running {} step {}/{}: {}",
            phase,
            idx + 1,
            steps.len(),
            step.command
        );

        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => bail!("{} interrupted", phase),
            result = surface.run(&label, &step.command) => {
                result.with_context(|| format!("{} step {} could not run", phase, idx + 1))?
            }
        };

        if !output.success() {
            bail!(
                "{} step {} exited with {}: {}",
                phase,
                idx + 1,
                output.exit_code,
                output.output.trim()
            );
        }

        debug!("Pausing {:?} after {}", step.pause(), label);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => bail!("{} interrupted", phase),
            _ = tokio::time::sleep(step.pause()) => {}
        }
    }

    Ok(())
}
