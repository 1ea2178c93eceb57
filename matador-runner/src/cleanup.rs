//! Cleanup of attempt resources
//!
//! Three steps, always in this order:
//! - `cleanup`: stop every tracked handle that is still running
//! - `await_exit`: give the stopped handles time to shut down on their own
//! - `force_teardown`: run the configured recovery commands on both
//!   endpoints to reclaim anything a handle left behind
//!
//! `cleanup` and `await_exit` never fail; problems are logged. A failed forced teardown
//! means resources could not be reclaimed and is always fatal.

use matador_core::Failure;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::session::{ExecutionSurface, SessionHandle};

/// Recovery commands for one attempt, already rendered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryCommands {
    pub local: String,
    pub remote: String,
}

/// Stops every handle that is still running
///
/// Local handles get SIGINT on their process group; remote handles get their
/// channel closed. Handles that already exited or were already stopped are
/// skipped, so calling this repeatedly on the same set is harmless.
///
/// Returns how many handles were stopped by this call.
pub async fn cleanup(
    local: Vec<&mut Box<dyn SessionHandle>>,
    remote: Vec<&mut Box<dyn SessionHandle>>,
) -> usize {
    let mut stopped = 0;

    for handle in local.into_iter().chain(remote) {
        match handle.terminate().await {
            Ok(true) => {
                debug!("Stopped '{}'", handle.label());
                stopped += 1;
            }
            Ok(false) => {}
            Err(e) => warn!("Failed to stop '{}': {:#}", handle.label(), e),
        }
    }

    if stopped > 0 {
        info!("Cleanup stopped {} handle(s)", stopped);
    }
    stopped
}

/// Waits for every handle to exit, sharing one `timeout` across all of them
///
/// Returns how many handles were still running when the time ran out. Those
/// are left to the forced teardown.
pub async fn await_exit(handles: Vec<&mut Box<dyn SessionHandle>>, timeout: Duration) -> usize {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut lingering = 0;

    for handle in handles {
        match tokio::time::timeout_at(deadline, handle.wait()).await {
            Ok(Ok(output)) => debug!("'{}' exited with {}", handle.label(), output.exit_code),
            Ok(Err(e)) => warn!("Failed to wait for '{}': {:#}", handle.label(), e),
            Err(_) => {
                warn!(
                    "'{}' did not exit within {:?} of being stopped",
                    handle.label(),
                    timeout
                );
                lingering += 1;
            }
        }
    }
    lingering
}

/// Runs both recovery commands
///
/// Both are attempted even if the first fails. A launch error, a non-zero
/// exit or exceeding `timeout` is fatal.
pub async fn force_teardown(
    local: &dyn ExecutionSurface,
    remote: &dyn ExecutionSurface,
    commands: &RecoveryCommands,
    timeout: Duration,
) -> Result<(), Failure> {
    let local_result = run_recovery(local, "network_tear_down_a", &commands.local, timeout).await;
    let remote_result = run_recovery(remote, "network_tear_down_b", &commands.remote, timeout).await;

    match (local_result, remote_result) {
        (Ok(()), Ok(())) => {
            debug!("Forced teardown completed");
            Ok(())
        }
        (Err(e), _) | (_, Err(e)) => {
            error!("Forced teardown failed: {}", e);
            Err(Failure::fatal(format!("Can not tear down the tunnel: {}", e)))
        }
    }
}

async fn run_recovery(
    surface: &dyn ExecutionSurface,
    label: &str,
    command: &str,
    timeout: Duration,
) -> Result<(), String> {
    debug!("Running {} on {}: {}", label, surface.name(), command);

    let mut handle = surface
        .start(label, command)
        .await
        .map_err(|e| format!("{} on {} could not start: {:#}", label, surface.name(), e))?;

    match tokio::time::timeout(timeout, handle.wait()).await {
        Ok(Ok(output)) if output.success() => Ok(()),
        Ok(Ok(output)) => Err(format!(
            "{} on {} exited with {}: {}",
            label,
            surface.name(),
            output.exit_code,
            output.output.trim()
        )),
        Ok(Err(e)) => Err(format!("{} on {} failed: {:#}", label, surface.name(), e)),
        Err(_) => {
            if let Err(e) = handle.terminate().await {
                warn!("Failed to stop timed out {}: {:#}", label, e);
            }
            Err(format!(
                "{} on {} did not finish within {:?}",
                label,
                surface.name(),
                timeout
            ))
        }
    }
}
