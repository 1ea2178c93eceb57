//! Signal handling
//!
//! SIGINT, SIGTERM and SIGHUP cancel the run token. The attempt in flight
//! then stops its commands and runs the same teardown as on any failure.
//! Further signals during that teardown are logged, not acted on.

use anyhow::{Context, Result};
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Background signal listener; stops listening when dropped
pub struct SignalListener {
    task: JoinHandle<()>,
}

impl Drop for SignalListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub fn install(cancel: CancellationToken) -> Result<SignalListener> {
    let mut interrupt =
        signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut hangup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;

    let task = tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                _ = interrupt.recv() => "SIGINT",
                _ = terminate.recv() => "SIGTERM",
                _ = hangup.recv() => "SIGHUP",
            };

            if cancel.is_cancelled() {
                warn!("Received {} again, still tearing down the current attempt", name);
            } else {
                warn!("Received {}, stopping the measurement", name);
                cancel.cancel();
            }
        }
    });

    Ok(SignalListener { task })
}
