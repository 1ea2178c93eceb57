//! Execution surfaces
//!
//! One contract over the two places commands run:
//! - Local: `sh -c` in its own process group on this machine
//! - Remote: sub-commands multiplexed over a persistent SSH control master
//!
//! A surface starts commands and hands back a [`SessionHandle`] that can be
//! polled, terminated and waited on. All traits are object safe so the
//! coordinator can be exercised against scripted surfaces in tests.

mod process;
mod local;
mod remote;

pub use local::LocalSurface;
pub use remote::{SshConnector, SshTarget};

use anyhow::Result;
use async_trait::async_trait;

/// Liveness of a started command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitState {
    /// Still running and never signalled
    Running,
    /// Interrupt or close already sent, exit not yet observed
    Terminating,
    /// Finished with the given exit code
    Exited(i32),
}

impl ExitState {
    /// Only an untouched, running command counts as alive
    pub fn is_alive(self) -> bool {
        matches!(self, ExitState::Running)
    }
}

/// Collected output of a finished command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Tail of combined stdout and stderr
    pub output: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A started command on some surface
#[async_trait]
pub trait SessionHandle: Send {
    /// Label used in log lines
    fn label(&self) -> &str;

    /// Non-blocking liveness check
    fn poll(&mut self) -> Result<ExitState>;

    /// Interrupts the process group (local) or closes the channel (remote)
    ///
    /// Idempotent: returns `true` only when a signal or close was actually
    /// sent by this call.
    async fn terminate(&mut self) -> Result<bool>;

    /// Blocks until the command exits
    async fn wait(&mut self) -> Result<CommandOutput>;
}

/// Somewhere commands can be started
#[async_trait]
pub trait ExecutionSurface: Send + Sync {
    /// Surface name used in log lines
    fn name(&self) -> &str;

    /// Starts `command` without waiting for it
    async fn start(&self, label: &str, command: &str) -> Result<Box<dyn SessionHandle>>;

    /// Starts `command` and waits for it to finish
    async fn run(&self, label: &str, command: &str) -> Result<CommandOutput> {
        let mut handle = self.start(label, command).await?;
        handle.wait().await
    }

    /// Releases the surface; a no-op for local execution
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Opens the persistent remote session used for one attempt
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn open(&self) -> Result<Box<dyn ExecutionSurface>>;
}
