//! Local execution surface
//!
//! Runs commands through `sh -c` on this machine, each in its own process
//! group.

use anyhow::Result;
use async_trait::async_trait;
use tokio::process::Command;

use super::process::{ChildHandle, Termination};
use super::{ExecutionSurface, SessionHandle};

/// Executes commands on the local host
#[derive(Debug, Clone)]
pub struct LocalSurface {
    shell: String,
}

impl LocalSurface {
    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }
}

impl Default for LocalSurface {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionSurface for LocalSurface {
    fn name(&self) -> &str {
        "local"
    }

    async fn start(&self, label: &str, command: &str) -> Result<Box<dyn SessionHandle>> {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c").arg(command);

        let handle = ChildHandle::spawn(label, cmd, Termination::InterruptGroup)?;
        Ok(Box::new(handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ExitState;

    #[tokio::test]
    async fn test_run_returns_exit_code() {
        let surface = LocalSurface::new();
        let output = surface.run("true", "echo ready").await.unwrap();
        assert!(output.success());
        assert_eq!(output.output, "ready");

        let output = surface.run("false", "exit 4").await.unwrap();
        assert_eq!(output.exit_code, 4);
    }

    #[tokio::test]
    async fn test_long_running_start_does_not_block() {
        let surface = LocalSurface::new();
        let mut handle = surface.start("tunnel", "sleep 30").await.unwrap();
        assert_eq!(handle.poll().unwrap(), ExitState::Running);

        assert!(handle.terminate().await.unwrap());
        assert!(!handle.poll().unwrap().is_alive());
        handle.wait().await.unwrap();
    }
}
