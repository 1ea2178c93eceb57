//! Remote execution surface over SSH
//!
//! One persistent, authenticated connection per attempt: an OpenSSH control
//! master is started in the background and every sub-command is multiplexed
//! over its socket. Sub-commands always request a pseudo-terminal (`-tt`),
//! so killing the local client hangs up the remote terminal and the remote
//! process tree receives SIGHUP.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::process::{ChildHandle, Termination};
use super::{ExecutionSurface, ExitState, RemoteConnector, SessionHandle};

/// Interval between control socket checks while connecting
const CHECK_INTERVAL: Duration = Duration::from_millis(250);

fn default_port() -> u16 {
    22
}

/// Where and how to reach the remote endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshTarget {
    pub host: String,
    pub user: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Private key; the agent or ssh config is used when absent
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    /// Extra `-o` options, e.g. `UserKnownHostsFile=/dev/null`
    #[serde(default)]
    pub ssh_options: Vec<String>,
}

impl SshTarget {
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Options shared by the master and every client
    fn common_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            "ServerAliveInterval=15".to_string(),
            "-p".to_string(),
            self.port.to_string(),
        ];
        if let Some(key) = &self.identity_file {
            args.push("-i".to_string());
            args.push(key.to_string_lossy().to_string());
        }
        for option in &self.ssh_options {
            args.push("-o".to_string());
            args.push(option.clone());
        }
        args
    }
}

/// Opens SSH sessions to a fixed target
#[derive(Debug, Clone)]
pub struct SshConnector {
    target: SshTarget,
    program: String,
    control_dir: PathBuf,
    connect_timeout: Duration,
}

impl SshConnector {
    pub fn new(target: SshTarget, connect_timeout: Duration) -> Self {
        Self {
            target,
            program: "ssh".to_string(),
            control_dir: std::env::temp_dir(),
            connect_timeout,
        }
    }

    fn command(&self, control_path: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.target.common_args()).arg("-S").arg(control_path);
        cmd
    }

    /// Asks the master whether it is ready to multiplex
    async fn check(&self, control_path: &Path) -> Result<bool> {
        let status = self
            .command(control_path)
            .arg("-O")
            .arg("check")
            .arg(self.target.destination())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .context("Failed to run ssh control check")?;
        Ok(status.success())
    }
}

#[async_trait]
impl RemoteConnector for SshConnector {
    async fn open(&self) -> Result<Box<dyn ExecutionSurface>> {
        let control_path = self
            .control_dir
            .join(format!("matador-{}.sock", Uuid::new_v4().simple()));
        let destination = self.target.destination();

        info!("Opening SSH session to {}", destination);

        let mut master_cmd = self.command(&control_path);
        master_cmd
            .arg("-M")
            .arg("-N")
            .arg("-o")
            .arg("ControlPersist=no")
            .arg(&destination);
        let mut master = ChildHandle::spawn("ssh-master", master_cmd, Termination::CloseChannel)?;

        let deadline = Instant::now() + self.connect_timeout;
        loop {
            if let ExitState::Exited(code) = master.poll()? {
                bail!(
                    "SSH master to {} exited with {} before the session was up: {}",
                    destination,
                    code,
                    master.output_tail()
                );
            }

            if self.check(&control_path).await? {
                break;
            }

            if Instant::now() >= deadline {
                master.terminate().await?;
                bail!(
                    "SSH session to {} not established within {:?}",
                    destination,
                    self.connect_timeout
                );
            }

            tokio::time::sleep(CHECK_INTERVAL).await;
        }

        info!("SSH session to {} established", destination);

        Ok(Box::new(SshSession {
            connector: self.clone(),
            destination,
            control_path,
            master: Mutex::new(Some(master)),
        }))
    }
}

/// A live control master and the sub-commands run through it
pub struct SshSession {
    connector: SshConnector,
    destination: String,
    control_path: PathBuf,
    master: Mutex<Option<ChildHandle>>,
}

#[async_trait]
impl ExecutionSurface for SshSession {
    fn name(&self) -> &str {
        &self.destination
    }

    async fn start(&self, label: &str, command: &str) -> Result<Box<dyn SessionHandle>> {
        if self.master.lock().await.is_none() {
            bail!("SSH session to {} is closed", self.destination);
        }

        let mut cmd = self.connector.command(&self.control_path);
        cmd.arg("-tt").arg(&self.destination).arg("--").arg(command);

        let handle = ChildHandle::spawn(label, cmd, Termination::CloseChannel)?;
        Ok(Box::new(handle))
    }

    async fn close(&self) -> Result<()> {
        let Some(mut master) = self.master.lock().await.take() else {
            return Ok(());
        };

        debug!("Closing SSH session to {}", self.destination);

        let exit = self
            .connector
            .command(&self.control_path)
            .arg("-O")
            .arg("exit")
            .arg(&self.destination)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(e) = exit {
            warn!("Failed to request SSH master exit: {}", e);
        }

        master.terminate().await?;
        master.wait().await?;

        if let Err(e) = tokio::fs::remove_file(&self.control_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove control socket {:?}: {}", self.control_path, e);
            }
        }

        info!("SSH session to {} closed", self.destination);
        Ok(())
    }
}
