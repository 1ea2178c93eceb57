//! Child process handle shared by both surfaces
//!
//! Local commands and SSH sub-commands are both child processes of this
//! runner. They differ only in how they are stopped: a local command gets
//! SIGINT delivered to its whole process group, an SSH client is killed so
//! the remote side hangs up its pseudo-terminal.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{CommandOutput, ExitState, SessionHandle};

/// Lines of output kept per handle
const OUTPUT_TAIL_LINES: usize = 200;

/// How long to wait for the output pipes to close after the process exited.
/// Background children of a shell can hold them open indefinitely.
const OUTPUT_GRACE: Duration = Duration::from_secs(2);

/// How a handle is stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// SIGINT to the process group the child leads
    InterruptGroup,
    /// Kill the client process, closing its channel
    CloseChannel,
}

type OutputTail = Arc<Mutex<VecDeque<String>>>;

/// A spawned child process
pub struct ChildHandle {
    label: String,
    child: Child,
    pid: Option<u32>,
    termination: Termination,
    terminated: bool,
    exit_code: Option<i32>,
    tail: OutputTail,
    readers: Option<JoinHandle<()>>,
}

impl ChildHandle {
    /// Spawns `command` with piped output
    ///
    /// With [`Termination::InterruptGroup`] the child is placed in a new
    /// process group so that everything it starts can be interrupted at once.
    pub fn spawn(label: &str, mut command: Command, termination: Termination) -> Result<Self> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if termination == Termination::InterruptGroup {
            command.process_group(0);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to spawn '{}'", label))?;

        let pid = child.id();
        let tail: OutputTail = Arc::new(Mutex::new(VecDeque::new()));

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let readers = {
            let label = label.to_string();
            let tail = Arc::clone(&tail);
            tokio::spawn(async move {
                tokio::join!(
                    drain(&label, stdout, &tail),
                    drain(&label, stderr, &tail)
                );
            })
        };

        debug!("Started '{}' (pid {:?})", label, pid);

        Ok(Self {
            label: label.to_string(),
            child,
            pid,
            termination,
            terminated: false,
            exit_code: None,
            tail,
            readers: Some(readers),
        })
    }

    /// Output collected so far
    pub fn output_tail(&self) -> String {
        let tail = self.tail.lock().unwrap_or_else(PoisonError::into_inner);
        tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    fn record_exit(&mut self, status: ExitStatus) -> i32 {
        let code = exit_code(status);
        self.exit_code = Some(code);
        code
    }

    fn send_stop(&mut self) -> Result<()> {
        match self.termination {
            Termination::InterruptGroup => match self.pid {
                Some(pid) => interrupt_group(pid)
                    .with_context(|| format!("Failed to interrupt process group of '{}'", self.label)),
                None => Ok(()),
            },
            Termination::CloseChannel => self
                .child
                .start_kill()
                .with_context(|| format!("Failed to close '{}'", self.label)),
        }
    }
}

#[async_trait]
impl SessionHandle for ChildHandle {
    fn label(&self) -> &str {
        &self.label
    }

    fn poll(&mut self) -> Result<ExitState> {
        if let Some(code) = self.exit_code {
            return Ok(ExitState::Exited(code));
        }

        let status = self
            .child
            .try_wait()
            .with_context(|| format!("Failed to poll '{}'", self.label))?;

        Ok(match status {
            Some(status) => ExitState::Exited(self.record_exit(status)),
            None if self.terminated => ExitState::Terminating,
            None => ExitState::Running,
        })
    }

    async fn terminate(&mut self) -> Result<bool> {
        if !self.poll()?.is_alive() {
            return Ok(false);
        }

        debug!("Terminating '{}'", self.label);
        self.send_stop()?;
        self.terminated = true;
        Ok(true)
    }

    async fn wait(&mut self) -> Result<CommandOutput> {
        let exit_code = match self.exit_code {
            Some(code) => code,
            None => {
                let status = self
                    .child
                    .wait()
                    .await
                    .with_context(|| format!("Failed to wait for '{}'", self.label))?;
                self.record_exit(status)
            }
        };

        if let Some(mut readers) = self.readers.take() {
            if tokio::time::timeout(OUTPUT_GRACE, &mut readers).await.is_err() {
                debug!("Output of '{}' still open after exit, detaching", self.label);
                readers.abort();
            }
        }

        debug!("'{}' exited with {}", self.label, exit_code);

        Ok(CommandOutput {
            output: self.output_tail(),
            exit_code,
        })
    }
}

impl Drop for ChildHandle {
    fn drop(&mut self) {
        if let Some(readers) = self.readers.take() {
            readers.abort();
        }

        if self.terminated || self.exit_code.is_some() {
            return;
        }

        if let Ok(None) = self.child.try_wait() {
            warn!("Handle '{}' dropped while running, stopping it", self.label);
            if let Err(e) = self.send_stop() {
                warn!("{:#}", e);
            }
        }
    }
}

/// Sends SIGINT to the process group led by `pid`
///
/// A group that no longer exists is not an error.
pub fn interrupt_group(pid: u32) -> std::io::Result<()> {
    let pgid = libc::pid_t::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;

    // SAFETY: killpg only sends a signal; no memory is shared with the callee.
    let rc = unsafe { libc::killpg(pgid, libc::SIGINT) };
    if rc == 0 {
        return Ok(());
    }

    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

/// Exit code of a status; signal deaths map to `128 + signal`
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

async fn drain<R>(label: &str, reader: Option<R>, tail: &OutputTail)
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return;
    };

    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                debug!(target: "matador_runner::output", "[{}] {}", label, line);
                let mut tail = tail.lock().unwrap_or_else(PoisonError::into_inner);
                if tail.len() == OUTPUT_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read output of '{}': {}", label, e);
                break;
            }
        }
    }
}
