//! Scripted test doubles for surfaces, connectors and the experiment service

use anyhow::{Result, bail};
use async_trait::async_trait;
use matador_core::{Attempt, Outcome, Stage, TemplateRegistry};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::service::ExperimentService;
use crate::session::{CommandOutput, ExecutionSurface, ExitState, RemoteConnector, SessionHandle};

/// How a scripted command behaves
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Runs until waited on or terminated, then exits 0
    Succeed,
    /// Already exited with the code when first polled
    Exit(i32),
    /// Never finishes unless terminated
    LongRunning,
    /// Accepts the interrupt but never exits
    IgnoresInterrupt,
    /// The surface refuses to start it
    FailToStart,
    /// Cancels the token when started, then behaves like `Succeed`
    Cancels(CancellationToken),
}

#[derive(Default)]
struct Record {
    started: Vec<String>,
    terminations: HashMap<String, usize>,
    closes: usize,
    history: Vec<String>,
}

/// Surface that records every command and answers from a script
///
/// Rules match when the command contains the pattern; the first match wins
/// and unmatched commands behave like [`Behavior::Succeed`].
#[derive(Clone)]
pub struct ScriptedSurface {
    name: String,
    rules: Vec<(String, Behavior)>,
    fail_close: bool,
    record: Arc<Mutex<Record>>,
}

impl ScriptedSurface {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            rules: Vec::new(),
            fail_close: false,
            record: Arc::new(Mutex::new(Record::default())),
        }
    }

    pub fn on(mut self, pattern: &str, behavior: Behavior) -> Self {
        self.rules.push((pattern.to_string(), behavior));
        self
    }

    pub fn failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    /// Commands started so far, in order
    pub fn started(&self) -> Vec<String> {
        self.record.lock().unwrap().started.clone()
    }

    /// Whether any started command contains `pattern`
    pub fn ran(&self, pattern: &str) -> bool {
        self.started().iter().any(|c| c.contains(pattern))
    }

    /// How often the command was actually stopped
    pub fn terminations(&self, command: &str) -> usize {
        let record = self.record.lock().unwrap();
        record.terminations.get(command).copied().unwrap_or(0)
    }

    pub fn closes(&self) -> usize {
        self.record.lock().unwrap().closes
    }

    /// `start <command>` and `wait <command>` entries, in order
    pub fn history(&self) -> Vec<String> {
        self.record.lock().unwrap().history.clone()
    }

    /// Position of `entry` in the history
    pub fn position(&self, entry: &str) -> Option<usize> {
        self.history().iter().position(|e| e == entry)
    }

    fn behavior(&self, command: &str) -> Behavior {
        self.rules
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, behavior)| behavior.clone())
            .unwrap_or(Behavior::Succeed)
    }
}

#[async_trait]
impl ExecutionSurface for ScriptedSurface {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self, label: &str, command: &str) -> Result<Box<dyn SessionHandle>> {
        {
            let mut record = self.record.lock().unwrap();
            record.started.push(command.to_string());
            record.history.push(format!("start {}", command));
        }

        let behavior = match self.behavior(command) {
            Behavior::FailToStart => bail!("cannot start {}", command),
            Behavior::Cancels(token) => {
                token.cancel();
                Behavior::Succeed
            }
            other => other,
        };

        Ok(Box::new(ScriptedHandle {
            label: label.to_string(),
            command: command.to_string(),
            behavior,
            terminated: false,
            record: Arc::clone(&self.record),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.record.lock().unwrap().closes += 1;
        if self.fail_close {
            bail!("control master already gone");
        }
        Ok(())
    }
}

struct ScriptedHandle {
    label: String,
    command: String,
    behavior: Behavior,
    terminated: bool,
    record: Arc<Mutex<Record>>,
}

#[async_trait]
impl SessionHandle for ScriptedHandle {
    fn label(&self) -> &str {
        &self.label
    }

    fn poll(&mut self) -> Result<ExitState> {
        Ok(match self.behavior {
            Behavior::Exit(code) => ExitState::Exited(code),
            _ if self.terminated => ExitState::Terminating,
            _ => ExitState::Running,
        })
    }

    async fn terminate(&mut self) -> Result<bool> {
        if !self.poll()?.is_alive() {
            return Ok(false);
        }
        self.terminated = true;
        *self
            .record
            .lock()
            .unwrap()
            .terminations
            .entry(self.command.clone())
            .or_default() += 1;
        Ok(true)
    }

    async fn wait(&mut self) -> Result<CommandOutput> {
        self.record
            .lock()
            .unwrap()
            .history
            .push(format!("wait {}", self.command));

        let exit_code = match self.behavior {
            Behavior::Exit(code) => code,
            Behavior::IgnoresInterrupt => std::future::pending().await,
            _ if self.terminated => 130,
            Behavior::LongRunning => std::future::pending().await,
            _ => 0,
        };
        Ok(CommandOutput {
            output: String::new(),
            exit_code,
        })
    }
}

/// Connector handing out one scripted remote surface
pub struct ScriptedConnector {
    surface: ScriptedSurface,
    fail_open: bool,
    opens: AtomicUsize,
}

impl ScriptedConnector {
    pub fn new(surface: ScriptedSurface) -> Self {
        Self {
            surface,
            fail_open: false,
            opens: AtomicUsize::new(0),
        }
    }

    pub fn unreachable() -> Self {
        Self {
            fail_open: true,
            ..Self::new(ScriptedSurface::new("worker"))
        }
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteConnector for ScriptedConnector {
    async fn open(&self) -> Result<Box<dyn ExecutionSurface>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.fail_open {
            bail!("Permission denied (publickey)");
        }
        Ok(Box::new(self.surface.clone()))
    }
}

/// Stage templates rendering `<stage> <hostname>`, plus the workload where one applies
pub fn stage_templates() -> BTreeMap<String, String> {
    Stage::ALL
        .into_iter()
        .map(|stage| {
            let template = match stage {
                Stage::MeasurementSetupA
                | Stage::MeasurementSetupB
                | Stage::WorkloadExecution
                | Stage::WorkloadCleanUp
                | Stage::AnalysisA
                | Stage::AnalysisB => format!("{} {{hostname}} {{workload}}", stage.key()),
                _ => format!("{} {{hostname}}", stage.key()),
            };
            (stage.key().to_string(), template)
        })
        .collect()
}

pub fn stage_registry() -> TemplateRegistry {
    TemplateRegistry::from_map(stage_templates()).unwrap()
}

/// Experiment service answering from a table keyed by hostname pair
#[derive(Default)]
pub struct ScriptedService {
    answers: Mutex<HashMap<(String, String), Vec<Outcome>>>,
    calls: Mutex<Vec<Attempt>>,
}

impl ScriptedService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `outcome` for the next attempt of `a` with `b`
    pub fn answer(self, a: &str, b: &str, outcome: Outcome) -> Self {
        self.answers
            .lock()
            .unwrap()
            .entry((a.to_string(), b.to_string()))
            .or_default()
            .push(outcome);
        self
    }

    pub fn calls(&self) -> Vec<Attempt> {
        self.calls.lock().unwrap().clone()
    }

    /// Attempted hostname pairs, in order
    pub fn pairs(&self) -> Vec<(String, String)> {
        self.calls()
            .into_iter()
            .map(|attempt| (attempt.a.hostname, attempt.b.hostname))
            .collect()
    }
}

#[async_trait]
impl ExperimentService for ScriptedService {
    async fn run_attempt(&self, attempt: &Attempt, _cancel: &CancellationToken) -> Outcome {
        self.calls.lock().unwrap().push(attempt.clone());
        let key = (attempt.a.hostname.clone(), attempt.b.hostname.clone());
        let mut answers = self.answers.lock().unwrap();
        match answers.get_mut(&key) {
            Some(queue) if !queue.is_empty() => queue.remove(0),
            _ => Outcome::Success,
        }
    }
}
