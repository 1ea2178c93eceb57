//! Experiment service
//!
//! Drives one attempt through its fixed stage sequence:
//! 1. Open the remote session to endpoint B
//! 2. Launch path setup on both endpoints without waiting
//! 3. Location setup
//! 4. Settle wait, then health checks of A and B
//! 5. Per workload: liveness check, captures, workload, analysis
//! 6. Result persistence
//! 7. Teardown, exactly once for every attempt that opened a session
//!
//! Endpoint A is this machine, endpoint B is reached over the remote session.
//! Every external failure is classified into a [`Failure`] tier and the most
//! severe one becomes the outcome of the attempt.

use async_trait::async_trait;
use chrono::Local;
use matador_core::{
    Attempt, Failure, Outcome, Placeholder, Side, Stage, TemplateParams, TemplateRegistry,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cleanup::{self, RecoveryCommands};
use crate::session::{CommandOutput, ExecutionSurface, RemoteConnector, SessionHandle};

const INTERRUPTED: &str = "interrupted";

/// Service trait for running pair attempts
#[async_trait]
pub trait ExperimentService: Send + Sync {
    /// Runs one attempt and returns its most severe classified outcome
    ///
    /// Everything started for the attempt is stopped before this returns.
    async fn run_attempt(&self, attempt: &Attempt, cancel: &CancellationToken) -> Outcome;
}

/// Fixed waits of an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExperimentTiming {
    /// Wait after location setup so slow paths come up before the checks
    pub path_settle: Duration,
    /// Wait after starting captures before they are checked
    pub capture_settle: Duration,
    /// Upper bound for each forced teardown command
    pub teardown_timeout: Duration,
}

/// Long-running handles of one attempt
#[derive(Default)]
struct AttemptHandles {
    path_a: Option<Box<dyn SessionHandle>>,
    path_b: Option<Box<dyn SessionHandle>>,
    capture_a: Option<Box<dyn SessionHandle>>,
    capture_b: Option<Box<dyn SessionHandle>>,
}

impl AttemptHandles {
    /// Stops the captures of the current workload, lets them flush and
    /// forgets them
    async fn stop_captures(&mut self, timeout: Duration) {
        let local = self.capture_a.as_mut().into_iter().collect();
        let remote = self.capture_b.as_mut().into_iter().collect();
        cleanup::cleanup(local, remote).await;

        let captures = [self.capture_a.as_mut(), self.capture_b.as_mut()]
            .into_iter()
            .flatten()
            .collect();
        cleanup::await_exit(captures, timeout).await;
        self.capture_a = None;
        self.capture_b = None;
    }

    /// Stops every handle, then waits up to `timeout` for all of them to exit
    ///
    /// Returns how many handles were still running afterwards.
    async fn stop_all(&mut self, timeout: Duration) -> usize {
        let local = [self.path_a.as_mut(), self.capture_a.as_mut()]
            .into_iter()
            .flatten()
            .collect();
        let remote = [self.path_b.as_mut(), self.capture_b.as_mut()]
            .into_iter()
            .flatten()
            .collect();
        let stopped = cleanup::cleanup(local, remote).await;
        debug!("Stopped {} handle(s), waiting for them to exit", stopped);

        let all = [
            self.path_a.as_mut(),
            self.capture_a.as_mut(),
            self.path_b.as_mut(),
            self.capture_b.as_mut(),
        ]
        .into_iter()
        .flatten()
        .collect();
        cleanup::await_exit(all, timeout).await
    }
}

/// Standard implementation of ExperimentService
pub struct StandardExperimentService {
    templates: Arc<TemplateRegistry>,
    local: Arc<dyn ExecutionSurface>,
    connector: Arc<dyn RemoteConnector>,
    workloads: Vec<String>,
    timing: ExperimentTiming,
}

impl StandardExperimentService {
    pub fn new(
        templates: Arc<TemplateRegistry>,
        local: Arc<dyn ExecutionSurface>,
        connector: Arc<dyn RemoteConnector>,
        workloads: Vec<String>,
        timing: ExperimentTiming,
    ) -> Self {
        Self {
            templates,
            local,
            connector,
            workloads,
            timing,
        }
    }

    fn render(&self, stage: Stage, params: &TemplateParams) -> Result<String, Failure> {
        self.templates
            .render(stage, params)
            .map_err(|e| Failure::fatal(format!("Invalid {} command: {}", stage, e)))
    }

    /// Starts a long-running command without waiting for it
    async fn launch(
        &self,
        surface: &dyn ExecutionSurface,
        stage: Stage,
        params: &TemplateParams,
    ) -> Result<Box<dyn SessionHandle>, Failure> {
        let command = self.render(stage, params)?;
        debug!("Launching {} on {}: {}", stage, surface.name(), command);

        surface.start(stage.key(), &command).await.map_err(|e| {
            Failure::fatal(format!(
                "{} could not be started on {}: {:#}",
                stage,
                surface.name(),
                e
            ))
        })
    }

    /// Runs a command to completion
    ///
    /// A launch error or non-zero exit is classified by `on_failure`;
    /// cancellation stops the command and is always fatal.
    async fn execute<F>(
        &self,
        surface: &dyn ExecutionSurface,
        stage: Stage,
        params: &TemplateParams,
        cancel: &CancellationToken,
        on_failure: F,
    ) -> Result<(), Failure>
    where
        F: Fn(String) -> Failure + Send,
    {
        let command = self.render(stage, params)?;
        debug!("Running {} on {}: {}", stage, surface.name(), command);

        let mut handle = surface.start(stage.key(), &command).await.map_err(|e| {
            on_failure(format!(
                "{} could not be started on {}: {:#}",
                stage,
                surface.name(),
                e
            ))
        })?;

        let waited = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = handle.wait() => Some(result),
        };

        let Some(result) = waited else {
            if let Err(e) = handle.terminate().await {
                warn!("Failed to stop {} after interruption: {:#}", stage, e);
            }
            return Err(interrupted());
        };

        match result {
            Ok(output) if output.success() => {
                debug!("{} on {} finished", stage, surface.name());
                Ok(())
            }
            Ok(output) => Err(on_failure(describe_exit(stage, surface.name(), &output))),
            Err(e) => Err(on_failure(format!(
                "{} on {} failed: {:#}",
                stage,
                surface.name(),
                e
            ))),
        }
    }

    /// Path setup, location setup and the health checks of both endpoints
    async fn prepare(
        &self,
        attempt: &Attempt,
        remote: &dyn ExecutionSurface,
        handles: &mut AttemptHandles,
        cancel: &CancellationToken,
    ) -> Result<(), Failure> {
        let local = self.local.as_ref();
        let params_a = attempt.params(Side::A);
        let params_b = attempt.params(Side::B);

        handles.path_a = Some(self.launch(local, Stage::NetworkSetupA, &params_a).await?);
        handles.path_b = Some(self.launch(remote, Stage::NetworkSetupB, &params_b).await?);

        self.execute(local, Stage::LocationSetup, &params_a, cancel, Failure::Fatal)
            .await?;

        debug!("Waiting {:?} for the paths to settle", self.timing.path_settle);
        pause(self.timing.path_settle, cancel).await?;

        self.execute(local, Stage::NetworkCheckA, &params_a, cancel, |msg| {
            Failure::endpoint(Side::A, msg)
        })
        .await?;
        self.execute(remote, Stage::NetworkCheckB, &params_b, cancel, |msg| {
            Failure::endpoint(Side::B, msg)
        })
        .await?;

        info!("Path of {} is up", attempt.describe());
        Ok(())
    }

    /// One workload: liveness, captures, execution and analysis
    async fn run_workload(
        &self,
        attempt: &Attempt,
        remote: &dyn ExecutionSurface,
        handles: &mut AttemptHandles,
        workload: &str,
        cancel: &CancellationToken,
    ) -> Result<(), Failure> {
        let local = self.local.as_ref();

        ensure_running(&mut handles.path_a, Side::A, "path setup")?;
        ensure_running(&mut handles.path_b, Side::B, "path setup")?;

        let now = Local::now();
        let capture_params = |side: Side| {
            attempt
                .params(side)
                .with(Placeholder::Workload, workload)
                .with(Placeholder::ResultFile, attempt.capture_file(side, workload, now))
        };
        let params_a = capture_params(Side::A);
        let params_b = capture_params(Side::B);

        handles.capture_a = Some(self.launch(local, Stage::MeasurementSetupA, &params_a).await?);
        handles.capture_b = Some(self.launch(remote, Stage::MeasurementSetupB, &params_b).await?);

        pause(self.timing.capture_settle, cancel).await?;
        ensure_running(&mut handles.capture_a, Side::A, "capture")?;
        ensure_running(&mut handles.capture_b, Side::B, "capture")?;

        let workload_params = attempt.params(Side::A).with(Placeholder::Workload, workload);
        let executed = self
            .execute(
                local,
                Stage::WorkloadExecution,
                &workload_params,
                cancel,
                Failure::Transient,
            )
            .await;

        if let Err(failure) = executed {
            let Failure::Transient(reason) = failure else {
                return Err(failure);
            };
            warn!(
                "Workload '{}' of {} failed, cleaning up: {}",
                workload,
                attempt.describe(),
                reason
            );
            self.execute(
                local,
                Stage::WorkloadCleanUp,
                &workload_params,
                cancel,
                Failure::Fatal,
            )
            .await?;
            handles.stop_captures(self.timing.teardown_timeout).await;
            return Err(Failure::Transient(reason));
        }

        handles.stop_captures(self.timing.teardown_timeout).await;

        let (analysed_a, analysed_b) = tokio::join!(
            self.execute(local, Stage::AnalysisA, &params_a, cancel, Failure::Transient),
            self.execute(remote, Stage::AnalysisB, &params_b, cancel, Failure::Transient),
        );
        worst(analysed_a, analysed_b)
    }

    async fn persist(
        &self,
        attempt: &Attempt,
        remote: &dyn ExecutionSurface,
        cancel: &CancellationToken,
    ) -> Result<(), Failure> {
        let saved_a = self
            .execute(
                self.local.as_ref(),
                Stage::ResultSaveA,
                &attempt.params(Side::A),
                cancel,
                Failure::Transient,
            )
            .await;
        if matches!(saved_a, Err(Failure::Fatal(_))) {
            return saved_a;
        }

        let saved_b = self
            .execute(
                remote,
                Stage::ResultSaveB,
                &attempt.params(Side::B),
                cancel,
                Failure::Transient,
            )
            .await;
        worst(saved_a, saved_b)
    }

    /// Everything between opening and tearing down the session
    async fn drive(
        &self,
        attempt: &Attempt,
        remote: &dyn ExecutionSurface,
        handles: &mut AttemptHandles,
        cancel: &CancellationToken,
    ) -> Outcome {
        if let Err(failure) = self.prepare(attempt, remote, handles, cancel).await {
            error!("Attempt {} failed during preparation: {}", attempt.describe(), failure);
            return failure.into();
        }

        let mut outcome = Outcome::Success;
        for workload in &self.workloads {
            info!("Running workload '{}' for {}", workload, attempt.describe());

            match self
                .run_workload(attempt, remote, handles, workload, cancel)
                .await
            {
                Ok(()) => debug!("Workload '{}' completed", workload),
                Err(Failure::Transient(msg)) => {
                    warn!("Workload '{}' of {}: {}", workload, attempt.describe(), msg);
                    outcome = outcome.escalate(Outcome::Transient(msg));
                }
                Err(failure) => {
                    error!(
                        "Workload '{}' of {} aborted: {}",
                        workload,
                        attempt.describe(),
                        failure
                    );
                    outcome = outcome.escalate(failure.into());
                    break;
                }
            }
        }

        if outcome.is_fatal() {
            return outcome;
        }

        if let Err(failure) = self.persist(attempt, remote, cancel).await {
            warn!("Saving results of {} failed: {}", attempt.describe(), failure);
            outcome = outcome.escalate(failure.into());
        }
        outcome
    }

    /// Stops every handle and lets it exit, then runs the forced teardown commands
    async fn teardown(
        &self,
        attempt: &Attempt,
        remote: &dyn ExecutionSurface,
        handles: &mut AttemptHandles,
    ) -> Result<(), Failure> {
        let lingering = handles.stop_all(self.timing.teardown_timeout).await;
        if lingering > 0 {
            warn!(
                "{} handle(s) of {} still running, relying on the forced teardown",
                lingering,
                attempt.describe()
            );
        }

        let commands = RecoveryCommands {
            local: self.render(Stage::NetworkTearDownA, &attempt.params(Side::A))?,
            remote: self.render(Stage::NetworkTearDownB, &attempt.params(Side::B))?,
        };
        cleanup::force_teardown(
            self.local.as_ref(),
            remote,
            &commands,
            self.timing.teardown_timeout,
        )
        .await
    }
}

#[async_trait]
impl ExperimentService for StandardExperimentService {
    async fn run_attempt(&self, attempt: &Attempt, cancel: &CancellationToken) -> Outcome {
        info!("Starting attempt {}", attempt.describe());

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(interrupted()),
            result = self.connector.open() => result.map_err(|e| {
                Failure::fatal(format!("Can not open a session to endpoint B: {:#}", e))
            }),
        };

        let remote = match opened {
            Ok(remote) => remote,
            Err(failure) => {
                error!("Attempt {} could not start: {}", attempt.describe(), failure);
                return failure.into();
            }
        };

        let mut handles = AttemptHandles::default();
        let mut outcome = self
            .drive(attempt, remote.as_ref(), &mut handles, cancel)
            .await;

        if let Err(failure) = self.teardown(attempt, remote.as_ref(), &mut handles).await {
            error!("Teardown of {} failed: {}", attempt.describe(), failure);
            outcome = outcome.escalate(failure.into());
        }

        if let Err(e) = remote.close().await {
            warn!("Failed to close the session of {}: {:#}", attempt.describe(), e);
        }

        if cancel.is_cancelled() && !outcome.is_fatal() {
            outcome = Outcome::Fatal(INTERRUPTED.to_string());
        }

        match &outcome {
            Outcome::Success => info!("Attempt {} succeeded", attempt.describe()),
            other => warn!("Attempt {} finished with {}", attempt.describe(), other),
        }
        outcome
    }
}

fn interrupted() -> Failure {
    Failure::fatal(INTERRUPTED)
}

/// Sleeps for `duration` unless cancelled first
async fn pause(duration: Duration, cancel: &CancellationToken) -> Result<(), Failure> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(interrupted()),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Fails with an endpoint failure of `side` unless the handle is still running
fn ensure_running(
    handle: &mut Option<Box<dyn SessionHandle>>,
    side: Side,
    what: &str,
) -> Result<(), Failure> {
    let Some(handle) = handle.as_mut() else {
        return Err(Failure::endpoint(
            side,
            format!("{} of endpoint {} was never started", what, side),
        ));
    };

    match handle.poll() {
        Ok(state) if state.is_alive() => Ok(()),
        Ok(state) => Err(Failure::endpoint(
            side,
            format!("{} of endpoint {} is not running ({:?})", what, side, state),
        )),
        Err(e) => Err(Failure::endpoint(
            side,
            format!("{} of endpoint {} could not be polled: {:#}", what, side, e),
        )),
    }
}

fn describe_exit(stage: Stage, surface: &str, output: &CommandOutput) -> String {
    match output.output.lines().rev().find(|line| !line.trim().is_empty()) {
        Some(line) => format!(
            "{} on {} exited with {}: {}",
            stage,
            surface,
            output.exit_code,
            line.trim()
        ),
        None => format!("{} on {} exited with {}", stage, surface, output.exit_code),
    }
}

/// The more severe of two results; the first wins a tie
fn worst(first: Result<(), Failure>, second: Result<(), Failure>) -> Result<(), Failure> {
    match (first, second) {
        (Err(a), Err(b)) if b.severity() > a.severity() => Err(b),
        (Err(a), _) => Err(a),
        (Ok(()), second) => second,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        Behavior, ScriptedConnector, ScriptedSurface, stage_registry, stage_templates,
    };
    use matador_core::{Coordinates, Endpoint};

    struct Rig {
        local: ScriptedSurface,
        remote: ScriptedSurface,
        connector: Arc<ScriptedConnector>,
        service: StandardExperimentService,
    }

    fn timing() -> ExperimentTiming {
        ExperimentTiming {
            path_settle: Duration::ZERO,
            capture_settle: Duration::ZERO,
            teardown_timeout: Duration::from_secs(1),
        }
    }

    fn rig_with(
        local: ScriptedSurface,
        remote: ScriptedSurface,
        connector: ScriptedConnector,
        registry: TemplateRegistry,
        workloads: &[&str],
    ) -> Rig {
        let connector = Arc::new(connector);
        let service = StandardExperimentService::new(
            Arc::new(registry),
            Arc::new(local.clone()),
            connector.clone(),
            workloads.iter().map(|w| w.to_string()).collect(),
            timing(),
        );
        Rig {
            local,
            remote,
            connector,
            service,
        }
    }

    fn rig(local: ScriptedSurface, remote: ScriptedSurface) -> Rig {
        let connector = ScriptedConnector::new(remote.clone());
        rig_with(local, remote, connector, stage_registry(), &["maps"])
    }

    fn attempt() -> Attempt {
        let endpoint = |cc: &str, host: &str| Endpoint {
            country_code: cc.to_string(),
            hostname: host.to_string(),
            coordinates: Coordinates::new(13.4, 52.5),
        };
        Attempt::new(endpoint("DE", "h1"), endpoint("FR", "h3"), 7, "/data")
    }

    async fn run(rig: &Rig) -> Outcome {
        rig.service
            .run_attempt(&attempt(), &CancellationToken::new())
            .await
    }

    fn assert_torn_down(rig: &Rig) {
        assert_eq!(rig.local.terminations("network_setup_a h1"), 1);
        assert_eq!(rig.remote.terminations("network_setup_b h3"), 1);
        assert!(rig.local.ran("network_tear_down_a h1"));
        assert!(rig.remote.ran("network_tear_down_b h3"));
        assert_eq!(rig.remote.closes(), 1);
    }

    #[tokio::test]
    async fn test_successful_attempt_runs_every_stage_in_order() {
        let rig = rig(ScriptedSurface::new("local"), ScriptedSurface::new("worker"));

        assert_eq!(run(&rig).await, Outcome::Success);

        assert_eq!(
            rig.local.started(),
            vec![
                "network_setup_a h1",
                "location_setup h1",
                "network_check_a h1",
                "measurement_setup_a h1 maps",
                "workload_execution h1 maps",
                "analysis_a h1 maps",
                "result_save_a h1",
                "network_tear_down_a h1",
            ]
        );
        assert_eq!(
            rig.remote.started(),
            vec![
                "network_setup_b h3",
                "network_check_b h3",
                "measurement_setup_b h3 maps",
                "analysis_b h3 maps",
                "result_save_b h3",
                "network_tear_down_b h3",
            ]
        );
        assert_eq!(rig.local.terminations("measurement_setup_a h1 maps"), 1);
        assert_eq!(rig.remote.terminations("measurement_setup_b h3 maps"), 1);
        assert_eq!(rig.connector.opens(), 1);
        assert_torn_down(&rig);
    }

    #[tokio::test]
    async fn test_teardown_waits_for_paths_before_recovery() {
        let rig = rig(ScriptedSurface::new("local"), ScriptedSurface::new("worker"));

        assert_eq!(run(&rig).await, Outcome::Success);

        let waited_a = rig.local.position("wait network_setup_a h1").unwrap();
        let recovered_a = rig.local.position("start network_tear_down_a h1").unwrap();
        assert!(waited_a < recovered_a);

        let waited_b = rig.remote.position("wait network_setup_b h3").unwrap();
        let recovered_b = rig.remote.position("start network_tear_down_b h3").unwrap();
        assert!(waited_b < recovered_b);
    }

    #[tokio::test]
    async fn test_captures_exit_before_analysis() {
        let rig = rig(ScriptedSurface::new("local"), ScriptedSurface::new("worker"));

        assert_eq!(run(&rig).await, Outcome::Success);

        let flushed = rig.local.position("wait measurement_setup_a h1 maps").unwrap();
        let analysed = rig.local.position("start analysis_a h1 maps").unwrap();
        assert!(flushed < analysed);
        assert!(rig.remote.position("wait measurement_setup_b h3 maps").is_some());
    }

    #[tokio::test]
    async fn test_path_ignoring_interrupt_is_left_to_forced_teardown() {
        let local = ScriptedSurface::new("local").on("network_setup_a", Behavior::IgnoresInterrupt);
        let rig = rig(local, ScriptedSurface::new("worker"));

        let started = tokio::time::Instant::now();
        assert_eq!(run(&rig).await, Outcome::Success);

        // bounded by the teardown timeout of the rig
        assert!(started.elapsed() >= timing().teardown_timeout);
        assert_torn_down(&rig);
    }

    #[tokio::test]
    async fn test_interrupted_path_shuts_down_before_recovery_on_real_shell() {
        let marker = std::env::temp_dir()
            .join(format!("matador-path-{}", uuid::Uuid::new_v4().simple()))
            .display()
            .to_string();

        let mut templates = stage_templates();
        for stage in [
            Stage::NetworkCheckA,
            Stage::LocationSetup,
            Stage::WorkloadExecution,
            Stage::WorkloadCleanUp,
            Stage::AnalysisA,
            Stage::ResultSaveA,
        ] {
            templates.insert(stage.key().to_string(), "true".to_string());
        }
        templates.insert(
            Stage::NetworkSetupA.key().to_string(),
            format!(
                "trap 'sleep 0.5; touch {}; exit 0' INT; while true; do sleep 0.1; done",
                marker
            ),
        );
        templates.insert(Stage::MeasurementSetupA.key().to_string(), "sleep 30".to_string());
        templates.insert(
            Stage::NetworkTearDownA.key().to_string(),
            format!("test -f {}", marker),
        );

        let remote = ScriptedSurface::new("worker");
        let service = StandardExperimentService::new(
            Arc::new(TemplateRegistry::from_map(templates).unwrap()),
            Arc::new(crate::session::LocalSurface::new()),
            Arc::new(ScriptedConnector::new(remote.clone())),
            vec!["maps".to_string()],
            ExperimentTiming {
                path_settle: Duration::from_millis(200),
                capture_settle: Duration::from_millis(200),
                teardown_timeout: Duration::from_secs(10),
            },
        );

        let outcome = service
            .run_attempt(&attempt(), &CancellationToken::new())
            .await;
        let _ = std::fs::remove_file(&marker);

        assert_eq!(outcome, Outcome::Success);
        assert!(remote.ran("network_tear_down_b h3"));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_b_is_fatal() {
        let local = ScriptedSurface::new("local");
        let remote = ScriptedSurface::new("worker");
        let rig = rig_with(
            local,
            remote,
            ScriptedConnector::unreachable(),
            stage_registry(),
            &["maps"],
        );

        let outcome = run(&rig).await;
        assert!(outcome.is_fatal());
        assert!(rig.local.started().is_empty());
        assert_eq!(rig.connector.opens(), 1);
    }

    #[tokio::test]
    async fn test_location_setup_failure_is_fatal() {
        let local = ScriptedSurface::new("local").on("location_setup", Behavior::Exit(1));
        let rig = rig(local, ScriptedSurface::new("worker"));

        assert!(run(&rig).await.is_fatal());
        assert!(!rig.local.ran("network_check_a"));
        assert_torn_down(&rig);
    }

    #[tokio::test]
    async fn test_health_check_failures_blame_the_endpoint() {
        let local = ScriptedSurface::new("local").on("network_check_a", Behavior::Exit(1));
        let rig_a = rig(local, ScriptedSurface::new("worker"));
        let outcome = run(&rig_a).await;
        assert!(matches!(outcome, Outcome::EndpointAFailure(_)));
        assert!(!rig_a.remote.ran("network_check_b"));
        assert!(!rig_a.local.ran("workload_execution"));
        assert!(!rig_a.local.ran("result_save_a"));
        assert_torn_down(&rig_a);

        let remote = ScriptedSurface::new("worker").on("network_check_b", Behavior::Exit(255));
        let rig_b = rig(ScriptedSurface::new("local"), remote);
        let outcome = run(&rig_b).await;
        assert!(matches!(outcome, Outcome::EndpointBFailure(_)));
        assert!(!rig_b.local.ran("measurement_setup_a"));
        assert_torn_down(&rig_b);
    }

    #[tokio::test]
    async fn test_dead_path_aborts_workloads_but_saves_results() {
        let remote = ScriptedSurface::new("worker").on("network_setup_b", Behavior::Exit(1));
        let rig = rig(ScriptedSurface::new("local"), remote);

        let outcome = run(&rig).await;
        assert!(matches!(outcome, Outcome::EndpointBFailure(_)));
        assert!(!rig.local.ran("measurement_setup_a"));
        assert!(rig.local.ran("result_save_a h1"));
        assert!(rig.remote.ran("result_save_b h3"));
        // already exited, nothing to stop
        assert_eq!(rig.remote.terminations("network_setup_b h3"), 0);
        assert!(rig.remote.ran("network_tear_down_b h3"));
    }

    #[tokio::test]
    async fn test_dead_capture_blames_its_endpoint() {
        let local = ScriptedSurface::new("local").on("measurement_setup_a", Behavior::Exit(1));
        let rig = rig(local, ScriptedSurface::new("worker"));

        let outcome = run(&rig).await;
        assert!(matches!(outcome, Outcome::EndpointAFailure(_)));
        assert!(!rig.local.ran("workload_execution"));
        assert_eq!(rig.remote.terminations("measurement_setup_b h3 maps"), 1);
        assert_torn_down(&rig);
    }

    #[tokio::test]
    async fn test_failed_workload_is_transient_and_next_workload_runs() {
        let local =
            ScriptedSurface::new("local").on("workload_execution h1 maps", Behavior::Exit(2));
        let remote = ScriptedSurface::new("worker");
        let connector = ScriptedConnector::new(remote.clone());
        let rig = rig_with(local, remote, connector, stage_registry(), &["maps", "video"]);

        let outcome = run(&rig).await;
        assert!(matches!(outcome, Outcome::Transient(_)));

        assert!(rig.local.ran("workload_clean_up h1 maps"));
        assert!(!rig.local.ran("analysis_a h1 maps"));
        assert_eq!(rig.local.terminations("measurement_setup_a h1 maps"), 1);
        assert_eq!(rig.remote.terminations("measurement_setup_b h3 maps"), 1);

        assert!(rig.local.ran("workload_execution h1 video"));
        assert!(rig.remote.ran("analysis_b h3 video"));
        assert!(rig.local.ran("result_save_a h1"));
        assert_torn_down(&rig);
    }

    #[tokio::test]
    async fn test_failed_workload_clean_up_is_fatal() {
        let local = ScriptedSurface::new("local")
            .on("workload_execution", Behavior::Exit(2))
            .on("workload_clean_up", Behavior::Exit(1));
        let rig = rig(local, ScriptedSurface::new("worker"));

        assert!(run(&rig).await.is_fatal());
        assert!(!rig.local.ran("result_save_a"));
        assert_eq!(rig.local.terminations("measurement_setup_a h1 maps"), 1);
        assert_torn_down(&rig);
    }

    #[tokio::test]
    async fn test_failed_analysis_and_persistence_are_transient() {
        let remote = ScriptedSurface::new("worker").on("analysis_b", Behavior::Exit(1));
        let rig_analysis = rig(ScriptedSurface::new("local"), remote);
        let outcome = run(&rig_analysis).await;
        assert!(matches!(outcome, Outcome::Transient(_)));
        assert!(rig_analysis.local.ran("analysis_a h1 maps"));
        assert!(rig_analysis.remote.ran("result_save_b h3"));

        let remote = ScriptedSurface::new("worker").on("result_save_b", Behavior::FailToStart);
        let rig_save = rig(ScriptedSurface::new("local"), remote);
        let outcome = run(&rig_save).await;
        assert!(matches!(outcome, Outcome::Transient(_)));
        assert_torn_down(&rig_save);
    }

    #[tokio::test]
    async fn test_forced_teardown_failure_is_fatal() {
        let local = ScriptedSurface::new("local").on("network_tear_down_a", Behavior::Exit(1));
        let rig = rig(local, ScriptedSurface::new("worker"));

        let outcome = run(&rig).await;
        assert!(outcome.is_fatal());
        assert!(rig.local.ran("result_save_a h1"));
        assert_torn_down(&rig);
    }

    #[tokio::test]
    async fn test_unresolved_placeholder_is_fatal() {
        let mut templates = stage_templates();
        templates.insert(
            "network_check_a".to_string(),
            "network_check_a {result_file}".to_string(),
        );
        let registry = TemplateRegistry::from_map(templates).unwrap();
        let remote = ScriptedSurface::new("worker");
        let connector = ScriptedConnector::new(remote.clone());
        let rig = rig_with(
            ScriptedSurface::new("local"),
            remote,
            connector,
            registry,
            &["maps"],
        );

        let outcome = run(&rig).await;
        assert!(outcome.is_fatal());
        assert!(outcome.message().unwrap().contains("network_check_a"));
        assert!(!rig.local.ran("network_check_a"));
        assert_torn_down(&rig);
    }

    #[tokio::test]
    async fn test_cancellation_tears_down_and_is_fatal() {
        let cancel = CancellationToken::new();
        let local =
            ScriptedSurface::new("local").on("location_setup", Behavior::Cancels(cancel.clone()));
        let rig = rig(local, ScriptedSurface::new("worker"));

        let outcome = rig.service.run_attempt(&attempt(), &cancel).await;
        assert_eq!(outcome, Outcome::Fatal(INTERRUPTED.to_string()));
        assert!(!rig.local.ran("network_check_a"));
        assert_torn_down(&rig);
    }

    #[tokio::test]
    async fn test_session_close_failure_is_only_a_warning() {
        let remote = ScriptedSurface::new("worker").failing_close();
        let rig = rig(ScriptedSurface::new("local"), remote);

        assert_eq!(run(&rig).await, Outcome::Success);
        assert_eq!(rig.remote.closes(), 1);
    }

    #[test]
    fn test_worst_prefers_severity_then_first() {
        let transient = || Err(Failure::transient("a"));
        let fatal = || Err(Failure::fatal("b"));

        assert_eq!(worst(Ok(()), Ok(())), Ok(()));
        assert_eq!(worst(transient(), fatal()), fatal());
        assert_eq!(worst(fatal(), transient()), fatal());
        assert_eq!(
            worst(transient(), Err(Failure::transient("c"))),
            transient()
        );
    }
}
