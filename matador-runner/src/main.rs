//! Matador Runner
//!
//! Runs pairwise network measurements between vantage points of different
//! countries. Endpoint A is this machine, endpoint B a worker reached over SSH.
//!
//! Architecture:
//! - Configuration: JSON file with templates, workloads and timing
//! - Sessions: local process groups and a persistent SSH control master
//! - Services: the experiment service driving one pair attempt
//! - Scheduler: pair selection over the candidate pool and status matrix
//!
//! Exit codes: 0 on normal completion, 1 on invocation or initialization
//! errors, 3 when a fatal failure or interruption stopped the run.

mod cleanup;
mod config;
mod report;
mod scheduler;
mod service;
mod session;
mod shutdown;
mod steps;

#[cfg(test)]
mod testing;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use matador_core::{CandidatePool, Node, parse_records};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::report::MatrixSnapshot;
use crate::scheduler::{PairingScheduler, RunOutcome};
use crate::service::{ExperimentService, StandardExperimentService};
use crate::session::{ExecutionSurface, LocalSurface, RemoteConnector, SshConnector};
use crate::steps::run_steps;

const EXIT_INIT_FAILURE: u8 = 1;

#[derive(Parser)]
#[command(name = "matador")]
#[command(about = "Pairwise network measurement runner", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(
        long,
        short,
        global = true,
        env = "MATADOR_CONFIG",
        default_value = "matador.json"
    )]
    config: PathBuf,

    /// Node list, overrides `input_file`
    #[arg(long, global = true)]
    input: Option<PathBuf>,

    /// Log file, overrides `log_file`
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Run the measurement (default)
    Run,
    /// Check configuration, templates and node list without running anything
    Validate,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(EXIT_INIT_FAILURE)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::from(EXIT_INIT_FAILURE);
        }
    };

    let command = cli.command.unwrap_or(Command::Run);
    let log_file = (command == Command::Run).then(|| config.log_file());

    if let Err(e) = init_logging(log_file.as_deref()) {
        eprintln!("Error: {:#}", e);
        return ExitCode::from(EXIT_INIT_FAILURE);
    }

    let result = match command {
        Command::Run => run(config).await,
        Command::Validate => validate(&config).map(|()| 0),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("The initialization failed: {:#}", e);
            ExitCode::from(EXIT_INIT_FAILURE)
        }
    }
}

/// Loads the configuration file and applies command line overrides
fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load(&cli.config)?;

    if let Some(input) = &cli.input {
        config.input_file = input.clone();
    }
    if let Some(log_file) = &cli.log_file {
        config.log_file = Some(log_file.clone());
    }

    config.validate()?;
    Ok(config)
}

/// Logs to stderr and, when given, appends plain lines to `log_file`
fn init_logging(log_file: Option<&Path>) -> Result<()> {
    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "matador_runner=info,matador_core=info".into()),
        )
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()
        .context("Failed to initialize logging")
}

fn load_nodes(path: &Path) -> Result<Vec<Node>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read input file {}", path.display()))?;
    let nodes = parse_records(&text)
        .with_context(|| format!("Invalid input file {}", path.display()))?;

    if nodes.is_empty() {
        bail!("Input file {} contains no nodes", path.display());
    }
    Ok(nodes)
}

fn validate(config: &Config) -> Result<()> {
    let pool = CandidatePool::from_nodes(load_nodes(&config.input_file)?);

    println!("Configuration OK");
    println!("  Worker:    {}", config.worker.destination());
    println!("  Workloads: {}", config.workloads.join(", "));
    println!("  Countries: {}", pool.len());
    for group in pool.groups() {
        println!("    {} ({} node(s))", group.country_code, group.remaining());
    }
    Ok(())
}

async fn run(config: Config) -> Result<u8> {
    info!("Starting the measurement");

    let cancel = CancellationToken::new();
    let _signals = shutdown::install(cancel.clone())?;

    let templates = Arc::new(config.templates()?);
    let pool = CandidatePool::from_nodes(load_nodes(&config.input_file)?);
    info!(
        "Loaded {} countries from {}",
        pool.len(),
        config.input_file.display()
    );

    let local: Arc<dyn ExecutionSurface> = Arc::new(LocalSurface::new());

    run_steps(
        local.as_ref(),
        "initialization",
        &config.initialization,
        &cancel,
    )
    .await?;

    let connector: Arc<dyn RemoteConnector> = Arc::new(SshConnector::new(
        config.worker.clone(),
        config.timing.connect_timeout(),
    ));
    let service: Arc<dyn ExperimentService> = Arc::new(StandardExperimentService::new(
        templates,
        local.clone(),
        connector,
        config.workloads.clone(),
        config.timing.experiment(),
    ));

    let mut scheduler = PairingScheduler::new(
        pool,
        config.storage_directory.clone(),
        service,
        cancel.clone(),
    );

    info!("Successful initialization");

    let outcome = scheduler.run().await;
    let mut exit_code = outcome.exit_code();

    match &outcome {
        RunOutcome::Completed => {
            info!("All possible pairs were tried");
            match run_steps(local.as_ref(), "completion", &config.completion, &cancel).await {
                Ok(()) => info!("The completion was successful and the measurement ends"),
                Err(e) => {
                    error!("The completion failed: {:#}", e);
                    exit_code = EXIT_INIT_FAILURE;
                }
            }
        }
        RunOutcome::Aborted(reason) => {
            error!("The measurement was terminated: {}", reason);
        }
    }

    let remaining: usize = scheduler
        .pool()
        .groups()
        .iter()
        .map(|group| group.remaining())
        .sum();
    info!(
        "{} experiment(s) run, {} node(s) left in the candidate pool",
        scheduler.attempts(),
        remaining
    );
    info!(
        "Status matrix:\n{}",
        scheduler.matrix().render(&scheduler.labels())
    );

    if let Some(path) = &config.matrix_output {
        let snapshot = MatrixSnapshot::new(
            scheduler.labels(),
            scheduler.attempts(),
            &outcome,
            scheduler.matrix(),
        );
        match snapshot.write(path) {
            Ok(()) => info!("Status matrix written to {}", path.display()),
            Err(e) => warn!("{:#}", e),
        }
    }

    cancel.cancel();
    Ok(exit_code)
}
