//! Runner configuration
//!
//! Loaded from a JSON file. Holds the input and storage locations, the
//! workloads, the remote worker, the stage command templates, the waits of an
//! attempt and the steps run before and after the sweep.

use anyhow::{Context, Result, bail};
use matador_core::TemplateRegistry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::service::ExperimentTiming;
use crate::session::SshTarget;

/// Log file used when none is configured
pub const DEFAULT_LOG_FILE: &str = "matador.log";

/// Runner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node list, one `country hostname longitude latitude` record per line,
    /// grouped by country
    pub input_file: PathBuf,

    /// Result directory on both endpoints
    pub storage_directory: String,

    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Workloads run in order for every pair
    pub workloads: Vec<String>,

    /// Endpoint B host
    pub worker: SshTarget,

    #[serde(default)]
    pub timing: Timing,

    /// Stage name to command template
    pub commands: BTreeMap<String, String>,

    #[serde(default)]
    pub initialization: Vec<Step>,

    #[serde(default)]
    pub completion: Vec<Step>,

    /// Where to write the final status matrix as JSON
    #[serde(default)]
    pub matrix_output: Option<PathBuf>,
}

/// Waits and timeouts, in seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    pub connect_timeout_secs: u64,
    pub path_settle_secs: u64,
    pub capture_settle_secs: u64,
    pub teardown_timeout_secs: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            path_settle_secs: 100,
            capture_settle_secs: 2,
            teardown_timeout_secs: 120,
        }
    }
}

impl Timing {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn experiment(&self) -> ExperimentTiming {
        ExperimentTiming {
            path_settle: Duration::from_secs(self.path_settle_secs),
            capture_settle: Duration::from_secs(self.capture_settle_secs),
            teardown_timeout: Duration::from_secs(self.teardown_timeout_secs),
        }
    }
}

/// A local command run before or after the sweep
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub command: String,
    /// Wait after the command finished
    #[serde(default)]
    pub pause_secs: u64,
}

impl Step {
    pub fn pause(&self) -> Duration {
        Duration::from_secs(self.pause_secs)
    }
}

impl Config {
    /// Reads and parses the configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration {}", path.display()))?;
        Self::from_json(&text)
            .with_context(|| format!("Invalid configuration {}", path.display()))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("Failed to parse configuration")
    }

    /// Configured log file, or the default when missing or empty
    pub fn log_file(&self) -> PathBuf {
        match &self.log_file {
            Some(path) if !path.as_os_str().is_empty() => path.clone(),
            _ => PathBuf::from(DEFAULT_LOG_FILE),
        }
    }

    /// Parses the stage command templates
    pub fn templates(&self) -> Result<TemplateRegistry> {
        TemplateRegistry::from_map(&self.commands).context("Invalid command templates")
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        if self.input_file.as_os_str().is_empty() {
            bail!("input_file cannot be empty");
        }

        if self.storage_directory.is_empty() {
            bail!("storage_directory cannot be empty");
        }

        if self.workloads.is_empty() {
            bail!("at least one workload must be configured");
        }

        if let Some(workload) = self
            .workloads
            .iter()
            .find(|w| w.is_empty() || w.contains(char::is_whitespace) || w.contains('/'))
        {
            bail!("invalid workload name '{}'", workload);
        }

        if self.worker.host.is_empty() {
            bail!("worker.host cannot be empty");
        }

        if self.worker.user.is_empty() {
            bail!("worker.user cannot be empty");
        }

        if self.timing.connect_timeout_secs == 0 {
            bail!("timing.connect_timeout_secs must be greater than 0");
        }

        if self.timing.teardown_timeout_secs == 0 {
            bail!("timing.teardown_timeout_secs must be greater than 0");
        }

        if let Some(step) = self
            .initialization
            .iter()
            .chain(&self.completion)
            .find(|s| s.command.trim().is_empty())
        {
            bail!("step command cannot be empty (pause {}s)", step.pause_secs);
        }

        self.templates()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::stage_templates;
    use matador_core::TemplateError;

    fn config() -> Config {
        Config {
            input_file: PathBuf::from("nodes.txt"),
            storage_directory: "/data/".to_string(),
            log_file: None,
            workloads: vec!["maps".to_string()],
            worker: SshTarget {
                host: "10.0.0.2".to_string(),
                user: "root".to_string(),
                port: 22,
                identity_file: None,
                ssh_options: Vec::new(),
            },
            timing: Timing::default(),
            commands: stage_templates(),
            initialization: Vec::new(),
            completion: Vec::new(),
            matrix_output: None,
        }
    }

    #[test]
    fn test_example_config_is_valid() {
        let config = Config::from_json(include_str!("../../matador.example.json")).unwrap();
        config.validate().unwrap();

        assert_eq!(config.workloads, vec!["maps", "video"]);
        assert_eq!(config.initialization.len(), 1);
        assert_eq!(config.initialization[0].pause(), Duration::from_secs(5));
        assert_eq!(config.worker.destination(), "matador@worker.example.org");
        assert_eq!(config.log_file(), PathBuf::from("measurement.log"));
    }

    #[test]
    fn test_defaults() {
        let json = serde_json::json!({
            "input_file": "nodes.txt",
            "storage_directory": "/data/",
            "workloads": ["maps"],
            "worker": { "host": "worker", "user": "matador" },
            "commands": stage_templates(),
        });
        let config: Config = serde_json::from_value(json).unwrap();

        assert_eq!(config.timing, Timing::default());
        assert_eq!(config.timing.connect_timeout(), Duration::from_secs(30));
        assert_eq!(
            config.timing.experiment().path_settle,
            Duration::from_secs(100)
        );
        assert_eq!(config.log_file(), PathBuf::from(DEFAULT_LOG_FILE));
        assert!(config.initialization.is_empty());
        assert!(config.matrix_output.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_log_file_falls_back() {
        let mut config = config();
        config.log_file = Some(PathBuf::new());
        assert_eq!(config.log_file(), PathBuf::from(DEFAULT_LOG_FILE));
    }

    #[test]
    fn test_config_validation() {
        let mut config = config();
        assert!(config.validate().is_ok());

        config.workloads.clear();
        assert!(config.validate().is_err());

        config.workloads = vec!["two words".to_string()];
        assert!(config.validate().is_err());

        config.workloads = vec!["maps".to_string()];
        config.storage_directory = String::new();
        assert!(config.validate().is_err());

        config.storage_directory = "/data/".to_string();
        config.timing.connect_timeout_secs = 0;
        assert!(config.validate().is_err());

        config.timing.connect_timeout_secs = 30;
        config.completion.push(Step {
            command: "  ".to_string(),
            pause_secs: 0,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_stage_is_rejected() {
        let mut config = config();
        config.commands.remove("result_save_b");

        let err = config.validate().unwrap_err();
        let template_error = err.downcast_ref::<TemplateError>().unwrap();
        assert!(matches!(template_error, TemplateError::MissingStage(_)));
    }

    #[test]
    fn test_load_reports_path() {
        let err = Config::load(Path::new("/nonexistent/matador.json")).unwrap_err();
        assert!(format!("{:#}", err).contains("/nonexistent/matador.json"));
    }
}
