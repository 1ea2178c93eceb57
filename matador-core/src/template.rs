//! Command templates
//!
//! Each external stage is configured as a shell command template with
//! named slots, e.g. `network_setup.sh {hostname}`. Slots are validated
//! when the registry is built and resolved when a stage is invoked; a slot
//! without a value is a configuration error, never an empty substitution.
//!
//! `{{` and `}}` produce literal braces.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// The external stages of an attempt, in invocation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    NetworkSetupA,
    NetworkSetupB,
    NetworkCheckA,
    NetworkCheckB,
    LocationSetup,
    MeasurementSetupA,
    MeasurementSetupB,
    WorkloadExecution,
    WorkloadCleanUp,
    AnalysisA,
    AnalysisB,
    ResultSaveA,
    ResultSaveB,
    NetworkTearDownA,
    NetworkTearDownB,
}

impl Stage {
    pub const ALL: [Stage; 15] = [
        Stage::NetworkSetupA,
        Stage::NetworkSetupB,
        Stage::NetworkCheckA,
        Stage::NetworkCheckB,
        Stage::LocationSetup,
        Stage::MeasurementSetupA,
        Stage::MeasurementSetupB,
        Stage::WorkloadExecution,
        Stage::WorkloadCleanUp,
        Stage::AnalysisA,
        Stage::AnalysisB,
        Stage::ResultSaveA,
        Stage::ResultSaveB,
        Stage::NetworkTearDownA,
        Stage::NetworkTearDownB,
    ];

    /// Configuration key of the stage
    pub fn key(self) -> &'static str {
        match self {
            Stage::NetworkSetupA => "network_setup_a",
            Stage::NetworkSetupB => "network_setup_b",
            Stage::NetworkCheckA => "network_check_a",
            Stage::NetworkCheckB => "network_check_b",
            Stage::LocationSetup => "location_setup",
            Stage::MeasurementSetupA => "measurement_setup_a",
            Stage::MeasurementSetupB => "measurement_setup_b",
            Stage::WorkloadExecution => "workload_execution",
            Stage::WorkloadCleanUp => "workload_clean_up",
            Stage::AnalysisA => "analysis_a",
            Stage::AnalysisB => "analysis_b",
            Stage::ResultSaveA => "result_save_a",
            Stage::ResultSaveB => "result_save_b",
            Stage::NetworkTearDownA => "network_tear_down_a",
            Stage::NetworkTearDownB => "network_tear_down_b",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for Stage {
    type Err = TemplateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.key() == s)
            .ok_or_else(|| TemplateError::UnknownStage(s.to_string()))
    }
}

/// Named parameter slots a template may reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Placeholder {
    Hostname,
    Country,
    Coordinates,
    PeerHostname,
    PeerCountry,
    PeerCoordinates,
    Storage,
    Workload,
    ResultFile,
    Counter,
}

impl Placeholder {
    pub const ALL: [Placeholder; 10] = [
        Placeholder::Hostname,
        Placeholder::Country,
        Placeholder::Coordinates,
        Placeholder::PeerHostname,
        Placeholder::PeerCountry,
        Placeholder::PeerCoordinates,
        Placeholder::Storage,
        Placeholder::Workload,
        Placeholder::ResultFile,
        Placeholder::Counter,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Placeholder::Hostname => "hostname",
            Placeholder::Country => "country",
            Placeholder::Coordinates => "coordinates",
            Placeholder::PeerHostname => "peer_hostname",
            Placeholder::PeerCountry => "peer_country",
            Placeholder::PeerCoordinates => "peer_coordinates",
            Placeholder::Storage => "storage",
            Placeholder::Workload => "workload",
            Placeholder::ResultFile => "result_file",
            Placeholder::Counter => "counter",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        Placeholder::ALL.into_iter().find(|p| p.name() == name)
    }
}

impl fmt::Display for Placeholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Template configuration and resolution errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unknown stage '{0}'")]
    UnknownStage(String),

    #[error("missing command template for stage '{0}'")]
    MissingStage(Stage),

    #[error("stage '{stage}': unknown placeholder '{{{name}}}'")]
    UnknownPlaceholder { stage: Stage, name: String },

    #[error("stage '{stage}': unbalanced brace at byte {position}")]
    UnbalancedBrace { stage: Stage, position: usize },

    #[error("stage '{stage}': empty command")]
    EmptyCommand { stage: Stage },

    #[error("stage '{stage}': no value for placeholder '{{{placeholder}}}'")]
    Unresolved {
        stage: Stage,
        placeholder: Placeholder,
    },
}

/// Values for template slots
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateParams {
    values: BTreeMap<Placeholder, String>,
}

impl TemplateParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a slot value, replacing any previous one
    pub fn with(mut self, placeholder: Placeholder, value: impl Into<String>) -> Self {
        self.values.insert(placeholder, value.into());
        self
    }

    pub fn get(&self, placeholder: Placeholder) -> Option<&str> {
        self.values.get(&placeholder).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Slot(Placeholder),
}

/// A parsed command template for one stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    stage: Stage,
    segments: Vec<Segment>,
}

impl CommandTemplate {
    /// Parses `raw`, rejecting unknown slots and stray braces
    pub fn parse(stage: Stage, raw: &str) -> Result<Self, TemplateError> {
        if raw.trim().is_empty() {
            return Err(TemplateError::EmptyCommand { stage });
        }

        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = raw.char_indices().peekable();

        while let Some((pos, c)) = chars.next() {
            match c {
                '{' if matches!(chars.peek(), Some((_, '{'))) => {
                    chars.next();
                    literal.push('{');
                }
                '}' if matches!(chars.peek(), Some((_, '}'))) => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for (_, n) in chars.by_ref() {
                        if n == '}' {
                            closed = true;
                            break;
                        }
                        name.push(n);
                    }
                    if !closed {
                        return Err(TemplateError::UnbalancedBrace { stage, position: pos });
                    }
                    let slot = Placeholder::from_name(name.trim())
                        .ok_or(TemplateError::UnknownPlaceholder { stage, name })?;
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Slot(slot));
                }
                '}' => return Err(TemplateError::UnbalancedBrace { stage, position: pos }),
                other => literal.push(other),
            }
        }

        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self { stage, segments })
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Slots referenced by the template, in order of first use
    pub fn placeholders(&self) -> Vec<Placeholder> {
        let mut seen = Vec::new();
        for segment in &self.segments {
            if let Segment::Slot(p) = segment {
                if !seen.contains(p) {
                    seen.push(*p);
                }
            }
        }
        seen
    }

    /// Substitutes every slot; fails on the first slot without a value
    pub fn render(&self, params: &TemplateParams) -> Result<String, TemplateError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Slot(placeholder) => {
                    let value = params.get(*placeholder).ok_or(TemplateError::Unresolved {
                        stage: self.stage,
                        placeholder: *placeholder,
                    })?;
                    out.push_str(value);
                }
            }
        }
        Ok(out)
    }
}

/// Every stage's command template
#[derive(Debug, Clone)]
pub struct TemplateRegistry {
    templates: HashMap<Stage, CommandTemplate>,
}

impl TemplateRegistry {
    /// Builds the registry from `stage key -> template` pairs
    ///
    /// Every stage must be configured and unknown keys are rejected.
    pub fn from_map<K, V>(raw: impl IntoIterator<Item = (K, V)>) -> Result<Self, TemplateError>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut templates = HashMap::new();
        for (key, value) in raw {
            let stage: Stage = key.as_ref().parse()?;
            templates.insert(stage, CommandTemplate::parse(stage, value.as_ref())?);
        }

        if let Some(missing) = Stage::ALL.into_iter().find(|s| !templates.contains_key(s)) {
            return Err(TemplateError::MissingStage(missing));
        }

        Ok(Self { templates })
    }

    pub fn get(&self, stage: Stage) -> Result<&CommandTemplate, TemplateError> {
        self.templates
            .get(&stage)
            .ok_or(TemplateError::MissingStage(stage))
    }

    /// Renders the template of `stage` with `params`
    pub fn render(&self, stage: Stage, params: &TemplateParams) -> Result<String, TemplateError> {
        self.get(stage)?.render(params)
    }
}
