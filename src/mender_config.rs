//! Configuration for mender, read from `.mender/mender.toml`.
//!
//! Settings are layered: file → environment → CLI flags. Every field has a
//! default, so an empty or missing file is a valid configuration.
//!
//! # Configuration File Format
//!
//! ```toml
//! [review]
//! max_iterations = 5
//! profile = "balanced"          # fast | balanced | thorough
//! completion_mode = "standard"  # strict | standard | permissive
//! parallel_validators = true
//! timeout_secs = 600
//!
//! [thresholds]
//! warning = 5
//!
//! [document]
//! required_fields = ["title", "created", "updated"]
//! required_sections = ["# Question", "## Answer"]
//! min_body_chars = 20
//! type_names = ["HashMap", "Vec"]
//!
//! [gate]
//! max_shrink_ratio = 0.3
//! max_splice_sections = 2
//!
//! [batch]
//! max_workers = 4
//! fix_memory_capacity = 128
//!
//! [retry]
//! max_attempts = 3
//! initial_delay_ms = 500
//! multiplier = 2.0
//! max_delay_ms = 10000
//!
//! [agent]
//! command = "claude --print"
//! timeout_secs = 300
//! fixer = true
//! qa = false
//! summarizer = true
//! reviewer = false
//! ```
//!
//! Environment overrides: `MENDER_MAX_ITERATIONS`, `MENDER_PROFILE`,
//! `MENDER_COMPLETION_MODE`, `MENDER_AGENT_CMD`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::batch::BatchConfig;
use crate::collaborators::builtin::DocumentRules;
use crate::collaborators::command::{AgentCollaborator, AgentCommand};
use crate::collaborators::retry::RetryPolicy;
use crate::errors::ConfigError;
use crate::orchestrator::{Collaborators, ReviewProfile, ReviewSettings};
use crate::repair::gate::FixValidationGate;
use crate::review::completion::{CompletionMode, ThresholdOverrides};

pub const CONFIG_DIR: &str = ".mender";
pub const CONFIG_FILE: &str = "mender.toml";

pub const ENV_MAX_ITERATIONS: &str = "MENDER_MAX_ITERATIONS";
pub const ENV_PROFILE: &str = "MENDER_PROFILE";
pub const ENV_COMPLETION_MODE: &str = "MENDER_COMPLETION_MODE";
pub const ENV_AGENT_CMD: &str = "MENDER_AGENT_CMD";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewSection {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default)]
    pub profile: ReviewProfile,
    #[serde(default)]
    pub completion_mode: CompletionMode,
    #[serde(default = "default_true")]
    pub parallel_validators: bool,
    /// Per-document wall-clock limit; no limit when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

fn default_max_iterations() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

impl Default for ReviewSection {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            profile: ReviewProfile::default(),
            completion_mode: CompletionMode::default(),
            parallel_validators: true,
            timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSection {
    #[serde(default = "default_required_fields")]
    pub required_fields: Vec<String>,
    #[serde(default)]
    pub required_sections: Vec<String>,
    #[serde(default = "default_min_body_chars")]
    pub min_body_chars: usize,
    #[serde(default)]
    pub type_names: Vec<String>,
}

fn default_required_fields() -> Vec<String> {
    DocumentRules::default().required_fields
}

fn default_min_body_chars() -> usize {
    DocumentRules::default().min_body_chars
}

impl Default for DocumentSection {
    fn default() -> Self {
        Self {
            required_fields: default_required_fields(),
            required_sections: Vec::new(),
            min_body_chars: default_min_body_chars(),
            type_names: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateSection {
    /// Largest fraction of the text an edit may remove
    #[serde(default = "default_max_shrink_ratio")]
    pub max_shrink_ratio: f64,
    /// Most required sections the gate will restore from the prior text
    #[serde(default = "default_max_splice_sections")]
    pub max_splice_sections: usize,
}

fn default_max_shrink_ratio() -> f64 {
    FixValidationGate::default().max_shrink_ratio
}

fn default_max_splice_sections() -> usize {
    FixValidationGate::default().max_splice_sections
}

impl Default for GateSection {
    fn default() -> Self {
        Self {
            max_shrink_ratio: default_max_shrink_ratio(),
            max_splice_sections: default_max_splice_sections(),
        }
    }
}

/// External agent used for the collaborator roles switched on below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSection {
    /// Program and leading arguments, split on whitespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_agent_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_true")]
    pub fixer: bool,
    #[serde(default)]
    pub qa: bool,
    #[serde(default = "default_true")]
    pub summarizer: bool,
    #[serde(default)]
    pub reviewer: bool,
}

fn default_agent_timeout_secs() -> u64 {
    300
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            timeout_secs: default_agent_timeout_secs(),
            fixer: true,
            qa: false,
            summarizer: true,
            reviewer: false,
        }
    }
}

impl AgentSection {
    fn any_role(&self) -> bool {
        self.fixer || self.qa || self.summarizer || self.reviewer
    }

    /// The configured command, or `None` when no agent is set up.
    pub fn agent_command(&self) -> Option<AgentCommand> {
        let command = self.command.as_deref()?;
        let mut parts = command.split_whitespace();
        let program = parts.next()?;
        let args = parts
            .map(str::to_string)
            .chain(self.args.iter().cloned())
            .collect();
        Some(AgentCommand::new(
            program,
            args,
            Duration::from_secs(self.timeout_secs),
        ))
    }
}

/// The complete mender.toml structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MenderToml {
    #[serde(default)]
    pub review: ReviewSection,
    #[serde(default)]
    pub thresholds: ThresholdOverrides,
    #[serde(default)]
    pub document: DocumentSection,
    #[serde(default)]
    pub gate: GateSection,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub agent: AgentSection,
}

impl MenderToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse mender.toml")
    }

    /// Load `mender.toml` from `mender_dir`, or the defaults when it does not exist.
    pub fn load_or_default(mender_dir: &Path) -> Result<Self> {
        let config_path = mender_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize mender.toml")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply environment overrides read through `lookup`.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(value) = lookup(ENV_MAX_ITERATIONS) {
            self.review.max_iterations = value
                .trim()
                .parse()
                .with_context(|| format!("Invalid {ENV_MAX_ITERATIONS} '{value}'"))?;
        }
        if let Some(value) = lookup(ENV_PROFILE) {
            self.review.profile = value.parse()?;
        }
        if let Some(value) = lookup(ENV_COMPLETION_MODE) {
            self.review.completion_mode = value.parse()?;
        }
        if let Some(value) = lookup(ENV_AGENT_CMD)
            && !value.trim().is_empty()
        {
            self.agent.command = Some(value);
        }
        Ok(())
    }

    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    pub fn apply_cli(&mut self, cli: &CliOverrides) {
        if let Some(profile) = cli.profile {
            self.review.profile = profile;
        }
        if let Some(mode) = cli.completion_mode {
            self.review.completion_mode = mode;
        }
        if let Some(max) = cli.max_iterations {
            self.review.max_iterations = max;
        }
        if let Some(workers) = cli.workers {
            self.batch.max_workers = workers;
        }
        if let Some(ref command) = cli.agent_cmd {
            self.agent.command = Some(command.clone());
        }
        if cli.sequential {
            self.review.parallel_validators = false;
            self.batch.max_workers = 1;
        }
    }

    /// Every problem with the loaded values; empty when the configuration is usable.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut problems = Vec::new();
        let mut at_least = |field: &'static str, min: u64, value: u64| {
            if value < min {
                problems.push(ConfigError::TooSmall { field, min, value });
            }
        };
        at_least("review.max_iterations", 1, self.review.max_iterations as u64);
        at_least("batch.max_workers", 1, self.batch.max_workers as u64);
        at_least("retry.max_attempts", 1, self.retry.max_attempts as u64);
        at_least("agent.timeout_secs", 1, self.agent.timeout_secs);
        if let Some(timeout) = self.review.timeout_secs {
            at_least("review.timeout_secs", 1, timeout);
        }

        if !(0.0..=1.0).contains(&self.gate.max_shrink_ratio) {
            problems.push(ConfigError::OutOfRange {
                field: "gate.max_shrink_ratio",
                min: 0.0,
                max: 1.0,
                value: self.gate.max_shrink_ratio,
            });
        }
        if !(1.0..=10.0).contains(&self.retry.multiplier) {
            problems.push(ConfigError::OutOfRange {
                field: "retry.multiplier",
                min: 1.0,
                max: 10.0,
                value: self.retry.multiplier,
            });
        }
        let blank_command = self
            .agent
            .command
            .as_deref()
            .is_some_and(|c| c.trim().is_empty());
        if blank_command && self.agent.any_role() {
            problems.push(ConfigError::MissingAgentCommand {
                field: "agent roles",
            });
        }
        problems
    }

    pub fn document_rules(&self) -> DocumentRules {
        DocumentRules {
            required_fields: self.document.required_fields.clone(),
            required_sections: self.document.required_sections.clone(),
            min_body_chars: self.document.min_body_chars,
            type_names: self.document.type_names.clone(),
            today: None,
        }
    }

    pub fn review_settings(&self) -> ReviewSettings {
        ReviewSettings {
            max_iterations: self.review.max_iterations,
            profile: self.review.profile,
            completion_mode: self.review.completion_mode,
            threshold_overrides: self.thresholds,
            parallel_validators: self.review.parallel_validators,
            timeout: self.review.timeout_secs.map(Duration::from_secs),
            rules: self.document_rules(),
            gate: FixValidationGate::new()
                .with_max_shrink_ratio(self.gate.max_shrink_ratio)
                .with_max_splice_sections(self.gate.max_splice_sections),
            retry: self.retry,
        }
    }

    /// Built-in collaborators, with the agent swapped in for each enabled role.
    pub fn collaborators(&self) -> Collaborators {
        let mut collaborators = Collaborators::builtin(self.document_rules());
        let Some(command) = self.agent.agent_command() else {
            return collaborators;
        };
        let agent = Arc::new(AgentCollaborator::new(command));
        if self.agent.fixer {
            collaborators = collaborators.with_fixer(agent.clone());
        }
        if self.agent.qa {
            collaborators = collaborators.with_qa(agent.clone());
        }
        if self.agent.summarizer {
            collaborators = collaborators.with_summarizer(agent.clone());
        }
        if self.agent.reviewer {
            collaborators = collaborators.with_initial_reviewer(agent);
        }
        collaborators
    }
}

/// Flags given on the command line; `None` leaves the lower layer alone.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub profile: Option<ReviewProfile>,
    pub completion_mode: Option<CompletionMode>,
    pub max_iterations: Option<u32>,
    pub workers: Option<usize>,
    pub agent_cmd: Option<String>,
    pub sequential: bool,
}

/// Resolved configuration for one project directory.
#[derive(Debug, Clone)]
pub struct MenderConfig {
    pub project_dir: PathBuf,
    pub mender_dir: PathBuf,
    pub toml: MenderToml,
}

impl MenderConfig {
    /// Load the file and apply environment overrides.
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let mender_dir = project_dir.join(CONFIG_DIR);
        let mut toml = MenderToml::load_or_default(&mender_dir)?;
        toml.apply_env()?;

        Ok(Self {
            project_dir,
            mender_dir,
            toml,
        })
    }

    pub fn with_cli_args(project_dir: PathBuf, cli: &CliOverrides) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.toml.apply_cli(cli);
        Ok(config)
    }

    pub fn config_file(&self) -> PathBuf {
        self.mender_dir.join(CONFIG_FILE)
    }

    pub fn validate(&self) -> Vec<ConfigError> {
        self.toml.validate()
    }
}
