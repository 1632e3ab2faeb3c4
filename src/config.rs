//! Configuration for conductor.
//!
//! Settings are read from `.conductor/conductor.toml` in the project
//! directory. Missing keys take their defaults, environment variables
//! override the file, and CLI flags override both.
//!
//! # Configuration File Format
//!
//! ```toml
//! max_concurrency = 16
//! max_revision_rounds = 3
//! default_timeout_secs = 600
//! cancel_grace_secs = 5
//! snapshot_every = 8
//! log_level = "info"
//!
//! [per_role_timeout_secs]
//! planner = 900
//!
//! [retry]
//! max_attempts = 3
//! [retry.backoff]
//! kind = "exponential"
//! base_ms = 500
//! multiplier = 2.0
//! max_ms = 30000
//!
//! [checkpoint_retry]
//! max_attempts = 5
//!
//! [gate_thresholds]
//! planning = 70
//!
//! [gates.planning]
//! blocking_categories = ["security"]
//! required_artifacts = { planner = ["plan"] }
//!
//! [validation]
//! allowed_roles = ["planner", "coder", "reviewer", "tester"]
//! require_success_criteria = false
//!
//! [workers.planner]
//! command = ["python3", "agents/planner.py"]
//!
//! # Handles every role without its own entry
//! [workers.default]
//! command = ["./agents/run.sh"]
//! ```

use crate::dispatch::{DispatchConfig, ProcessWorker, WorkerRegistry};
use crate::gates::{GateEvaluator, GatePolicy};
use crate::model::{PhaseKind, Role, SpecRules};
use crate::retry::{Backoff, RetryPolicy};
use crate::scheduler::{DEFAULT_MAX_CONCURRENCY, MAX_CONCURRENCY_CEILING};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Directory holding configuration and run checkpoints.
pub const CONDUCTOR_DIR: &str = ".conductor";

/// Config file name inside [`CONDUCTOR_DIR`].
pub const CONFIG_FILE: &str = "conductor.toml";

/// Worker entry that serves roles without their own entry.
pub const DEFAULT_WORKER: &str = "default";

/// Gate rules for one phase kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GateSection {
    #[serde(default)]
    pub blocking_categories: Vec<String>,
    #[serde(default)]
    pub required_artifacts: BTreeMap<Role, Vec<String>>,
    /// Overrides the top-level `max_revision_rounds`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_revision_rounds: Option<u32>,
}

/// External command serving one role.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerSection {
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
}

/// Parsed `conductor.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConductorToml {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_max_revision_rounds")]
    pub max_revision_rounds: u32,
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,
    /// Events between full snapshots
    #[serde(default = "default_snapshot_every")]
    pub snapshot_every: u32,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub per_role_timeout_secs: BTreeMap<Role, u64>,
    /// Worker dispatch retries
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Checkpoint write retries
    #[serde(default = "default_checkpoint_retry")]
    pub checkpoint_retry: RetryPolicy,
    /// Minimum score per phase kind
    #[serde(default)]
    pub gate_thresholds: BTreeMap<String, u32>,
    #[serde(default)]
    pub gates: BTreeMap<String, GateSection>,
    #[serde(default)]
    pub validation: SpecRules,
    #[serde(default)]
    pub workers: BTreeMap<Role, WorkerSection>,
}

fn default_max_concurrency() -> usize {
    DEFAULT_MAX_CONCURRENCY
}

fn default_max_revision_rounds() -> u32 {
    crate::gates::DEFAULT_MAX_REVISION_ROUNDS
}

fn default_timeout_secs() -> u64 {
    600
}

fn default_cancel_grace_secs() -> u64 {
    5
}

fn default_snapshot_every() -> u32 {
    8
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_checkpoint_retry() -> RetryPolicy {
    RetryPolicy::new(
        5,
        Backoff::Exponential {
            base_ms: 200,
            multiplier: 2.0,
            max_ms: 5_000,
        },
    )
}

impl Default for ConductorToml {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            max_revision_rounds: default_max_revision_rounds(),
            default_timeout_secs: default_timeout_secs(),
            cancel_grace_secs: default_cancel_grace_secs(),
            snapshot_every: default_snapshot_every(),
            log_level: default_log_level(),
            per_role_timeout_secs: BTreeMap::new(),
            retry: RetryPolicy::default(),
            checkpoint_retry: default_checkpoint_retry(),
            gate_thresholds: BTreeMap::new(),
            gates: BTreeMap::new(),
            validation: SpecRules::default(),
            workers: BTreeMap::new(),
        }
    }
}

impl ConductorToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse conductor.toml")
    }

    /// Load `conductor.toml` from `conductor_dir`, or defaults if absent.
    pub fn load_or_default(conductor_dir: &Path) -> Result<Self> {
        let config_path = conductor_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize conductor.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.max_concurrency == 0 || self.max_concurrency > MAX_CONCURRENCY_CEILING {
            warnings.push(format!(
                "max_concurrency {} outside 1..={}, it will be clamped",
                self.max_concurrency, MAX_CONCURRENCY_CEILING
            ));
        }
        if self.retry.max_attempts == 0 {
            warnings.push("retry.max_attempts is 0, tasks are still tried once".to_string());
        }
        if self.default_timeout_secs == 0 {
            warnings.push("default_timeout_secs is 0, every dispatch will time out".to_string());
        }

        for (kind, threshold) in &self.gate_thresholds {
            if kind.parse::<PhaseKind>().is_err() {
                warnings.push(format!("Unknown phase kind '{}' in [gate_thresholds]", kind));
            }
            if *threshold > 100 {
                warnings.push(format!(
                    "Threshold {} for '{}' is above 100 and can never be met",
                    threshold, kind
                ));
            }
        }
        for kind in self.gates.keys() {
            if kind.parse::<PhaseKind>().is_err() {
                warnings.push(format!("Unknown phase kind '{}' in [gates]", kind));
            }
        }

        for (role, worker) in &self.workers {
            if worker.command.is_empty() {
                warnings.push(format!("Worker '{}' has an empty command", role));
            }
            if !self.validation.allowed_roles.is_empty()
                && role.as_str() != DEFAULT_WORKER
                && !self.validation.allowed_roles.contains(role)
            {
                warnings.push(format!(
                    "Worker '{}' is configured but the role is not in validation.allowed_roles",
                    role
                ));
            }
        }

        warnings
    }

    fn gate_policy(&self, kind: PhaseKind) -> GatePolicy {
        let section = self.gates.get(kind.as_str()).cloned().unwrap_or_default();
        GatePolicy {
            min_score: self.gate_thresholds.get(kind.as_str()).copied(),
            blocking_categories: section.blocking_categories,
            required_artifacts: section.required_artifacts,
            max_revision_rounds: section
                .max_revision_rounds
                .unwrap_or(self.max_revision_rounds),
        }
    }
}

/// Runtime configuration: the parsed file plus environment and CLI overrides.
#[derive(Debug, Clone)]
pub struct ConductorConfig {
    pub project_dir: PathBuf,
    pub conductor_dir: PathBuf,
    pub toml: ConductorToml,
    /// CLI override for max_concurrency
    pub cli_max_concurrency: Option<usize>,
}

impl ConductorConfig {
    /// Load configuration for a project directory.
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let conductor_dir = project_dir.join(CONDUCTOR_DIR);
        let toml = ConductorToml::load_or_default(&conductor_dir)?;

        Ok(Self {
            project_dir,
            conductor_dir,
            toml,
            cli_max_concurrency: None,
        })
    }

    pub fn with_max_concurrency(mut self, max_concurrency: Option<usize>) -> Self {
        self.cli_max_concurrency = max_concurrency;
        self
    }

    pub fn config_file(&self) -> PathBuf {
        self.conductor_dir.join(CONFIG_FILE)
    }

    /// Directory of the file checkpoint store.
    pub fn runs_dir(&self) -> PathBuf {
        self.conductor_dir.join("runs")
    }

    /// CLI, then `CONDUCTOR_MAX_CONCURRENCY`, then the file.
    pub fn max_concurrency(&self) -> usize {
        self.cli_max_concurrency
            .or_else(|| {
                std::env::var("CONDUCTOR_MAX_CONCURRENCY")
                    .ok()
                    .and_then(|v| v.parse().ok())
            })
            .unwrap_or(self.toml.max_concurrency)
            .clamp(1, MAX_CONCURRENCY_CEILING)
    }

    /// `CONDUCTOR_LOG`, then the file.
    pub fn log_level(&self) -> String {
        std::env::var("CONDUCTOR_LOG").unwrap_or_else(|_| self.toml.log_level.clone())
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            retry: self.toml.retry.clone(),
            default_timeout: Duration::from_secs(self.toml.default_timeout_secs),
            per_role_timeout: self
                .toml
                .per_role_timeout_secs
                .iter()
                .map(|(role, secs)| (role.clone(), Duration::from_secs(*secs)))
                .collect(),
            cancel_grace: Duration::from_secs(self.toml.cancel_grace_secs),
        }
    }

    pub fn gate_evaluator(&self) -> GateEvaluator {
        let default = GatePolicy::default().with_max_revision_rounds(self.toml.max_revision_rounds);
        [PhaseKind::Planning, PhaseKind::Implementation, PhaseKind::Qa]
            .into_iter()
            .fold(GateEvaluator::new(default), |gates, kind| {
                gates.with_policy(kind, self.toml.gate_policy(kind))
            })
    }

    pub fn spec_rules(&self) -> &SpecRules {
        &self.toml.validation
    }

    /// Process workers for every configured role. Relative working
    /// directories resolve against the project directory.
    pub fn worker_registry(&self) -> Result<WorkerRegistry> {
        let mut registry = WorkerRegistry::new();
        for (role, section) in &self.toml.workers {
            let working_dir = section
                .working_dir
                .as_ref()
                .map(|dir| self.project_dir.join(dir))
                .unwrap_or_else(|| self.project_dir.clone());
            let worker = ProcessWorker::new(&section.command)
                .with_context(|| format!("Invalid worker command for role '{}'", role))?
                .with_working_dir(working_dir);
            if role.as_str() == DEFAULT_WORKER {
                registry = registry.with_fallback(Arc::new(worker));
            } else {
                registry.register(role.clone(), Arc::new(worker));
            }
        }
        Ok(registry)
    }

    /// Validate configuration and return warnings.
    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}
