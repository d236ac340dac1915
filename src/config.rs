//! Configuration management for Foreman.
//!
//! Configuration lives in `.foreman/config.json` inside the project. When the
//! project has none, the user-level file (`~/.config/foreman/config.json` on
//! Linux) is used instead, and when neither exists every field takes its
//! default. Keys are camelCase and every field is optional.
//!
//! # Example
//!
//! ```rust,ignore
//! use foreman::config::ForemanConfig;
//!
//! let loaded = ForemanConfig::load(Path::new("."))?;
//! loaded.config.validate()?;
//! let settings = loaded.config.controller_settings();
//! ```

use crate::approval::{AutoApprovalRules, DEFAULT_APPROVAL_EXPIRY_MINUTES};
use crate::classifier::{ActionClassifier, RuleConfig};
use crate::controller::{
    ControllerSettings, DEFAULT_EXECUTION_TIMEOUT_SECS, DEFAULT_TICK_INTERVAL_SECS,
};
use crate::error::{ForemanError, Result};
use crate::retry::RetryPolicy;
use crate::usage::UsageLimitConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Project-local state directory.
pub const FOREMAN_DIR: &str = ".foreman";

/// Config file name, both project and user level.
pub const CONFIG_FILE: &str = "config.json";

/// Default interval of the approval timeout sweep.
pub const DEFAULT_APPROVAL_SWEEP_INTERVAL_SECS: u64 = 60;

// ============================================================================
// Sections
// ============================================================================

/// How the agent CLI is invoked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
    pub command: String,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    /// Pass `--dangerously-skip-permissions` to the agent.
    pub skip_permissions: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            model: None,
            system_prompt: None,
            skip_permissions: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AlertsConfig {
    /// Shell command run once per alert. Unset disables alerting.
    pub command: Option<String>,
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ForemanConfig {
    pub tick_interval_secs: u64,
    pub approval_sweep_interval_secs: u64,
    pub approval_expiry_minutes: i64,
    pub execution_timeout_secs: u64,
    pub usage_limits: UsageLimitConfig,
    pub auto_approval: AutoApprovalRules,
    pub retry: RetryPolicy,
    pub agent: AgentConfig,
    pub alerts: AlertsConfig,
    /// Extra classifier rules, checked before the built-in ones.
    pub classifier_rules: Vec<RuleConfig>,
    /// Task file, relative to the project directory.
    pub tasks_file: PathBuf,
}

impl Default for ForemanConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: DEFAULT_TICK_INTERVAL_SECS,
            approval_sweep_interval_secs: DEFAULT_APPROVAL_SWEEP_INTERVAL_SECS,
            approval_expiry_minutes: DEFAULT_APPROVAL_EXPIRY_MINUTES,
            execution_timeout_secs: DEFAULT_EXECUTION_TIMEOUT_SECS,
            usage_limits: UsageLimitConfig::default(),
            auto_approval: AutoApprovalRules::default(),
            retry: RetryPolicy::default(),
            agent: AgentConfig::default(),
            alerts: AlertsConfig::default(),
            classifier_rules: Vec::new(),
            tasks_file: Path::new(FOREMAN_DIR).join("tasks.json"),
        }
    }
}

// ============================================================================
// Locations
// ============================================================================

/// Where a loaded configuration came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Project(PathBuf),
    User(PathBuf),
    Defaults,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::Project(path) => write!(f, "project ({})", path.display()),
            ConfigSource::User(path) => write!(f, "user ({})", path.display()),
            ConfigSource::Defaults => write!(f, "built-in defaults"),
        }
    }
}

/// Config file search paths for one project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigLocations {
    pub project: PathBuf,
    pub user: Option<PathBuf>,
}

impl ConfigLocations {
    #[must_use]
    pub fn for_project(project_dir: &Path) -> Self {
        Self {
            project: project_dir.join(FOREMAN_DIR).join(CONFIG_FILE),
            user: Self::default_user_path(),
        }
    }

    /// `<config dir>/foreman/config.json`, if the platform has a config dir.
    #[must_use]
    pub fn default_user_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("foreman").join(CONFIG_FILE))
    }

    #[must_use]
    pub fn with_user_path(mut self, path: Option<PathBuf>) -> Self {
        self.user = path;
        self
    }
}

/// A configuration together with its origin.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: ForemanConfig,
    pub source: ConfigSource,
}

// ============================================================================
// Loading and Validation
// ============================================================================

impl ForemanConfig {
    /// Load the project config, falling back to the user config, then to
    /// defaults.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error if a file exists but cannot be read or parsed.
    pub fn load(project_dir: &Path) -> Result<LoadedConfig> {
        Self::load_from(&ConfigLocations::for_project(project_dir))
    }

    /// Load from explicit locations.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error if a file exists but cannot be read or parsed.
    pub fn load_from(locations: &ConfigLocations) -> Result<LoadedConfig> {
        if locations.project.exists() {
            let config = Self::read_file(&locations.project)?;
            return Ok(LoadedConfig {
                config,
                source: ConfigSource::Project(locations.project.clone()),
            });
        }

        if let Some(user) = locations.user.as_ref().filter(|p| p.exists()) {
            let config = Self::read_file(user)?;
            return Ok(LoadedConfig {
                config,
                source: ConfigSource::User(user.clone()),
            });
        }

        debug!("No config file found, using defaults");
        Ok(LoadedConfig {
            config: Self::default(),
            source: ConfigSource::Defaults,
        })
    }

    /// Parse one config file.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error carrying the path on read or parse failure.
    pub fn read_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ForemanError::config_with_path(format!("failed to read: {e}"), path.to_path_buf())
        })?;
        serde_json::from_str(&content).map_err(|e| {
            ForemanError::config_with_path(format!("failed to parse: {e}"), path.to_path_buf())
        })
    }

    /// Every problem with the configuration.
    #[must_use]
    pub fn problems(&self) -> Vec<ForemanError> {
        let mut problems = Vec::new();
        let limits = &self.usage_limits;

        for (field, value) in [
            ("usageLimits.warningThreshold", limits.warning_threshold),
            ("usageLimits.pauseThreshold", limits.pause_threshold),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                problems.push(ForemanError::invalid_config(
                    field,
                    format!("must be in (0, 1], got {value}"),
                ));
            }
        }
        if limits.warning_threshold >= limits.pause_threshold {
            problems.push(ForemanError::invalid_config(
                "usageLimits.warningThreshold",
                "must be below pauseThreshold",
            ));
        }
        if limits.max_tokens_per_hour == 0 {
            problems.push(ForemanError::invalid_config(
                "usageLimits.maxTokensPerHour",
                "must be greater than zero",
            ));
        }
        if limits.max_tokens_per_day == 0 {
            problems.push(ForemanError::invalid_config(
                "usageLimits.maxTokensPerDay",
                "must be greater than zero",
            ));
        }

        for (field, value) in [
            ("tickIntervalSecs", self.tick_interval_secs),
            ("approvalSweepIntervalSecs", self.approval_sweep_interval_secs),
            ("executionTimeoutSecs", self.execution_timeout_secs),
            ("retry.baseDelayMs", self.retry.base_delay_ms),
        ] {
            if value == 0 {
                problems.push(ForemanError::invalid_config(field, "must be greater than zero"));
            }
        }
        if self.approval_expiry_minutes <= 0 {
            problems.push(ForemanError::invalid_config(
                "approvalExpiryMinutes",
                "must be greater than zero",
            ));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            problems.push(ForemanError::invalid_config(
                "retry.maxDelayMs",
                "must not be below baseDelayMs",
            ));
        }
        if self.agent.command.trim().is_empty() {
            problems.push(ForemanError::invalid_config("agent.command", "must not be empty"));
        }
        for (i, rule) in self.classifier_rules.iter().enumerate() {
            if rule.patterns.is_empty() {
                problems.push(ForemanError::invalid_config(
                    format!("classifierRules[{i}].patterns"),
                    "must not be empty",
                ));
            } else if let Err(e) = rule.compile() {
                problems.push(ForemanError::invalid_config(
                    format!("classifierRules[{i}].patterns"),
                    e.to_string(),
                ));
            }
        }

        problems
    }

    /// # Errors
    ///
    /// Returns the first `InvalidConfig` problem found.
    pub fn validate(&self) -> Result<()> {
        match self.problems().into_iter().next() {
            Some(problem) => Err(problem),
            None => Ok(()),
        }
    }

    /// Controller tunables derived from this configuration.
    #[must_use]
    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            tick_interval: Duration::from_secs(self.tick_interval_secs),
            execution_timeout: Duration::from_secs(self.execution_timeout_secs),
            approval_expiry_minutes: self.approval_expiry_minutes,
            usage_limits: self.usage_limits,
            auto_approval: self.auto_approval.clone(),
            retry: self.retry,
            system_prompt: self.agent.system_prompt.clone(),
        }
    }

    /// The response classifier, including configured rules.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if a configured pattern does not compile.
    pub fn classifier(&self) -> Result<ActionClassifier> {
        ActionClassifier::standard_with(&self.classifier_rules)
            .map_err(|e| ForemanError::invalid_config("classifierRules", e.to_string()))
    }

    #[must_use]
    pub fn approval_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.approval_sweep_interval_secs)
    }

    /// Absolute path of the task file.
    #[must_use]
    pub fn tasks_path(&self, project_dir: &Path) -> PathBuf {
        project_dir.join(&self.tasks_file)
    }

    #[must_use]
    pub fn foreman_dir(project_dir: &Path) -> PathBuf {
        project_dir.join(FOREMAN_DIR)
    }

    #[must_use]
    pub fn sessions_dir(project_dir: &Path) -> PathBuf {
        Self::foreman_dir(project_dir).join("sessions")
    }
}
