use super::workflow_file::WorkflowDefinition;
use super::ConfigError;
use crate::orchestration::steps::RecoveryPolicy;
use crate::orchestration::workflow_engine::ExecutionLimits;
use crate::resilience::{BreakerConfig, ResilienceConfig, RetryPolicy};
use crate::shared::ids::CapabilityId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default = "default_state_root")]
    pub state_root: PathBuf,
    #[serde(default)]
    pub orchestration: OrchestrationSettings,
    #[serde(default)]
    pub resilience: ResilienceSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub capabilities: BTreeMap<String, CapabilityConfig>,
    #[serde(default)]
    pub workflows: Vec<WorkflowDefinition>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            state_root: default_state_root(),
            orchestration: OrchestrationSettings::default(),
            resilience: ResilienceSettings::default(),
            storage: StorageSettings::default(),
            capabilities: BTreeMap::new(),
            workflows: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct OrchestrationSettings {
    #[serde(default = "default_max_iterations")]
    pub max_iterations_per_invocation: u32,
    #[serde(default = "default_max_step_retries")]
    pub max_step_retries: u32,
    #[serde(default = "default_true")]
    pub escalate_validation_errors: bool,
    #[serde(default = "default_conflict_retries")]
    pub conflict_retries: u32,
}

impl Default for OrchestrationSettings {
    fn default() -> Self {
        Self {
            max_iterations_per_invocation: default_max_iterations(),
            max_step_retries: default_max_step_retries(),
            escalate_validation_errors: true,
            conflict_retries: default_conflict_retries(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ResilienceSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

impl Default for ResilienceSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StorageSettings {
    #[serde(default)]
    pub backend: StorageBackend,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CapabilityConfig {
    pub endpoint: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_state_root() -> PathBuf {
    PathBuf::from(".complyflow")
}

fn default_true() -> bool {
    true
}

fn default_max_iterations() -> u32 {
    50
}

fn default_max_step_retries() -> u32 {
    2
}

fn default_conflict_retries() -> u32 {
    3
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_ms() -> u64 {
    60_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    5_000
}

fn default_call_timeout_ms() -> u64 {
    30_000
}

impl Settings {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.state_root.as_os_str().is_empty() {
            return Err(ConfigError::Settings(
                "`state_root` must be non-empty".to_string(),
            ));
        }

        let orchestration = &self.orchestration;
        if orchestration.max_iterations_per_invocation == 0 {
            return Err(ConfigError::Settings(
                "orchestration.max_iterations_per_invocation must be > 0".to_string(),
            ));
        }

        let resilience = &self.resilience;
        if resilience.failure_threshold == 0 {
            return Err(ConfigError::Settings(
                "resilience.failure_threshold must be > 0".to_string(),
            ));
        }
        if resilience.max_attempts == 0 {
            return Err(ConfigError::Settings(
                "resilience.max_attempts must be > 0".to_string(),
            ));
        }
        if resilience.call_timeout_ms == 0 {
            return Err(ConfigError::Settings(
                "resilience.call_timeout_ms must be > 0".to_string(),
            ));
        }
        if resilience.base_delay_ms > resilience.max_delay_ms {
            return Err(ConfigError::Settings(
                "resilience.base_delay_ms must not exceed resilience.max_delay_ms".to_string(),
            ));
        }

        for (capability, config) in &self.capabilities {
            CapabilityId::parse(capability).map_err(ConfigError::Settings)?;
            let endpoint = config.endpoint.trim();
            if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                return Err(ConfigError::Settings(format!(
                    "capability `{capability}` endpoint must be an http(s) url"
                )));
            }
            if config.timeout_ms == Some(0) {
                return Err(ConfigError::Settings(format!(
                    "capability `{capability}` timeout_ms must be > 0"
                )));
            }
        }

        let mut workflow_ids = BTreeSet::new();
        for workflow in &self.workflows {
            if !workflow_ids.insert(workflow.id.as_str()) {
                return Err(ConfigError::workflow(
                    &workflow.id,
                    "workflow id is declared more than once",
                ));
            }
            workflow.validate()?;
        }

        Ok(())
    }

    pub fn resilience_config(&self) -> Result<ResilienceConfig, ConfigError> {
        let resilience = &self.resilience;
        let mut call_timeouts = BTreeMap::new();
        for (capability, config) in &self.capabilities {
            if let Some(timeout_ms) = config.timeout_ms {
                let capability = CapabilityId::parse(capability).map_err(ConfigError::Settings)?;
                call_timeouts.insert(capability, Duration::from_millis(timeout_ms));
            }
        }
        Ok(ResilienceConfig {
            breaker: BreakerConfig {
                failure_threshold: resilience.failure_threshold,
                recovery_timeout_ms: i64::try_from(resilience.recovery_timeout_ms)
                    .unwrap_or(i64::MAX),
            },
            retry: RetryPolicy {
                max_attempts: resilience.max_attempts,
                base_delay: Duration::from_millis(resilience.base_delay_ms),
                max_delay: Duration::from_millis(resilience.max_delay_ms),
            },
            call_timeout: Duration::from_millis(resilience.call_timeout_ms),
            call_timeouts,
        })
    }

    pub fn execution_limits(&self) -> ExecutionLimits {
        ExecutionLimits {
            max_iterations_per_invocation: self.orchestration.max_iterations_per_invocation,
        }
    }

    pub fn recovery_policy(&self) -> RecoveryPolicy {
        RecoveryPolicy {
            max_retries: self.orchestration.max_step_retries,
            escalate_validation_errors: self.orchestration.escalate_validation_errors,
        }
    }

    /// Relative state roots resolve against the settings file's directory.
    pub fn resolve_state_root(&self, settings_path: &Path) -> PathBuf {
        if self.state_root.is_absolute() {
            return self.state_root.clone();
        }
        settings_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(&self.state_root)
    }
}
