//! Configuration: `conductor.yaml`.
//!
//! ```yaml
//! engine:
//!   max_total_steps: 12
//!   coordinator_name: MainAgent
//!   clarification_phrases: ["clarify", "confirm", "ask the user"]
//!   replan_attempts: 2
//!   fallback_step_limit: 3
//! dispatch:
//!   timeout_secs: 120
//!   retry: { max_retries: 2, initial_delay_ms: 500, max_delay_ms: 8000, backoff_multiplier: 2.0 }
//! capabilities:
//!   comm.slack.post: MainAgent
//! workers:
//!   - name: Worker_Web
//!     tools: [web.search]
//!     transport: { type: remote, endpoint: "${WEB_WORKER_URL:-http://localhost:8102/step}" }
//! workers_dir: workers
//! audit: { log_dir: log }
//! database: { path: .conductor/conductor.db }
//! planner: { endpoint: "http://localhost:8100/replan", timeout_secs: 60 }
//! ```
//!
//! `${VAR}` and `${VAR:-default}` are expanded before parsing.

use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::workflow::dispatcher::{DispatchConfig, RetryPolicy};
use crate::workflow::needs::PhraseClassifier;
use crate::workflow::worker::{WorkerCatalog, WorkerDescriptor};

static ENV_VAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("valid env var regex"));

/// Default config file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "conductor.yaml";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ConductorConfig {
    pub engine: EngineConfig,
    pub dispatch: DispatchSettings,
    /// Initial capability → owner table
    pub capabilities: BTreeMap<String, String>,
    pub workers: Vec<WorkerDescriptor>,
    /// Directory of per-worker YAML files
    pub workers_dir: Option<String>,
    pub audit: AuditConfig,
    pub database: DatabaseConfig,
    pub planner: Option<PlannerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Step budget; `None` means `max(8, plan steps + 6)`
    pub max_total_steps: Option<usize>,
    pub coordinator_name: String,
    pub clarification_phrases: Vec<String>,
    pub replan_attempts: u32,
    pub fallback_step_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_total_steps: None,
            coordinator_name: "MainAgent".to_string(),
            clarification_phrases: PhraseClassifier::default_phrases(),
            replan_attempts: 2,
            fallback_step_limit: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    pub timeout_secs: u64,
    pub retry: RetryPolicy,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub log_dir: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            log_dir: "log".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: ".conductor/conductor.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    pub endpoint: String,
    #[serde(default = "default_planner_timeout")]
    pub timeout_secs: u64,
}

fn default_planner_timeout() -> u64 {
    60
}

impl ConductorConfig {
    /// Parse from YAML after environment expansion.
    pub fn from_yaml(yaml: &str) -> Result<Self, CoreError> {
        serde_yaml::from_str(&resolve_env_vars(yaml))
            .map_err(|e| CoreError::Config(format!("Failed to parse config YAML: {}", e)))
    }

    pub fn from_file(path: &str) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("Failed to read config file '{}': {}", path, e)))?;
        Self::from_yaml(&content)
    }

    /// Inline workers plus those loaded from `workers_dir`.
    pub fn build_catalog(&self) -> Result<WorkerCatalog, CoreError> {
        let mut catalog = WorkerCatalog::from_descriptors(self.workers.iter().cloned());
        if let Some(dir) = &self.workers_dir {
            let loaded = catalog.load_dir(dir).map_err(CoreError::Config)?;
            tracing::info!("[Config] Loaded {} worker file(s) from {}", loaded, dir);
        }
        Ok(catalog)
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            timeout: Duration::from_secs(self.dispatch.timeout_secs),
            retry: self.dispatch.retry.clone(),
        }
    }

    /// Check values that would make the engine misbehave.
    pub fn validate(&self, catalog: &WorkerCatalog) -> Result<(), CoreError> {
        let mut problems = Vec::new();

        if self.engine.coordinator_name.trim().is_empty() {
            problems.push("engine.coordinator_name is empty".to_string());
        }
        if self.engine.max_total_steps == Some(0) {
            problems.push("engine.max_total_steps must be at least 1".to_string());
        }
        if self.engine.replan_attempts == 0 {
            problems.push("engine.replan_attempts must be at least 1".to_string());
        }
        if self.dispatch.timeout_secs == 0 {
            problems.push("dispatch.timeout_secs must be at least 1".to_string());
        }
        if self.dispatch.retry.backoff_multiplier < 1.0 {
            problems.push("dispatch.retry.backoff_multiplier must be >= 1.0".to_string());
        }
        for (capability, owner) in &self.capabilities {
            let is_coordinator = owner.eq_ignore_ascii_case(&self.engine.coordinator_name);
            if !catalog.contains(owner) && !is_coordinator {
                problems.push(format!(
                    "capability '{}' is owned by unknown worker '{}'",
                    capability, owner
                ));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(CoreError::Config(problems.join("; ")))
        }
    }
}

/// Resolve environment variable references in a string.
/// Supports `${ENV_VAR}` and `${ENV_VAR:-default}` syntax.
pub fn resolve_env_vars(input: &str) -> String {
    ENV_VAR
        .replace_all(input, |caps: &regex::Captures| {
            let var_expr = &caps[1];
            if let Some(idx) = var_expr.find(":-") {
                let var_name = &var_expr[..idx];
                let default_val = &var_expr[idx + 2..];
                std::env::var(var_name).unwrap_or_else(|_| default_val.to_string())
            } else {
                std::env::var(var_expr).unwrap_or_else(|_| format!("${{{}}}", var_expr))
            }
        })
        .to_string()
}
