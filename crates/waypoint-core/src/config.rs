use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WaypointError};
use crate::types::WorkflowType;

/// Top-level Waypoint configuration.
///
/// Every section is optional; an empty file yields a working config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub compliance: ComplianceConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on graph steps per run before forcing finalize.
    #[serde(default = "default_max_steps")]
    pub max_steps: u64,
    #[serde(default = "default_workspace")]
    pub workspace: String,
    /// Response returned when a critical violation blocks agent output.
    #[serde(default = "default_fallback_response")]
    pub fallback_response: String,
    /// Response used when a run finalizes without any usable agent output.
    #[serde(default = "default_degraded_response")]
    pub degraded_response: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            workspace: default_workspace(),
            fallback_response: default_fallback_response(),
            degraded_response: default_degraded_response(),
        }
    }
}

fn default_max_steps() -> u64 { 10 }
fn default_workspace() -> String { "~/.waypoint".to_string() }

fn default_fallback_response() -> String {
    "This request needs a closer look before we can answer it. \
     Your session has been saved and flagged for review."
        .to_string()
}

fn default_degraded_response() -> String {
    "We could only partially complete this request. \
     Please retry later using the same session handle."
        .to_string()
}

/// External agent endpoint for one role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEndpointConfig {
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Overrides `gateway.call_timeout_secs` for this role.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    /// Extra attempts after a transient failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Agent endpoints keyed by role name.
    #[serde(default)]
    pub agents: HashMap<String, AgentEndpointConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: default_call_timeout_secs(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            agents: HashMap::new(),
        }
    }
}

impl GatewayConfig {
    /// Call timeout for a role, honoring per-role overrides.
    pub fn timeout_for(&self, role: &str) -> Duration {
        let secs = self
            .agents
            .get(role)
            .and_then(|a| a.timeout_secs)
            .unwrap_or(self.call_timeout_secs);
        Duration::from_secs(secs)
    }
}

fn default_call_timeout_secs() -> u64 { 30 }
fn default_max_retries() -> u32 { 1 }
fn default_initial_backoff_ms() -> u64 { 200 }
fn default_max_backoff_ms() -> u64 { 5000 }

/// Checkpoint persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// SQLite database path. Default: <workspace>/checkpoints.db
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,
    /// Advisory only; nothing in the engine deletes checkpoints.
    #[serde(default)]
    pub retention_hint_days: Option<u32>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            path: None,
            write_timeout_secs: default_write_timeout_secs(),
            retention_hint_days: None,
        }
    }
}

fn default_write_timeout_secs() -> u64 { 5 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceConfig {
    /// Word-count ceiling enforced by the length-limit rule.
    #[serde(default = "default_word_limit")]
    pub word_limit: u32,
    /// Minimum words after a hand-off phrase to count as finished prose.
    #[serde(default = "default_min_prose_words")]
    pub min_prose_words: usize,
    #[serde(default = "default_disclosure_text")]
    pub disclosure_text: String,
    /// Workflows whose outputs must carry the disclosure text.
    #[serde(default = "default_disclosure_required_for")]
    pub disclosure_required_for: Vec<WorkflowType>,
    /// Resource names that outputs must not instruct anyone to modify.
    #[serde(default = "default_protected_resources")]
    pub protected_resources: Vec<String>,
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self {
            word_limit: default_word_limit(),
            min_prose_words: default_min_prose_words(),
            disclosure_text: default_disclosure_text(),
            disclosure_required_for: default_disclosure_required_for(),
            protected_resources: default_protected_resources(),
        }
    }
}

fn default_word_limit() -> u32 { 200 }
fn default_min_prose_words() -> usize { 20 }

fn default_disclosure_text() -> String {
    "This is guidance only".to_string()
}

fn default_disclosure_required_for() -> Vec<WorkflowType> {
    vec![WorkflowType::ComplianceSensitive]
}

fn default_protected_resources() -> Vec<String> {
    vec![
        "production database".to_string(),
        "billing-ledger".to_string(),
        "audit log".to_string(),
        "compliance rules".to_string(),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// How long a request waits for a busy session. 0 = fail immediately.
    #[serde(default)]
    pub lock_wait_ms: u64,
    #[serde(default = "default_conversation_ttl_secs")]
    pub conversation_ttl_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            lock_wait_ms: 0,
            conversation_ttl_secs: default_conversation_ttl_secs(),
        }
    }
}

fn default_conversation_ttl_secs() -> u64 { 3600 }

/// JSONL runtime logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: <workspace>/logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// 1 = run summary only, 2 = per-step, 3 = per agent call (default: 2).
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
            level: 2,
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| WaypointError::ConfigNotFound(path.display().to_string()))?;

        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| WaypointError::Config(e.to_string()))?;
        tracing::debug!(
            path = %path.display(),
            agents = config.gateway.agents.len(),
            "Loaded config"
        );
        Ok(config)
    }

    /// Resolve the workspace directory (expand ~).
    pub fn workspace_dir(&self) -> PathBuf {
        expand_home(&self.engine.workspace)
    }

    /// Checkpoint database path.
    pub fn checkpoint_path(&self) -> PathBuf {
        match &self.checkpoint.path {
            Some(p) => expand_home(p),
            None => self.workspace_dir().join("checkpoints.db"),
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        match &self.log.log_dir {
            Some(p) => expand_home(p),
            None => self.workspace_dir().join("logs"),
        }
    }

    /// Audit log file, one JSON line per violation.
    pub fn audit_path(&self) -> PathBuf {
        self.workspace_dir().join("audit.jsonl")
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Unset variables are left as written
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
