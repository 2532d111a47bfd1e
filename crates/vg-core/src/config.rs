use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::AutonomyLevel;

/// Top-level configuration, loaded from `/etc/vigil/config.toml` with a
/// fallback to `~/.vigil/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub triggers: TriggerConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub review: ReviewConfig,
    #[serde(default)]
    pub meta: MetaConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

impl Config {
    /// Load config from the default locations, falling back to defaults
    /// when no file exists.
    pub fn load() -> Result<Self, ConfigError> {
        for path in Self::candidate_paths() {
            if path.exists() {
                return Self::load_from(path);
            }
        }
        Ok(Config::default())
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Reject configurations the daemon cannot safely start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.triggers.interval_s == 0 {
            return Err(ConfigError::Invalid("triggers.interval_s must be > 0".into()));
        }
        if self.review.interval_s == 0 {
            return Err(ConfigError::Invalid("review.interval_s must be > 0".into()));
        }
        if self.context.budget_tokens == 0 {
            return Err(ConfigError::Invalid(
                "context.budget_tokens must be > 0".into(),
            ));
        }
        for (name, model) in [
            ("triggers.model", &self.triggers.model),
            ("review.model", &self.review.model),
            ("meta.model", &self.meta.model),
        ] {
            if model.is_empty() {
                return Err(ConfigError::Invalid(format!("{name} must not be empty")));
            }
        }
        if self.review.context_tokens > self.context.budget_tokens {
            return Err(ConfigError::Invalid(
                "review.context_tokens exceeds context.budget_tokens".into(),
            ));
        }
        Ok(())
    }

    /// Hostname this daemon reports for itself.
    pub fn hostname(&self) -> String {
        if let Some(host) = &self.general.host {
            return host.clone();
        }
        std::fs::read_to_string("/proc/sys/kernel/hostname")
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| "localhost".to_string())
    }

    pub fn state_dir(&self) -> PathBuf {
        PathBuf::from(&self.general.state_dir)
    }

    fn candidate_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("/etc/vigil/config.toml")];
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".vigil").join("config.toml"));
        }
        paths
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Override the detected hostname.
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            host: None,
            state_dir: default_state_dir(),
            log_level: default_log_level(),
        }
    }
}

fn default_state_dir() -> String {
    "/var/lib/vigil".into()
}
fn default_log_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    #[serde(default = "default_trigger_interval")]
    pub interval_s: u64,
    #[serde(default = "default_debounce_window")]
    pub debounce_window_s: u64,
    /// Enable the small-model log classifier.
    #[serde(default = "default_true")]
    pub use_trigger_model: bool,
    #[serde(default = "default_trigger_model")]
    pub model: String,
    #[serde(default = "default_trigger_backend")]
    pub backend_url: String,
    #[serde(default = "default_trigger_timeout")]
    pub timeout_s: u64,
    /// Max warning-or-above log lines submitted to the classifier per tick.
    #[serde(default = "default_classifier_batch")]
    pub classifier_batch: usize,
    /// Journal lines at priority err or above that count as a rate breach.
    #[serde(default = "default_error_rate")]
    pub error_rate_per_tick: usize,
    #[serde(default = "default_cpu_threshold")]
    pub cpu_pct: f64,
    #[serde(default = "default_mem_threshold")]
    pub memory_pct: f64,
    #[serde(default = "default_disk_threshold")]
    pub disk_pct: f64,
    /// 1-minute load threshold, as a multiple of core count.
    #[serde(default = "default_load_per_core")]
    pub load_per_core: f64,
    #[serde(default = "default_critical_services")]
    pub critical_services: Vec<String>,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            interval_s: default_trigger_interval(),
            debounce_window_s: default_debounce_window(),
            use_trigger_model: true,
            model: default_trigger_model(),
            backend_url: default_trigger_backend(),
            timeout_s: default_trigger_timeout(),
            classifier_batch: default_classifier_batch(),
            error_rate_per_tick: default_error_rate(),
            cpu_pct: default_cpu_threshold(),
            memory_pct: default_mem_threshold(),
            disk_pct: default_disk_threshold(),
            load_per_core: default_load_per_core(),
            critical_services: default_critical_services(),
        }
    }
}

fn default_trigger_interval() -> u64 {
    30
}
fn default_debounce_window() -> u64 {
    300
}
fn default_true() -> bool {
    true
}
fn default_trigger_model() -> String {
    "qwen3:1.7b".into()
}
fn default_trigger_backend() -> String {
    "http://127.0.0.1:40080".into()
}
fn default_trigger_timeout() -> u64 {
    5
}
fn default_classifier_batch() -> usize {
    8
}
fn default_error_rate() -> usize {
    10
}
fn default_cpu_threshold() -> f64 {
    90.0
}
fn default_mem_threshold() -> f64 {
    90.0
}
fn default_disk_threshold() -> f64 {
    85.0
}
fn default_load_per_core() -> f64 {
    2.0
}
fn default_critical_services() -> Vec<String> {
    [
        "sshd",
        "systemd-networkd",
        "NetworkManager",
        "systemd-resolved",
        "dbus",
        "systemd-journald",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Hard cap on the context window's total tokens.
    #[serde(default = "default_context_budget")]
    pub budget_tokens: usize,
    /// Entries older than this are candidates for LLM summarization.
    #[serde(default = "default_soft_age")]
    pub soft_age_s: u64,
    /// Target length for LLM-produced summaries.
    #[serde(default = "default_summary_tokens")]
    pub summary_target_tokens: usize,
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval_minutes: u64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            budget_tokens: default_context_budget(),
            soft_age_s: default_soft_age(),
            summary_target_tokens: default_summary_tokens(),
            snapshot_interval_minutes: default_snapshot_interval(),
        }
    }
}

fn default_context_budget() -> usize {
    131_072
}
fn default_soft_age() -> u64 {
    3600
}
fn default_summary_tokens() -> usize {
    96
}
fn default_snapshot_interval() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewConfig {
    #[serde(default = "default_review_interval")]
    pub interval_s: u64,
    #[serde(default = "default_review_model")]
    pub model: String,
    #[serde(default = "default_review_backend")]
    pub backend_url: String,
    #[serde(default = "default_review_timeout")]
    pub timeout_s: u64,
    /// Prompt budget for the medium tier.
    #[serde(default = "default_review_context")]
    pub context_tokens: usize,
    #[serde(default = "default_escalation_cooldown")]
    pub escalation_cooldown_s: u64,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            interval_s: default_review_interval(),
            model: default_review_model(),
            backend_url: default_review_backend(),
            timeout_s: default_review_timeout(),
            context_tokens: default_review_context(),
            escalation_cooldown_s: default_escalation_cooldown(),
        }
    }
}

fn default_review_interval() -> u64 {
    60
}
fn default_review_model() -> String {
    "qwen3:4b".into()
}
fn default_review_backend() -> String {
    "http://127.0.0.1:40081".into()
}
fn default_review_timeout() -> u64 {
    30
}
fn default_review_context() -> usize {
    32_768
}
fn default_escalation_cooldown() -> u64 {
    600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaConfig {
    #[serde(default = "default_meta_model")]
    pub model: String,
    #[serde(default = "default_meta_backend")]
    pub backend_url: String,
    #[serde(default = "default_meta_timeout")]
    pub timeout_s: u64,
    /// Prompt budget for the large tier.
    #[serde(default = "default_meta_context")]
    pub context_tokens: usize,
    /// Similar historical issues pulled from the semantic store.
    #[serde(default = "default_history_k")]
    pub history_k: usize,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            model: default_meta_model(),
            backend_url: default_meta_backend(),
            timeout_s: default_meta_timeout(),
            context_tokens: default_meta_context(),
            history_k: default_history_k(),
        }
    }
}

fn default_meta_model() -> String {
    "qwen3:14b".into()
}
fn default_meta_backend() -> String {
    "http://127.0.0.1:40082".into()
}
fn default_meta_timeout() -> u64 {
    120
}
fn default_meta_context() -> usize {
    131_072
}
fn default_history_k() -> usize {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_autonomy")]
    pub autonomy_level: AutonomyLevel,
    #[serde(default = "default_protected_services")]
    pub protected_services: Vec<String>,
    #[serde(default = "default_action_timeout")]
    pub action_timeout_s: u64,
    /// Above this queue depth, auto-execution pauses entirely.
    #[serde(default = "default_queue_pause_depth")]
    pub queue_pause_depth: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            autonomy_level: default_autonomy(),
            protected_services: default_protected_services(),
            action_timeout_s: default_action_timeout(),
            queue_pause_depth: default_queue_pause_depth(),
        }
    }
}

fn default_autonomy() -> AutonomyLevel {
    AutonomyLevel::Suggest
}
fn default_protected_services() -> Vec<String> {
    [
        "sshd",
        "systemd-networkd",
        "NetworkManager",
        "systemd",
        "dbus",
        "systemd-logind",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
fn default_action_timeout() -> u64 {
    120
}
fn default_queue_pause_depth() -> usize {
    25
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_metrics_db")]
    pub db_path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
            db_path: default_metrics_db(),
        }
    }
}

fn default_retention_days() -> u32 {
    30
}
fn default_metrics_db() -> String {
    "/var/lib/vigil/metrics.db".into()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Gotify-style server base URL. Empty disables notifications.
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub token: String,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
