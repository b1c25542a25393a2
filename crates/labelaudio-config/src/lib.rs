//! # labelaudio config
//!
//! Single-file configuration for labelaudio.
//! One `labelaudio.yaml` configures orchestration knobs, the result store,
//! the planner, capability providers, the labeling platform and
//! observability. Every field has a default, so an empty file is valid.

mod loader;
mod providers;

pub use loader::{load_config, parse_config, validate_config, ConfigError};
pub use providers::{ApiKeyError, ProviderKind, ProviderSpec};

use serde::Deserialize;

/// Top-level configuration schema.
#[derive(Debug, Clone, Deserialize)]
pub struct LabelAudioConfig {
    /// Config schema version.
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub providers: Vec<ProviderSpec>,
    #[serde(default)]
    pub labeling: LabelingConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

fn default_version() -> u32 {
    1
}

impl Default for LabelAudioConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            app: AppConfig::default(),
            runtime: RuntimeConfig::default(),
            store: StoreConfig::default(),
            planner: PlannerConfig::default(),
            providers: Vec::new(),
            labeling: LabelingConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl LabelAudioConfig {
    pub fn provider(&self, name: &str) -> Option<&ProviderSpec> {
        self.providers.iter().find(|p| p.name == name)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_app_name")]
    pub name: String,
    #[serde(default = "default_env")]
    pub environment: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            environment: default_env(),
        }
    }
}

fn default_app_name() -> String {
    "labelaudio".to_string()
}

fn default_env() -> String {
    "development".to_string()
}

/// Orchestration knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Total attempts per task, first call included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Purge a run's stored results once its annotations are imported.
    #[serde(default = "default_true")]
    pub discard_after_run: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            max_attempts: default_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            discard_after_run: true,
        }
    }
}

fn default_max_in_flight() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    200
}

fn default_retry_max_delay_ms() -> u64 {
    5_000
}

fn default_call_timeout_ms() -> u64 {
    60_000
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// `in_memory` or `file`.
    #[serde(default = "default_store_backend")]
    pub backend: String,
    #[serde(default = "default_store_root")]
    pub root_dir: String,
    /// Outputs larger than this are passed by reference only.
    #[serde(default = "default_reference_threshold")]
    pub reference_threshold_bytes: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            root_dir: default_store_root(),
            reference_threshold_bytes: default_reference_threshold(),
        }
    }
}

fn default_store_backend() -> String {
    "in_memory".to_string()
}

fn default_store_root() -> String {
    "data/results".to_string()
}

fn default_reference_threshold() -> u64 {
    50 * 1024
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlannerConfig {
    /// `rules` or `reasoning`.
    #[serde(default = "default_planner_mode")]
    pub mode: String,
    /// Chat-completions endpoint of the reasoning collaborator.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_planner_timeout_ms")]
    pub timeout_ms: u64,
    /// Fall back to rule matching when the collaborator fails.
    #[serde(default = "default_true")]
    pub fallback_to_rules: bool,
    #[serde(default)]
    pub default_language: Option<String>,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            mode: default_planner_mode(),
            endpoint: None,
            model: None,
            api_key_env: None,
            timeout_ms: default_planner_timeout_ms(),
            fallback_to_rules: true,
            default_language: None,
        }
    }
}

impl PlannerConfig {
    pub fn resolve_api_key(&self) -> Result<String, ApiKeyError> {
        let env_name = self.api_key_env.as_ref().ok_or(ApiKeyError::NotConfigured)?;
        providers::resolve_env(env_name)
    }
}

fn default_planner_mode() -> String {
    "rules".to_string()
}

fn default_planner_timeout_ms() -> u64 {
    30_000
}

/// Labeling platform (Label Studio) settings.
#[derive(Debug, Clone, Deserialize)]
pub struct LabelingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_labeling_url")]
    pub base_url: String,
    #[serde(default = "default_labeling_key_env")]
    pub api_key_env: String,
    /// `speech`, `music` or `mixed`.
    #[serde(default = "default_task_type")]
    pub default_task_type: String,
    #[serde(default = "default_project_title")]
    pub project_title: String,
    #[serde(default = "default_labeling_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for LabelingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: default_labeling_url(),
            api_key_env: default_labeling_key_env(),
            default_task_type: default_task_type(),
            project_title: default_project_title(),
            timeout_ms: default_labeling_timeout_ms(),
        }
    }
}

impl LabelingConfig {
    pub fn resolve_api_key(&self) -> Result<String, ApiKeyError> {
        providers::resolve_env(&self.api_key_env)
    }
}

fn default_labeling_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_labeling_key_env() -> String {
    "LABEL_STUDIO_API_KEY".to_string()
}

fn default_task_type() -> String {
    "speech".to_string()
}

fn default_project_title() -> String {
    "Audio annotation".to_string()
}

fn default_labeling_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_file: Option<String>,
    /// JSON-lines audit trail of every orchestration transition.
    #[serde(default)]
    pub audit_file: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_file: None,
            audit_file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
