//! Configuration loading and validation.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::{LabelAudioConfig, ProviderKind};

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Load and validate configuration from a YAML file.
pub fn load_config(path: &Path) -> Result<LabelAudioConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    let config = parse_config(&content)?;
    tracing::debug!(path = %path.display(), providers = config.providers.len(), "config loaded");
    Ok(config)
}

/// Parse and validate configuration from YAML text.
pub fn parse_config(content: &str) -> Result<LabelAudioConfig, ConfigError> {
    let config: LabelAudioConfig = if content.trim().is_empty() {
        LabelAudioConfig::default()
    } else {
        serde_yaml::from_str(content)?
    };
    validate_config(&config)?;
    Ok(config)
}

pub fn validate_config(config: &LabelAudioConfig) -> Result<(), ConfigError> {
    if config.version == 0 {
        return Err(ConfigError::Invalid(
            "version must be greater than 0".to_string(),
        ));
    }

    if config.app.name.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "app.name must not be empty".to_string(),
        ));
    }

    let runtime = &config.runtime;
    for (name, value) in [
        ("runtime.max_in_flight", runtime.max_in_flight as u64),
        ("runtime.max_attempts", runtime.max_attempts as u64),
        ("runtime.call_timeout_ms", runtime.call_timeout_ms),
    ] {
        if value == 0 {
            return Err(ConfigError::Invalid(format!("{} must be > 0", name)));
        }
    }
    if runtime.retry_max_delay_ms < runtime.retry_base_delay_ms {
        return Err(ConfigError::Invalid(
            "runtime.retry_max_delay_ms must be >= runtime.retry_base_delay_ms".to_string(),
        ));
    }

    match config.store.backend.as_str() {
        "in_memory" => {}
        "file" => {
            if config.store.root_dir.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "store.root_dir must not be empty for the file backend".to_string(),
                ));
            }
        }
        other => {
            return Err(ConfigError::Invalid(format!(
                "store.backend '{}' is not one of in_memory, file",
                other
            )));
        }
    }

    match config.planner.mode.as_str() {
        "rules" => {}
        "reasoning" => {
            if config.planner.endpoint.as_deref().map_or(true, |e| e.trim().is_empty()) {
                return Err(ConfigError::Invalid(
                    "planner.endpoint is required in reasoning mode".to_string(),
                ));
            }
            if config.planner.model.as_deref().map_or(true, |m| m.trim().is_empty()) {
                return Err(ConfigError::Invalid(
                    "planner.model is required in reasoning mode".to_string(),
                ));
            }
        }
        other => {
            return Err(ConfigError::Invalid(format!(
                "planner.mode '{}' is not one of rules, reasoning",
                other
            )));
        }
    }

    if !matches!(
        config.labeling.default_task_type.as_str(),
        "speech" | "music" | "mixed"
    ) {
        return Err(ConfigError::Invalid(format!(
            "labeling.default_task_type '{}' is not one of speech, music, mixed",
            config.labeling.default_task_type
        )));
    }

    validate_providers(config)
}

fn validate_providers(config: &LabelAudioConfig) -> Result<(), ConfigError> {
    let mut seen: Vec<&str> = Vec::new();
    for provider in &config.providers {
        let name = provider.name.trim();
        if name.is_empty() {
            return Err(ConfigError::Invalid(
                "providers[].name must not be empty".to_string(),
            ));
        }
        if name == "builtin" {
            return Err(ConfigError::Invalid(
                "providers[].name 'builtin' is reserved".to_string(),
            ));
        }
        if seen.contains(&name) {
            return Err(ConfigError::Invalid(format!(
                "providers[{}] is declared twice",
                name
            )));
        }
        seen.push(name);

        match provider.kind {
            ProviderKind::Http => {
                let url = provider.base_url.as_deref().unwrap_or_default();
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(ConfigError::Invalid(format!(
                        "providers[{}].base_url must be an http(s) url",
                        name
                    )));
                }
            }
            ProviderKind::Process => {
                if provider.command.as_deref().map_or(true, |c| c.trim().is_empty()) {
                    return Err(ConfigError::Invalid(format!(
                        "providers[{}].command must not be empty",
                        name
                    )));
                }
            }
        }
    }
    Ok(())
}
