//! Capability provider declarations.

use serde::Deserialize;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// `GET {base_url}/capabilities`, `POST {base_url}/invoke`.
    Http,
    /// Child process speaking JSON lines on stdin/stdout.
    Process,
}

/// One capability provider. Its capabilities are discovered at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSpec {
    pub name: String,
    pub kind: ProviderKind,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Environment variable holding the provider's bearer token.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ProviderSpec {
    /// Resolve API key from the configured environment variable.
    pub fn resolve_api_key(&self) -> Result<String, ApiKeyError> {
        let env_name = self.api_key_env.as_ref().ok_or(ApiKeyError::NotConfigured)?;
        resolve_env(env_name)
    }
}

/// Read a secret from the named environment variable.
pub(crate) fn resolve_env(env_name: &str) -> Result<String, ApiKeyError> {
    std::env::var(env_name).map_err(|_| ApiKeyError::EnvNotFound(env_name.to_string()))
}

#[derive(Debug, Error)]
pub enum ApiKeyError {
    #[error("API key environment variable not configured")]
    NotConfigured,
    #[error("Environment variable '{0}' not found")]
    EnvNotFound(String),
}
