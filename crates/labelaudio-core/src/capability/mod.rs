//! Capability descriptors and the process-wide registry.
//!
//! A capability is a named atomic operation exposed by a provider. The
//! registry is filled once at startup from each provider's advertised tool
//! set and is read-only afterwards.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;

/// Artifact types exchanged between capabilities.
pub mod artifacts {
    pub const TRANSCRIPT: &str = "transcript";
    pub const DIARIZATION: &str = "diarization";
    pub const AUDIO_EVENTS: &str = "audio_events";
    pub const KEYWORD_HITS: &str = "keyword_hits";
    pub const SPEAKER_ANALYSIS: &str = "speaker_analysis";
    /// An already normalized analysis result.
    pub const ANALYSIS: &str = "analysis";
    pub const ANNOTATION_RECORD: &str = "annotation_record";
}

/// Registry errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("capability already registered: {0}")]
    DuplicateCapability(String),

    #[error("unknown capability: {0}")]
    UnknownCapability(String),
}

/// How a provider is reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Endpoint {
    /// In-process implementation.
    #[default]
    Local,
    Http {
        base_url: String,
    },
    Process {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
}

/// Which transport serves a capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TransportHandle {
    /// Name of the transport registered on the adapter.
    pub provider: String,
    #[serde(default)]
    pub endpoint: Endpoint,
}

impl TransportHandle {
    pub fn new(provider: impl Into<String>, endpoint: Endpoint) -> Self {
        Self {
            provider: provider.into(),
            endpoint,
        }
    }

    pub fn local(provider: impl Into<String>) -> Self {
        Self::new(provider, Endpoint::Local)
    }
}

/// Immutable description of one capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: Value,
    #[serde(default)]
    pub output_schema: Value,
    #[serde(default)]
    pub transport: TransportHandle,
    /// Artifact type this capability's output represents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub produces: Option<String>,
    /// Input parameter -> artifact type bound by reference to a producer.
    #[serde(default)]
    pub consumes: BTreeMap<String, String>,
    /// Provider-reported errors may be retried.
    #[serde(default)]
    pub retry_safe: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl CapabilityDescriptor {
    pub fn new(name: impl Into<String>, transport: TransportHandle) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            input_schema: Value::Null,
            output_schema: Value::Null,
            transport,
            produces: None,
            consumes: BTreeMap::new(),
            retry_safe: false,
            timeout_ms: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }

    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.output_schema = schema;
        self
    }

    pub fn with_produces(mut self, artifact: impl Into<String>) -> Self {
        self.produces = Some(artifact.into());
        self
    }

    pub fn with_consumes(mut self, param: impl Into<String>, artifact: impl Into<String>) -> Self {
        self.consumes.insert(param.into(), artifact.into());
        self
    }

    pub fn with_retry_safe(mut self, retry_safe: bool) -> Self {
        self.retry_safe = retry_safe;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Parameters listed under `required` in the input schema.
    pub fn required_inputs(&self) -> Vec<String> {
        self.input_schema
            .get("required")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Parameter names declared under `properties` in the input schema.
    pub fn input_names(&self) -> Vec<String> {
        self.input_schema
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| props.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Breadth of the output schema, used to rank competing matches.
    ///
    /// Counts declared output properties; an unconstrained schema is the
    /// broadest possible.
    pub fn output_breadth(&self) -> usize {
        self.output_schema
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| props.len())
            .unwrap_or(usize::MAX)
    }
}

/// Catalog row shown to a reasoning collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub produces: Option<String>,
}

/// Registry of available capabilities, in registration order.
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    entries: Vec<Arc<CapabilityDescriptor>>,
    index: HashMap<String, usize>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: CapabilityDescriptor) -> Result<(), RegistryError> {
        if self.index.contains_key(&descriptor.name) {
            return Err(RegistryError::DuplicateCapability(descriptor.name));
        }
        tracing::debug!(
            capability = %descriptor.name,
            provider = %descriptor.transport.provider,
            "capability registered"
        );
        self.index
            .insert(descriptor.name.clone(), self.entries.len());
        self.entries.push(Arc::new(descriptor));
        Ok(())
    }

    /// Register a provider's advertised set, stopping at the first conflict.
    pub fn register_all(
        &mut self,
        descriptors: impl IntoIterator<Item = CapabilityDescriptor>,
    ) -> Result<usize, RegistryError> {
        let mut count = 0;
        for descriptor in descriptors {
            self.register(descriptor)?;
            count += 1;
        }
        Ok(count)
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<CapabilityDescriptor>, RegistryError> {
        self.index
            .get(name)
            .and_then(|idx| self.entries.get(*idx))
            .cloned()
            .ok_or_else(|| RegistryError::UnknownCapability(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Position in registration order, used for deterministic tie-breaks.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn list(&self) -> Vec<Arc<CapabilityDescriptor>> {
        self.entries.clone()
    }

    pub fn catalog(&self) -> Vec<CatalogEntry> {
        self.entries
            .iter()
            .map(|d| CatalogEntry {
                name: d.name.clone(),
                description: d.description.clone(),
                input_schema: d.input_schema.clone(),
                produces: d.produces.clone(),
            })
            .collect()
    }

    /// Registered capability producing the given artifact type, if any.
    pub fn producer_of(&self, artifact: &str) -> Option<Arc<CapabilityDescriptor>> {
        self.entries
            .iter()
            .find(|d| d.produces.as_deref() == Some(artifact))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
