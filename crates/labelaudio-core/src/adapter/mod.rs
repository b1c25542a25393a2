//! Capability provider adapter
//!
//! Uniform call interface over any transport. The adapter validates inputs,
//! enforces the call deadline, classifies failures and decides whether an
//! output is handed back inline or as a stored reference.

mod local;

pub use local::{LocalCapability, LocalTransport};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::capability::CapabilityDescriptor;
use crate::schema;
use crate::store::{encode_payload, ResultRef, ResultStore, StoreError, JSON_CONTENT_TYPE};
use crate::types::TaskId;

/// Outputs larger than this are stored and returned by reference.
pub const DEFAULT_REFERENCE_THRESHOLD_BYTES: usize = 50 * 1024;
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Identifies the orchestration context of one call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallContext {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(default)]
    pub attempt: u32,
}

impl CallContext {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            task_id: None,
            attempt: 1,
        }
    }

    pub fn with_task(mut self, task_id: impl Into<TaskId>, attempt: u32) -> Self {
        self.task_id = Some(task_id.into());
        self.attempt = attempt;
        self
    }
}

/// Wire request sent to a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityRequest {
    pub capability_name: String,
    pub arguments: Value,
    #[serde(default)]
    pub context: CallContext,
}

/// Error type a provider reports when a reference argument no longer resolves.
pub const REFERENCE_NOT_FOUND: &str = "ReferenceNotFound";

/// Provider-reported error body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderError {
    #[serde(rename = "type", default)]
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ProviderError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn reference_not_found(message: impl Into<String>) -> Self {
        Self::new(REFERENCE_NOT_FOUND, message)
    }
}

/// Wire response returned by a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ProviderError>,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    /// Size of `result` as reported by the provider. Zero means unknown.
    #[serde(default)]
    pub size_bytes: u64,
}

fn default_content_type() -> String {
    JSON_CONTENT_TYPE.to_string()
}

impl CapabilityResponse {
    pub fn ok(result: Value) -> Self {
        let size_bytes = serde_json::to_vec(&result)
            .map(|bytes| bytes.len() as u64)
            .unwrap_or(0);
        Self {
            success: true,
            result: Some(result),
            error: None,
            content_type: default_content_type(),
            size_bytes,
        }
    }

    pub fn failed(error: ProviderError) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error),
            content_type: default_content_type(),
            size_bytes: 0,
        }
    }
}

/// Failures below the provider's application layer.
#[derive(Debug, Clone, Error)]
pub enum TransportFailure {
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connection(String),

    /// The provider is up but temporarily refusing work (5xx, 429).
    #[error("provider unavailable (status {status}): {message}")]
    Unavailable { status: u16, message: String },

    /// The provider answered with something that is not a valid response.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportFailure {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportFailure::Protocol(_))
    }
}

/// A way of reaching one provider.
#[async_trait]
pub trait CapabilityTransport: Send + Sync {
    /// Matches `TransportHandle::provider` of the descriptors it serves.
    fn name(&self) -> &str;

    /// Advertised capability set, queried once at startup.
    async fn discover(&self) -> Result<Vec<CapabilityDescriptor>, TransportFailure>;

    async fn call(
        &self,
        descriptor: &CapabilityDescriptor,
        request: CapabilityRequest,
    ) -> Result<CapabilityResponse, TransportFailure>;
}

/// Invocation errors, classified for the retry policy.
#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("schema violation for '{capability}': {reason}")]
    SchemaViolation { capability: String, reason: String },

    #[error("transport error calling '{capability}': {source}")]
    Transport {
        capability: String,
        #[source]
        source: TransportFailure,
    },

    #[error("capability '{capability}' failed: {}: {}", .error.kind, .error.message)]
    Capability {
        capability: String,
        error: ProviderError,
        retryable: bool,
    },

    #[error("no transport named '{0}'")]
    UnknownTransport(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl InvokeError {
    pub fn is_retryable(&self) -> bool {
        match self {
            InvokeError::Transport { source, .. } => source.is_retryable(),
            InvokeError::Capability { retryable, .. } => *retryable,
            InvokeError::SchemaViolation { .. }
            | InvokeError::UnknownTransport(_)
            | InvokeError::Store(_) => false,
        }
    }
}

/// What a successful invocation hands back.
#[derive(Debug, Clone, PartialEq)]
pub enum CapabilityOutput {
    Inline {
        payload: Value,
        content_type: String,
        size_bytes: u64,
    },
    Stored(ResultRef),
}

impl CapabilityOutput {
    pub fn size_bytes(&self) -> u64 {
        match self {
            CapabilityOutput::Inline { size_bytes, .. } => *size_bytes,
            CapabilityOutput::Stored(reference) => reference.size_bytes,
        }
    }
}

/// Invokes registered capabilities through their transports.
pub struct CapabilityAdapter {
    transports: HashMap<String, Arc<dyn CapabilityTransport>>,
    store: Arc<dyn ResultStore>,
    reference_threshold_bytes: usize,
    default_timeout: Duration,
}

impl CapabilityAdapter {
    pub fn new(store: Arc<dyn ResultStore>) -> Self {
        Self {
            transports: HashMap::new(),
            store,
            reference_threshold_bytes: DEFAULT_REFERENCE_THRESHOLD_BYTES,
            default_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn CapabilityTransport>) -> Self {
        self.transports
            .insert(transport.name().to_string(), transport);
        self
    }

    pub fn with_reference_threshold(mut self, bytes: usize) -> Self {
        self.reference_threshold_bytes = bytes;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn store(&self) -> &Arc<dyn ResultStore> {
        &self.store
    }

    pub fn transports(&self) -> impl Iterator<Item = &Arc<dyn CapabilityTransport>> {
        self.transports.values()
    }

    pub fn reference_threshold_bytes(&self) -> usize {
        self.reference_threshold_bytes
    }

    /// Validate, call and normalize one capability invocation.
    pub async fn invoke(
        &self,
        descriptor: &CapabilityDescriptor,
        arguments: Value,
        context: CallContext,
    ) -> Result<CapabilityOutput, InvokeError> {
        schema::validate(&arguments, &descriptor.input_schema).map_err(|reason| {
            InvokeError::SchemaViolation {
                capability: descriptor.name.clone(),
                reason,
            }
        })?;

        let transport = self
            .transports
            .get(&descriptor.transport.provider)
            .ok_or_else(|| InvokeError::UnknownTransport(descriptor.transport.provider.clone()))?;

        let deadline = descriptor
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);
        let run_id = context.run_id.clone();
        let request = CapabilityRequest {
            capability_name: descriptor.name.clone(),
            arguments,
            context,
        };

        let response = match tokio::time::timeout(deadline, transport.call(descriptor, request)).await
        {
            Ok(Ok(response)) => response,
            Ok(Err(source)) => {
                return Err(InvokeError::Transport {
                    capability: descriptor.name.clone(),
                    source,
                })
            }
            Err(_) => {
                return Err(InvokeError::Transport {
                    capability: descriptor.name.clone(),
                    source: TransportFailure::Timeout(deadline),
                })
            }
        };

        if !response.success {
            let error = response.error.unwrap_or_else(|| {
                ProviderError::new("UnknownError", "provider reported failure without details")
            });
            if error.kind == REFERENCE_NOT_FOUND {
                return Err(InvokeError::Store(StoreError::ReferenceNotFound(error.message)));
            }
            return Err(InvokeError::Capability {
                capability: descriptor.name.clone(),
                error,
                retryable: descriptor.retry_safe,
            });
        }

        let payload = response.result.ok_or_else(|| InvokeError::Transport {
            capability: descriptor.name.clone(),
            source: TransportFailure::Protocol("successful response without result".to_string()),
        })?;
        let size_bytes = if response.size_bytes > 0 {
            response.size_bytes
        } else {
            encode_payload(&payload)?.len() as u64
        };

        if size_bytes as usize > self.reference_threshold_bytes {
            let reference = self
                .store
                .put(&run_id, &payload, &response.content_type)
                .await?;
            tracing::debug!(
                capability = %descriptor.name,
                size_bytes,
                reference = %reference.summary(),
                "capability output stored by reference"
            );
            return Ok(CapabilityOutput::Stored(reference));
        }

        Ok(CapabilityOutput::Inline {
            payload,
            content_type: response.content_type,
            size_bytes,
        })
    }
}
