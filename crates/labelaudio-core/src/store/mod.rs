//! Result store contract
//!
//! Capability outputs travel between tasks as [`ResultRef`] handles. The
//! payload itself lives in a [`ResultStore`] keyed by `(run_id, content_hash)`.
//!
//! Note: implementations are in the labelaudio-stores crate

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Default content type for JSON payloads.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Store error types
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing entry is missing, was purged, or belongs to another run.
    #[error("reference not found: {0}")]
    ReferenceNotFound(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Opaque handle standing in for a stored payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResultRef {
    /// Content hash, unique within the run namespace.
    pub ref_id: String,
    pub run_id: String,
    /// Backend specific address, e.g. `memory://run/hash` or a file path.
    pub location: String,
    pub size_bytes: u64,
    pub content_type: String,
}

impl ResultRef {
    /// Interpret a JSON value as a reference, if it has the reference shape.
    pub fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        if !object.contains_key("ref_id") || !object.contains_key("location") {
            return None;
        }
        serde_json::from_value(value.clone()).ok()
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "ref_id": self.ref_id,
            "run_id": self.run_id,
            "location": self.location,
            "size_bytes": self.size_bytes,
            "content_type": self.content_type,
        })
    }

    /// JSON schema accepted for inputs that carry a reference.
    pub fn json_schema() -> Value {
        serde_json::json!({
            "type": "object",
            "required": ["ref_id", "run_id", "location", "size_bytes", "content_type"],
            "properties": {
                "ref_id": {"type": "string"},
                "run_id": {"type": "string"},
                "location": {"type": "string"},
                "size_bytes": {"type": "integer"},
                "content_type": {"type": "string"}
            }
        })
    }

    /// Short form for logs and reasoning prompts.
    pub fn summary(&self) -> String {
        let short: String = self.ref_id.chars().take(12).collect();
        format!("ref:{} ({}, {} bytes)", short, self.content_type, self.size_bytes)
    }
}

/// Serialize a payload into the bytes that get hashed and stored.
pub fn encode_payload(payload: &Value) -> Result<Vec<u8>, StoreError> {
    Ok(serde_json::to_vec(payload)?)
}

/// Deterministic identity of a payload inside a run namespace.
pub fn content_hash(run_id: &str, bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(run_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Content-addressed payload storage, namespaced per orchestration run.
///
/// Writes of identical content within a run return the same reference and
/// occupy one entry, so concurrent or retried writes need no coordination.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn put(
        &self,
        run_id: &str,
        payload: &Value,
        content_type: &str,
    ) -> Result<ResultRef, StoreError>;

    /// Resolve a reference. Fails with `ReferenceNotFound` once the entry
    /// is deleted or its run purged.
    async fn get(&self, reference: &ResultRef) -> Result<Value, StoreError>;

    async fn delete(&self, reference: &ResultRef) -> Result<(), StoreError>;

    /// Remove every entry of a run. Returns how many entries were dropped.
    async fn purge_run(&self, run_id: &str) -> Result<usize, StoreError>;
}
