//! Built-in `annotate_audio` capability.
//!
//! Consumes analysis references from upstream tasks, resolves them from the
//! result store, normalizes and maps them into an annotation record. It is
//! registered like any remote capability so the orchestrator treats it the
//! same way.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use labelaudio_core::adapter::{CapabilityRequest, LocalCapability, ProviderError};
use labelaudio_core::capability::{artifacts, CapabilityDescriptor, TransportHandle};
use labelaudio_core::mapper::{map_analysis, normalize_analysis, AnalysisArtifacts, MapError, TaskType};
use labelaudio_core::store::{ResultRef, ResultStore, StoreError};

/// Transport name serving in-process capabilities.
pub const BUILTIN_PROVIDER: &str = "builtin";
pub const ANNOTATE_CAPABILITY: &str = "annotate_audio";

pub struct AnnotateCapability {
    store: Arc<dyn ResultStore>,
}

impl AnnotateCapability {
    pub fn new(store: Arc<dyn ResultStore>) -> Self {
        Self { store }
    }

    async fn resolve(&self, arguments: &Value, param: &str) -> Result<Option<Value>, ProviderError> {
        let Some(raw) = arguments.get(param) else {
            return Ok(None);
        };
        let reference = ResultRef::from_value(raw).ok_or_else(|| {
            ProviderError::new("InvalidReference", format!("'{}' is not a result reference", param))
        })?;
        match self.store.get(&reference).await {
            Ok(payload) => Ok(Some(payload)),
            Err(StoreError::ReferenceNotFound(summary)) => Err(ProviderError::reference_not_found(
                format!("'{}' no longer resolves: {}", param, summary),
            )),
            Err(err) => Err(ProviderError::new("StoreError", err.to_string())),
        }
    }
}

fn required<'a>(arguments: &'a Value, param: &str) -> Result<&'a str, ProviderError> {
    arguments.get(param).and_then(Value::as_str).ok_or_else(|| {
        ProviderError::new("MissingArgument", format!("'{}' is required", param))
    })
}

fn map_error(err: MapError) -> ProviderError {
    let kind = match &err {
        MapError::UnknownTaskType(_) => "UnknownTaskType",
        MapError::MalformedAnalysis(_) => "MalformedAnalysis",
        MapError::Store(_) => "StoreError",
    };
    ProviderError::new(kind, err.to_string())
}

#[async_trait]
impl LocalCapability for AnnotateCapability {
    fn descriptor(&self) -> CapabilityDescriptor {
        let reference = ResultRef::json_schema();
        CapabilityDescriptor::new(ANNOTATE_CAPABILITY, TransportHandle::local(BUILTIN_PROVIDER))
            .with_description("Turn analysis results into a labeling-platform annotation record")
            .with_input_schema(json!({
                "type": "object",
                "required": ["audio_url", "task_type"],
                "properties": {
                    "audio_url": {"type": "string", "format": "uri"},
                    "task_type": {"type": "string", "enum": ["speech", "music", "mixed"]},
                    "transcript": reference.clone(),
                    "diarization": reference.clone(),
                    "events": reference.clone(),
                    "keywords": reference.clone(),
                    "speakers": reference
                }
            }))
            .with_output_schema(json!({
                "type": "object",
                "properties": {
                    "record": {"type": "object"},
                    "label_config": {"type": "string"}
                }
            }))
            .with_produces(artifacts::ANNOTATION_RECORD)
            .with_consumes("transcript", artifacts::TRANSCRIPT)
            .with_consumes("diarization", artifacts::DIARIZATION)
            .with_consumes("events", artifacts::AUDIO_EVENTS)
            .with_consumes("keywords", artifacts::KEYWORD_HITS)
            .with_consumes("speakers", artifacts::SPEAKER_ANALYSIS)
    }

    async fn run(&self, request: &CapabilityRequest) -> Result<Value, ProviderError> {
        let arguments = &request.arguments;
        let audio_url = required(arguments, "audio_url")?;
        let task_type = required(arguments, "task_type")?
            .parse::<TaskType>()
            .map_err(map_error)?;

        let artifacts = AnalysisArtifacts {
            transcript: self.resolve(arguments, "transcript").await?,
            diarization: self.resolve(arguments, "diarization").await?,
            events: self.resolve(arguments, "events").await?,
            keyword_hits: self.resolve(arguments, "keywords").await?,
            speaker_analysis: self.resolve(arguments, "speakers").await?,
        };
        let analysis = normalize_analysis(audio_url, &artifacts).map_err(map_error)?;
        let record = map_analysis(task_type, &analysis).map_err(map_error)?;
        tracing::debug!(
            run_id = %request.context.run_id,
            task_type = %task_type,
            regions = record.regions.len(),
            "annotation record built"
        );
        let label_config = record.label_config();
        let record = serde_json::to_value(&record)
            .map_err(|e| ProviderError::new("SerializationError", e.to_string()))?;
        Ok(json!({"record": record, "label_config": label_config}))
    }
}
