//! Bootstrap helpers for starting labelaudio from a single YAML config.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;

use labelaudio_config::{
    load_config, ApiKeyError, ConfigError, LabelAudioConfig, ObservabilityConfig, PlannerConfig,
    ProviderKind, ProviderSpec, StoreConfig,
};
use labelaudio_core::adapter::{CapabilityAdapter, CapabilityTransport, LocalTransport, TransportFailure};
use labelaudio_core::capability::{CapabilityRegistry, RegistryError};
use labelaudio_core::executor::{AuditSink, Orchestrator, RetryPolicy};
use labelaudio_core::mapper::{MapError, TaskType};
use labelaudio_core::planner::{
    IntentClassifier, ReasoningClassifier, RuleClassifier, TaskGraphBuilder,
};
use labelaudio_core::platform::{LabelingPlatform, PlatformError};
use labelaudio_core::store::{ResultStore, StoreError};
use labelaudio_providers::{
    HttpReasoningClient, HttpReasoningConfig, HttpTransport, LabelStudioClient, ProcessTransport,
};
use labelaudio_stores::{FileResultStore, InMemoryResultStore, JsonlAuditLog};

use crate::annotate::{AnnotateCapability, BUILTIN_PROVIDER};
use crate::pipeline::{Pipeline, PipelineOptions};

/// Runtime bootstrap errors.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("provider '{provider}': {source}")]
    Transport {
        provider: String,
        #[source]
        source: TransportFailure,
    },
    #[error("labeling platform error: {0}")]
    Platform(#[from] PlatformError),
    #[error("api key error: {0}")]
    ApiKey(#[from] ApiKeyError),
    #[error("mapper error: {0}")]
    Map(#[from] MapError),
    #[error("reasoning client error: {0}")]
    Reasoning(String),
    #[error("unsupported store backend: {0}")]
    UnsupportedStore(String),
    #[error("unsupported planner mode: {0}")]
    UnsupportedPlannerMode(String),
}

/// Everything a run needs, assembled from one config.
pub struct LabelAudioApp {
    pub config: LabelAudioConfig,
    pub registry: Arc<CapabilityRegistry>,
    pub store: Arc<dyn ResultStore>,
    pub pipeline: Pipeline,
}

static TRACING_INIT: OnceLock<()> = OnceLock::new();

impl LabelAudioApp {
    /// Load, validate and assemble from a `labelaudio.yaml`.
    pub async fn from_config_path(path: impl AsRef<Path>) -> Result<Self, BootstrapError> {
        let config = load_config(path.as_ref())?;
        init_tracing(&config.observability);
        Self::from_config(config).await
    }

    /// Assemble with the providers and labeling platform the config names.
    pub async fn from_config(config: LabelAudioConfig) -> Result<Self, BootstrapError> {
        let transports = build_transports(&config)?;
        let platform = build_platform(&config)?;
        Self::with_parts(config, transports, platform).await
    }

    /// Assemble around caller-supplied transports and platform.
    ///
    /// Capabilities are discovered from each transport in order, then the
    /// built-in ones are registered last.
    pub async fn with_parts(
        config: LabelAudioConfig,
        transports: Vec<Arc<dyn CapabilityTransport>>,
        platform: Option<Arc<dyn LabelingPlatform>>,
    ) -> Result<Self, BootstrapError> {
        let store = build_store(&config.store)?;
        let builtin: Arc<dyn CapabilityTransport> = Arc::new(
            LocalTransport::new(BUILTIN_PROVIDER)
                .with_capability(Arc::new(AnnotateCapability::new(store.clone()))),
        );

        let mut registry = CapabilityRegistry::new();
        let mut adapter = CapabilityAdapter::new(store.clone())
            .with_reference_threshold(
                usize::try_from(config.store.reference_threshold_bytes).unwrap_or(usize::MAX),
            )
            .with_default_timeout(Duration::from_millis(config.runtime.call_timeout_ms));
        for transport in transports.into_iter().chain(std::iter::once(builtin)) {
            let descriptors = transport
                .discover()
                .await
                .map_err(|source| BootstrapError::Transport {
                    provider: transport.name().to_string(),
                    source,
                })?;
            let count = registry.register_all(descriptors)?;
            tracing::info!(provider = %transport.name(), capabilities = count, "provider registered");
            adapter = adapter.with_transport(transport);
        }
        let registry = Arc::new(registry);

        let retry = RetryPolicy::new(
            config.runtime.max_attempts,
            Duration::from_millis(config.runtime.retry_base_delay_ms),
            Duration::from_millis(config.runtime.retry_max_delay_ms),
        );
        let mut orchestrator = Orchestrator::new(registry.clone(), Arc::new(adapter))
            .with_retry_policy(retry)
            .with_max_in_flight(config.runtime.max_in_flight);
        if let Some(sink) = build_audit_sink(&config.observability).await? {
            orchestrator = orchestrator.with_audit_sink(sink);
        }

        let builder = TaskGraphBuilder::new(registry.clone(), build_classifier(&config.planner)?)
            .with_defaults(planner_defaults(&config));
        let options = PipelineOptions {
            default_task_type: config.labeling.default_task_type.parse::<TaskType>()?,
            project_title: config.labeling.project_title.clone(),
            discard_after_run: config.runtime.discard_after_run,
        };
        let mut pipeline = Pipeline::new(builder, orchestrator, options);
        if let Some(platform) = platform {
            pipeline = pipeline.with_platform(platform);
        }

        tracing::info!(
            app = %config.app.name,
            capabilities = registry.len(),
            store = %config.store.backend,
            planner = %config.planner.mode,
            labeling = config.labeling.enabled,
            "labelaudio ready"
        );
        Ok(Self {
            config,
            registry,
            store,
            pipeline,
        })
    }
}

/// Install the global subscriber once. `RUST_LOG` wins over the configured
/// level; output goes to stderr unless a log file is configured.
pub fn init_tracing(observability: &ObservabilityConfig) {
    TRACING_INIT.get_or_init(|| {
        let log_file = std::env::var("LABELAUDIO_LOG_FILE")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| observability.log_file.clone());
        let file_writer = log_file.as_deref().and_then(create_log_writer);
        let fallback_level = match observability.log_level.trim().to_ascii_lowercase().as_str() {
            "trace" => "trace",
            "debug" => "debug",
            "warn" => "warn",
            "error" => "error",
            _ => "info",
        };
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .or_else(|_| tracing_subscriber::EnvFilter::try_new(fallback_level))
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

        match file_writer {
            Some(writer) => {
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_target(true)
                    .with_ansi(false)
                    .with_writer(writer)
                    .try_init();
            }
            None => {
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_target(true)
                    .with_writer(std::io::stderr)
                    .try_init();
            }
        }

        tracing::info!(
            log_level = %observability.log_level,
            log_file = log_file.as_deref().unwrap_or("(stderr)"),
            "tracing initialized"
        );
    });
}

fn create_log_writer(path: &str) -> Option<SharedFileMakeWriter> {
    use std::fs::{create_dir_all, OpenOptions};

    let file_path = Path::new(path);
    if let Some(parent) = file_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Err(err) = create_dir_all(parent) {
            eprintln!("failed to create log directory '{}': {}", parent.display(), err);
            return None;
        }
    }
    match OpenOptions::new().create(true).append(true).open(file_path) {
        Ok(file) => Some(SharedFileMakeWriter {
            file: Arc::new(std::sync::Mutex::new(file)),
        }),
        Err(err) => {
            eprintln!("failed to open log file '{}': {}", file_path.display(), err);
            None
        }
    }
}

#[derive(Clone)]
struct SharedFileMakeWriter {
    file: Arc<std::sync::Mutex<std::fs::File>>,
}

struct SharedFileWriter {
    file: Arc<std::sync::Mutex<std::fs::File>>,
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SharedFileMakeWriter {
    type Writer = SharedFileWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SharedFileWriter {
            file: self.file.clone(),
        }
    }
}

impl std::io::Write for SharedFileWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut file = self
            .file
            .lock()
            .map_err(|_| std::io::Error::other("log file mutex poisoned"))?;
        std::io::Write::write(&mut *file, buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut file = self
            .file
            .lock()
            .map_err(|_| std::io::Error::other("log file mutex poisoned"))?;
        std::io::Write::flush(&mut *file)
    }
}

pub fn build_store(config: &StoreConfig) -> Result<Arc<dyn ResultStore>, BootstrapError> {
    match config.backend.as_str() {
        "in_memory" => Ok(Arc::new(InMemoryResultStore::new())),
        "file" => Ok(Arc::new(FileResultStore::new(&config.root_dir))),
        other => Err(BootstrapError::UnsupportedStore(other.to_string())),
    }
}

fn build_transport(
    spec: &ProviderSpec,
    call_timeout: Duration,
) -> Result<Arc<dyn CapabilityTransport>, BootstrapError> {
    match spec.kind {
        ProviderKind::Http => {
            let base_url = spec.base_url.clone().unwrap_or_default();
            let mut transport = HttpTransport::new(&spec.name, base_url, call_timeout).map_err(
                |source| BootstrapError::Transport {
                    provider: spec.name.clone(),
                    source,
                },
            )?;
            if spec.api_key_env.is_some() {
                transport = transport.with_api_key(spec.resolve_api_key()?);
            }
            Ok(Arc::new(transport))
        }
        ProviderKind::Process => {
            let command = spec.command.clone().unwrap_or_default();
            Ok(Arc::new(
                ProcessTransport::new(&spec.name, command)
                    .with_args(spec.args.clone())
                    .with_env(spec.env.clone()),
            ))
        }
    }
}

/// Transports for every enabled provider, in config order.
pub fn build_transports(
    config: &LabelAudioConfig,
) -> Result<Vec<Arc<dyn CapabilityTransport>>, BootstrapError> {
    let call_timeout = Duration::from_millis(config.runtime.call_timeout_ms);
    config
        .providers
        .iter()
        .filter(|spec| {
            if !spec.enabled {
                tracing::debug!(provider = %spec.name, "provider disabled, skipping");
            }
            spec.enabled
        })
        .map(|spec| build_transport(spec, call_timeout))
        .collect()
}

fn build_platform(
    config: &LabelAudioConfig,
) -> Result<Option<Arc<dyn LabelingPlatform>>, BootstrapError> {
    let labeling = &config.labeling;
    if !labeling.enabled {
        return Ok(None);
    }
    let client = LabelStudioClient::new(
        &labeling.base_url,
        labeling.resolve_api_key()?,
        Duration::from_millis(labeling.timeout_ms),
    )?;
    Ok(Some(Arc::new(client)))
}

fn build_classifier(planner: &PlannerConfig) -> Result<Arc<dyn IntentClassifier>, BootstrapError> {
    match planner.mode.as_str() {
        "rules" => Ok(Arc::new(RuleClassifier::default())),
        "reasoning" => {
            let mut settings = HttpReasoningConfig {
                api_key: planner.resolve_api_key().ok(),
                timeout: Duration::from_millis(planner.timeout_ms),
                ..HttpReasoningConfig::default()
            };
            if let Some(endpoint) = &planner.endpoint {
                settings.endpoint = endpoint.clone();
            }
            if let Some(model) = &planner.model {
                settings.model = model.clone();
            }
            let client = HttpReasoningClient::new(settings).map_err(BootstrapError::Reasoning)?;
            let mut classifier = ReasoningClassifier::new(Arc::new(client));
            if planner.fallback_to_rules {
                classifier = classifier.with_fallback(RuleClassifier::default());
            }
            Ok(Arc::new(classifier))
        }
        other => Err(BootstrapError::UnsupportedPlannerMode(other.to_string())),
    }
}

fn planner_defaults(config: &LabelAudioConfig) -> BTreeMap<String, Value> {
    let mut defaults = BTreeMap::new();
    defaults.insert(
        "task_type".to_string(),
        json!(config.labeling.default_task_type.trim().to_ascii_lowercase()),
    );
    if let Some(language) = &config.planner.default_language {
        defaults.insert("language".to_string(), json!(language));
    }
    defaults
}

async fn build_audit_sink(
    observability: &ObservabilityConfig,
) -> Result<Option<Arc<dyn AuditSink>>, BootstrapError> {
    match &observability.audit_file {
        Some(path) => {
            let log = JsonlAuditLog::open(path).await?;
            Ok(Some(Arc::new(log)))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labelaudio_config::parse_config;

    #[test]
    fn test_builtin_annotate_is_registered_last() {
        tokio_test::block_on(async {
            let app = LabelAudioApp::from_config(LabelAudioConfig::default())
                .await
                .expect("app");
            let names: Vec<String> = app.registry.list().iter().map(|d| d.name.clone()).collect();
            assert_eq!(names, vec!["annotate_audio".to_string()]);
            assert_eq!(
                app.registry.lookup("annotate_audio").expect("annotate").transport.provider,
                BUILTIN_PROVIDER
            );
        });
    }

    #[test]
    fn test_process_providers_are_discovered() {
        tokio_test::block_on(async {
            let config = parse_config(
                r#"
providers:
  - name: events
    kind: process
    command: sh
    args:
      - -c
      - 'cat >/dev/null; printf "{\"capabilities\":[{\"name\":\"detect_audio_events\",\"produces\":\"audio_events\"}]}"'
  - name: offline
    kind: process
    command: /nonexistent/provider
    enabled: false
"#,
            )
            .expect("config");
            let app = LabelAudioApp::from_config(config).await.expect("app");
            assert_eq!(app.registry.position("detect_audio_events"), Some(0));
            assert_eq!(app.registry.position("annotate_audio"), Some(1));
        });
    }

    #[test]
    fn test_unreachable_provider_fails_startup() {
        tokio_test::block_on(async {
            let config = parse_config(
                r#"
providers:
  - name: asr
    kind: process
    command: /nonexistent/labelaudio-asr
"#,
            )
            .expect("config");
            let err = LabelAudioApp::from_config(config).await.err().expect("error");
            assert!(matches!(err, BootstrapError::Transport { ref provider, .. } if provider == "asr"));
        });
    }

    #[test]
    fn test_store_backends() {
        let mut store = StoreConfig::default();
        assert!(build_store(&store).is_ok());
        store.backend = "redis".to_string();
        assert!(matches!(
            build_store(&store),
            Err(BootstrapError::UnsupportedStore(_))
        ));
    }

    #[test]
    fn test_planner_defaults_carry_task_type_and_language() {
        let mut config = LabelAudioConfig::default();
        config.planner.default_language = Some("zh".to_string());
        let defaults = planner_defaults(&config);
        assert_eq!(defaults.get("task_type"), Some(&json!("speech")));
        assert_eq!(defaults.get("language"), Some(&json!("zh")));
    }
}
