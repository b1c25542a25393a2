//! # labelaudio runtime
//!
//! Wires configuration, stores, providers and the core together:
//! - [`LabelAudioApp`]: bootstrap from `labelaudio.yaml`
//! - [`Pipeline`]: instruction -> plan -> execution -> annotation -> export
//! - the built-in `annotate_audio` capability

mod annotate;
mod bootstrap;
mod pipeline;

pub use annotate::{AnnotateCapability, ANNOTATE_CAPABILITY, BUILTIN_PROVIDER};
pub use bootstrap::{build_store, build_transports, init_tracing, BootstrapError, LabelAudioApp};
pub use pipeline::{ExportReceipt, Pipeline, PipelineError, PipelineOptions, PipelineReport};
