//! # labelaudio core
//!
//! Orchestration core for turning audio into labeling-platform annotations.
//!
//! This crate contains:
//! - Capability descriptors and the registry built at startup
//! - The adapter that invokes capabilities over any transport
//! - The result store contract used to pass references instead of payloads
//! - The task graph builder (instruction -> plan)
//! - The orchestrator that executes a plan as a DAG
//! - The schema mapper (analysis -> annotation record)
//!
//! This crate does NOT care about:
//! - Which concrete transport reaches a provider
//! - Where stored payloads physically live
//! - How configuration is loaded

pub mod adapter;
pub mod capability;
pub mod executor;
pub mod mapper;
pub mod planner;
pub mod platform;
pub mod schema;
pub mod store;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::adapter::{
        CallContext, CapabilityAdapter, CapabilityOutput, CapabilityRequest, CapabilityResponse,
        CapabilityTransport, InvokeError, LocalCapability, LocalTransport, ProviderError,
        TransportFailure,
    };
    pub use crate::capability::{
        CapabilityDescriptor, CapabilityRegistry, CatalogEntry, Endpoint, RegistryError,
        TransportHandle,
    };
    pub use crate::executor::{
        AuditEvent, AuditPhase, AuditSink, ExecuteError, Orchestrator, PlanOutcome, PlanResult,
        RetryPolicy, TaskReport,
    };
    pub use crate::mapper::{
        map_analysis, normalize_analysis, AnalysisArtifacts, AnalysisResult, AnnotationRecord,
        MapError, SchemaMapper, TaskType,
    };
    pub use crate::planner::{
        BuildError, IntentClassifier, IntentMatch, ReasoningClassifier, ReasoningClient,
        ReasoningRequest, RuleClassifier, TaskGraphBuilder, ToolDecision,
    };
    pub use crate::platform::{LabelingPlatform, PlatformError, ProjectSummary};
    pub use crate::store::{ResultRef, ResultStore, StoreError};
    pub use crate::types::{
        InputBinding, Instruction, Plan, PlanValidationError, Task, TaskError, TaskErrorKind,
        TaskId, TaskStatus,
    };
}

pub use adapter::{CapabilityAdapter, CapabilityTransport, InvokeError};
pub use capability::{CapabilityDescriptor, CapabilityRegistry, RegistryError};
pub use executor::{Orchestrator, PlanOutcome, PlanResult, RetryPolicy};
pub use mapper::{AnnotationRecord, SchemaMapper, TaskType};
pub use planner::{BuildError, TaskGraphBuilder};
pub use store::{ResultRef, ResultStore, StoreError};
pub use types::{Instruction, Plan, Task, TaskId, TaskStatus};
