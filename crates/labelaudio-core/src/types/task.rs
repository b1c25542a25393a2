//! Task type definitions
//!
//! A task is one capability invocation inside a plan. Its status is only
//! ever advanced by the orchestrator.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::store::ResultRef;

/// Strongly-typed task ID, unique within a plan.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<&TaskId> for TaskId {
    fn from(value: &TaskId) -> Self {
        value.clone()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl AsRef<str> for TaskId {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl PartialEq<&str> for TaskId {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

/// Task lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    /// Waiting for a backoff timer before the next attempt.
    Retrying,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Retrying => "retrying",
        };
        f.write_str(label)
    }
}

/// Where a task input comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputBinding {
    /// A value fixed at plan-build time.
    Literal(Value),
    /// The `output_ref` of another task in the same plan.
    Reference { task: TaskId },
}

impl InputBinding {
    pub fn literal(value: impl Into<Value>) -> Self {
        Self::Literal(value.into())
    }

    pub fn reference(task: impl Into<TaskId>) -> Self {
        Self::Reference { task: task.into() }
    }

    pub fn referenced_task(&self) -> Option<&TaskId> {
        match self {
            InputBinding::Reference { task } => Some(task),
            InputBinding::Literal(_) => None,
        }
    }
}

/// Failure classes recorded on a failed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    SchemaViolation,
    Transport,
    Capability,
    ReferenceNotFound,
    /// The result store rejected the output.
    Storage,
    UnknownCapability,
    /// Never dispatched because a producer upstream failed.
    UpstreamFailed,
    Cancelled,
}

impl fmt::Display for TaskErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskErrorKind::SchemaViolation => "schema_violation",
            TaskErrorKind::Transport => "transport_error",
            TaskErrorKind::Capability => "capability_error",
            TaskErrorKind::ReferenceNotFound => "reference_not_found",
            TaskErrorKind::Storage => "storage_error",
            TaskErrorKind::UnknownCapability => "unknown_capability",
            TaskErrorKind::UpstreamFailed => "upstream_failed",
            TaskErrorKind::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Error attached to a failed task.
///
/// `root_cause` names the task whose own failure caused this one. For a
/// task that failed by itself it is the task's own id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: TaskErrorKind,
    pub message: String,
    pub root_cause: TaskId,
}

impl TaskError {
    pub fn new(kind: TaskErrorKind, message: impl Into<String>, root_cause: impl Into<TaskId>) -> Self {
        Self {
            kind,
            message: message.into(),
            root_cause: root_cause.into(),
        }
    }
}

/// One bound capability invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub capability: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, InputBinding>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_ref: Option<ResultRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    #[serde(default)]
    pub attempts: u32,
}

impl Task {
    pub fn new(id: impl Into<TaskId>, capability: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            capability: capability.into(),
            inputs: BTreeMap::new(),
            status: TaskStatus::Pending,
            output_ref: None,
            error: None,
            attempts: 0,
        }
    }

    pub fn with_literal(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.inputs.insert(name.into(), InputBinding::literal(value));
        self
    }

    pub fn with_reference(mut self, name: impl Into<String>, task: impl Into<TaskId>) -> Self {
        self.inputs.insert(name.into(), InputBinding::reference(task));
        self
    }

    /// Producer tasks this task consumes, deduplicated, in parameter order.
    pub fn dependencies(&self) -> Vec<TaskId> {
        let mut out: Vec<TaskId> = Vec::new();
        for binding in self.inputs.values() {
            if let Some(task) = binding.referenced_task() {
                if !out.contains(task) {
                    out.push(task.clone());
                }
            }
        }
        out
    }

    pub fn is_root(&self) -> bool {
        self.inputs
            .values()
            .all(|binding| binding.referenced_task().is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dependencies_are_deduplicated() {
        let task = Task::new("annotate", "annotate_audio")
            .with_reference("transcript", "t1")
            .with_reference("transcript_copy", "t1")
            .with_reference("events", "t2")
            .with_literal("task_type", "speech");
        let deps = task.dependencies();
        assert_eq!(deps.len(), 2);
        assert!(deps.contains(&TaskId::from("t1")));
        assert!(deps.contains(&TaskId::from("t2")));
        assert!(!task.is_root());
    }

    #[test]
    fn test_binding_serialization_shape() {
        let task = Task::new("t1", "transcribe_audio")
            .with_literal("audio_url", "https://example.com/a.wav")
            .with_reference("source", "t0");
        let value = serde_json::to_value(&task).expect("serialize");
        assert_eq!(
            value["inputs"]["audio_url"],
            json!({"literal": "https://example.com/a.wav"})
        );
        assert_eq!(value["inputs"]["source"], json!({"reference": {"task": "t0"}}));
        assert_eq!(value["status"], json!("pending"));
    }

    #[test]
    fn test_terminal_states() {
        assert!(TaskStatus::Succeeded.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Retrying.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }
}
