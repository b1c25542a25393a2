use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::TaskId;

const MAX_SUMMARY_CHARS: usize = 512;

/// Observable orchestration transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditPhase {
    PlanStarted,
    TaskReady,
    TaskDispatched,
    TaskRetrying,
    TaskSucceeded,
    TaskFailed,
    TaskSkipped,
    TaskCancelled,
    ResultDiscarded,
    PlanFinished,
}

/// One audit record. `summary` never holds a payload, only references and
/// bounded previews.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub run_id: String,
    pub phase: AuditPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default)]
    pub summary: String,
    pub at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(run_id: impl Into<String>, phase: AuditPhase) -> Self {
        Self {
            run_id: run_id.into(),
            phase,
            task_id: None,
            capability: None,
            attempt: 0,
            summary: String::new(),
            at: Utc::now(),
        }
    }

    pub fn for_task(mut self, task_id: &TaskId, capability: &str, attempt: u32) -> Self {
        self.task_id = Some(task_id.clone());
        self.capability = Some(capability.to_string());
        self.attempt = attempt;
        self
    }

    pub fn with_summary(mut self, summary: impl AsRef<str>) -> Self {
        self.summary = truncate_for_log(summary.as_ref(), MAX_SUMMARY_CHARS);
        self
    }
}

/// Sink interface for the orchestration audit trail.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent) -> Result<(), String>;
}

pub(crate) fn truncate_for_log(input: &str, max_chars: usize) -> String {
    let char_count = input.chars().count();
    if char_count <= max_chars {
        return input.to_string();
    }
    let mut preview: String = input.chars().take(max_chars).collect();
    preview.push_str(&format!("... [truncated, total_chars={}]", char_count));
    preview
}
