//! Instruction to labeling-platform pipeline.
//!
//! build plan -> execute DAG -> map final output -> export -> discard run.
//! Once the plan has executed, a report always comes back: failed branches
//! stay listed, and a mapping or export failure is carried in the report
//! next to the task results. The record is built from whatever succeeded
//! and never padded with defaults.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use labelaudio_core::capability::artifacts;
use labelaudio_core::executor::{ExecuteError, Orchestrator, PlanResult, TaskReport};
use labelaudio_core::mapper::{
    map_analysis, normalize_analysis, AnalysisArtifacts, AnalysisResult, AnnotationRecord, MapError,
    TaskType,
};
use labelaudio_core::planner::{extract_parameters, BuildError, TaskGraphBuilder};
use labelaudio_core::platform::{LabelingPlatform, PlatformError};
use labelaudio_core::types::{InputBinding, Instruction, Plan, TaskStatus};

/// Failures that leave no plan result to report.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("plan build failed: {0}")]
    Build(#[from] BuildError),
    #[error("plan execution failed: {0}")]
    Execute(#[from] ExecuteError),
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub default_task_type: TaskType,
    pub project_title: String,
    pub discard_after_run: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            default_task_type: TaskType::Speech,
            project_title: "Audio annotation".to_string(),
            discard_after_run: true,
        }
    }
}

/// Where the record landed on the labeling platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportReceipt {
    pub project_id: u64,
    pub task_id: u64,
    /// False when an existing project with the same title was reused.
    pub project_created: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub plan: Plan,
    pub result: PlanResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<AnnotationRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label_config: Option<String>,
    /// Why no record could be built from the succeeded outputs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub export: Option<ExportReceipt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub export_error: Option<String>,
    /// Stored outputs dropped after the run.
    pub discarded: usize,
}

impl PipelineReport {
    pub fn run_id(&self) -> &str {
        &self.result.run_id
    }

    /// Every task succeeded and the mapping and export steps that ran did too.
    pub fn is_complete(&self) -> bool {
        self.result.is_success() && self.record_error.is_none() && self.export_error.is_none()
    }
}

pub struct Pipeline {
    builder: TaskGraphBuilder,
    orchestrator: Orchestrator,
    platform: Option<Arc<dyn LabelingPlatform>>,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn new(builder: TaskGraphBuilder, orchestrator: Orchestrator, options: PipelineOptions) -> Self {
        Self {
            builder,
            orchestrator,
            platform: None,
            options,
        }
    }

    pub fn with_platform(mut self, platform: Arc<dyn LabelingPlatform>) -> Self {
        self.platform = Some(platform);
        self
    }

    pub fn builder(&self) -> &TaskGraphBuilder {
        &self.builder
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    pub async fn plan(&self, instruction: &Instruction) -> Result<Plan, BuildError> {
        self.builder.build(instruction).await
    }

    /// Run one instruction end to end.
    ///
    /// Errors only when no plan could be built or executed. The run's stored
    /// outputs are discarded afterwards when configured, whether or not
    /// mapping and export succeeded.
    pub async fn run(
        &self,
        instruction: &Instruction,
        cancel: CancellationToken,
    ) -> Result<PipelineReport, PipelineError> {
        let plan = self.plan(instruction).await?;
        let result = self
            .orchestrator
            .execute_with_cancel(plan.clone(), cancel)
            .await?;
        let run_id = result.run_id.clone();

        let mut report = self.finish(instruction, plan, result).await;

        if self.options.discard_after_run {
            match self.orchestrator.discard(&run_id).await {
                Ok(count) => report.discarded = count,
                Err(err) => {
                    tracing::warn!(run_id = %run_id, error = %err, "failed to discard run outputs");
                }
            }
        }
        Ok(report)
    }

    async fn finish(&self, instruction: &Instruction, plan: Plan, result: PlanResult) -> PipelineReport {
        for failure in result.failures() {
            tracing::warn!(
                run_id = %result.run_id,
                task_id = %failure.id,
                capability = %failure.capability,
                error = ?failure.error.as_ref().map(|e| e.message.as_str()),
                "task did not succeed"
            );
        }

        let mut report = PipelineReport {
            plan,
            result,
            record: None,
            label_config: None,
            record_error: None,
            export: None,
            export_error: None,
            discarded: 0,
        };
        if report.result.cancelled {
            return report;
        }

        match self.collect_record(instruction, &report.plan, &report.result).await {
            Ok(record) => {
                report.label_config = record.as_ref().map(AnnotationRecord::label_config);
                report.record = record;
            }
            Err(err) => {
                tracing::error!(run_id = %report.result.run_id, error = %err, "annotation mapping failed");
                report.record_error = Some(err.to_string());
            }
        }

        if let (Some(platform), Some(record), Some(xml)) =
            (&self.platform, &report.record, &report.label_config)
        {
            let title = instruction
                .hint("project_title")
                .cloned()
                .or_else(|| extract_parameters(&instruction.text).remove("project_title"))
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| self.options.project_title.clone());
            match self.export(platform.as_ref(), &title, xml, record).await {
                Ok(receipt) => report.export = Some(receipt),
                Err(err) => {
                    tracing::error!(run_id = %report.result.run_id, error = %err, "export failed");
                    report.export_error = Some(err.to_string());
                }
            }
        }

        tracing::info!(
            run_id = %report.result.run_id,
            outcome = ?report.result.outcome,
            mapped = report.record.is_some(),
            exported = report.export.is_some(),
            "pipeline finished"
        );
        report
    }

    /// Use an annotation record produced inside the plan when there is one;
    /// otherwise normalize and map the analysis artifacts that succeeded.
    async fn collect_record(
        &self,
        instruction: &Instruction,
        plan: &Plan,
        result: &PlanResult,
    ) -> Result<Option<AnnotationRecord>, MapError> {
        let store = self.orchestrator.store();
        let registry = self.orchestrator.registry();
        let mut collected = AnalysisArtifacts::default();
        let mut keyword_hits = Vec::new();
        let mut normalized = None;
        let mut found_any = false;

        for report in succeeded(result) {
            let Some(reference) = &report.output_ref else {
                continue;
            };
            let produces = registry
                .lookup(&report.capability)
                .ok()
                .and_then(|d| d.produces.clone());
            let Some(artifact) = produces else {
                continue;
            };
            let payload = store.get(reference).await?;
            found_any = true;
            match artifact.as_str() {
                artifacts::ANNOTATION_RECORD => {
                    let raw = payload.get("record").cloned().unwrap_or(payload);
                    let record: AnnotationRecord = serde_json::from_value(raw)
                        .map_err(|e| MapError::MalformedAnalysis(e.to_string()))?;
                    return Ok(Some(record));
                }
                artifacts::ANALYSIS => normalized = Some(payload),
                artifacts::TRANSCRIPT => collected.transcript = Some(payload),
                artifacts::DIARIZATION => collected.diarization = Some(payload),
                artifacts::AUDIO_EVENTS => collected.events = Some(payload),
                artifacts::SPEAKER_ANALYSIS => collected.speaker_analysis = Some(payload),
                artifacts::KEYWORD_HITS => keyword_hits.push(payload),
                other => {
                    tracing::debug!(artifact = %other, "artifact not used for annotation");
                }
            }
        }
        if !found_any {
            return Ok(None);
        }
        if !keyword_hits.is_empty() {
            collected.keyword_hits = Some(Value::Array(keyword_hits));
        }

        let task_type = match plan_literal(instruction, plan, "task_type") {
            Some(raw) => raw.parse::<TaskType>()?,
            None => self.options.default_task_type,
        };
        let analysis = match normalized {
            Some(payload) => serde_json::from_value::<AnalysisResult>(payload)
                .map_err(|e| MapError::MalformedAnalysis(e.to_string()))?,
            None => {
                let audio_url = plan_literal(instruction, plan, "audio_url").unwrap_or_default();
                normalize_analysis(&audio_url, &collected)?
            }
        };
        Ok(Some(map_analysis(task_type, &analysis)?))
    }

    /// Reuse a project with the same title when one exists, else create it;
    /// then import the record. Each call goes through the retry policy.
    async fn export(
        &self,
        platform: &dyn LabelingPlatform,
        title: &str,
        label_config: &str,
        record: &AnnotationRecord,
    ) -> Result<ExportReceipt, PlatformError> {
        let retry = self.orchestrator.retry_policy();
        let existing = retry
            .run(|_| platform.find_project(title), PlatformError::is_retryable)
            .await?;
        let (project_id, project_created) = match existing {
            Some(id) => {
                tracing::info!(project_id = id, title = %title, "reusing labeling project");
                (id, false)
            }
            None => {
                retry
                    .run(
                        |attempt| async move {
                            // A create that timed out may still have landed.
                            if attempt > 1 {
                                if let Some(id) = platform.find_project(title).await? {
                                    return Ok((id, false));
                                }
                            }
                            platform.create_project(title, label_config).await.map(|id| (id, true))
                        },
                        PlatformError::is_retryable,
                    )
                    .await?
            }
        };
        let task_id = retry
            .run(
                |_| platform.import_task(project_id, record),
                PlatformError::is_retryable,
            )
            .await?;
        Ok(ExportReceipt {
            project_id,
            task_id,
            project_created,
        })
    }
}

fn succeeded(result: &PlanResult) -> impl Iterator<Item = &TaskReport> {
    result
        .tasks
        .iter()
        .filter(|task| task.status == TaskStatus::Succeeded)
}

/// A string parameter from the instruction hints, else from the first task
/// that bound it literally.
fn plan_literal(instruction: &Instruction, plan: &Plan, name: &str) -> Option<String> {
    if let Some(value) = instruction.hint(name).and_then(Value::as_str) {
        return Some(value.to_string());
    }
    plan.tasks.iter().find_map(|task| match task.inputs.get(name) {
        Some(InputBinding::Literal(Value::String(value))) => Some(value.clone()),
        _ => None,
    })
}
