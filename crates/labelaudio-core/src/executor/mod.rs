//! Orchestrator
//!
//! Executes a plan as a DAG. A single coordinating loop tracks task state
//! and dispatches every ready task; the capability calls themselves run
//! concurrently, bounded by a semaphore. A task only counts as running
//! once its call holds a permit. Outputs move along edges as
//! [`ResultRef`] handles only.

mod audit;
mod retry;

pub use audit::{AuditEvent, AuditPhase, AuditSink};
pub use retry::RetryPolicy;

pub(crate) use audit::truncate_for_log;

use chrono::{DateTime, Utc};
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::adapter::{CallContext, CapabilityAdapter, CapabilityOutput, InvokeError};
use crate::capability::{CapabilityDescriptor, CapabilityRegistry};
use crate::store::{ResultRef, ResultStore, StoreError};
use crate::types::{
    InputBinding, Plan, PlanValidationError, Task, TaskError, TaskErrorKind, TaskId, TaskStatus,
};

pub const DEFAULT_MAX_IN_FLIGHT: usize = 4;
const MAX_LOG_JSON_CHARS: usize = 2_000;

/// Errors that prevent a plan from being executed at all.
#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error("invalid plan: {0}")]
    InvalidPlan(#[from] PlanValidationError),
}

/// Terminal classification of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanOutcome {
    Succeeded,
    PartiallySucceeded,
    Failed,
}

/// Final state of one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub id: TaskId,
    pub capability: String,
    pub status: TaskStatus,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_ref: Option<ResultRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
}

impl From<&Task> for TaskReport {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            capability: task.capability.clone(),
            status: task.status,
            attempts: task.attempts,
            output_ref: task.output_ref.clone(),
            error: task.error.clone(),
        }
    }
}

/// Aggregated result of executing a plan.
///
/// Failed branches are listed explicitly; their outputs are absent, never
/// defaulted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanResult {
    pub run_id: String,
    pub outcome: PlanOutcome,
    pub cancelled: bool,
    pub tasks: Vec<TaskReport>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl PlanResult {
    pub fn task(&self, id: &TaskId) -> Option<&TaskReport> {
        self.tasks.iter().find(|task| &task.id == id)
    }

    pub fn output(&self, id: &TaskId) -> Option<&ResultRef> {
        self.task(id).and_then(|task| task.output_ref.as_ref())
    }

    /// References of every succeeded task.
    pub fn outputs(&self) -> BTreeMap<TaskId, ResultRef> {
        self.tasks
            .iter()
            .filter_map(|task| task.output_ref.clone().map(|r| (task.id.clone(), r)))
            .collect()
    }

    pub fn failures(&self) -> Vec<&TaskReport> {
        self.tasks
            .iter()
            .filter(|task| task.status == TaskStatus::Failed)
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.outcome == PlanOutcome::Succeeded
    }

    /// Last succeeded task in plan order, the natural final output.
    pub fn final_output(&self) -> Option<&ResultRef> {
        self.tasks
            .iter()
            .rev()
            .find_map(|task| task.output_ref.as_ref())
    }
}

type AttemptFuture = Pin<Box<dyn Future<Output = AttemptOutcome> + Send>>;

struct AttemptOutcome {
    descriptor: Arc<CapabilityDescriptor>,
    task_id: TaskId,
    attempt: u32,
    arguments: Value,
    result: AttemptResult,
    /// Held until the coordinating loop has recorded the outcome.
    permit: Option<OwnedSemaphorePermit>,
}

impl AttemptOutcome {
    fn cancelled(
        descriptor: Arc<CapabilityDescriptor>,
        task_id: TaskId,
        attempt: u32,
        arguments: Value,
    ) -> Self {
        Self {
            descriptor,
            task_id,
            attempt,
            arguments,
            result: AttemptResult::Cancelled,
            permit: None,
        }
    }
}

/// Sent by an attempt once it holds a concurrency permit.
struct Admission {
    task_id: TaskId,
    capability: String,
    attempt: u32,
    summary: String,
}

/// Shared by every attempt of one run.
#[derive(Clone)]
struct RunControl {
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    admitted: mpsc::UnboundedSender<Admission>,
}

enum AttemptResult {
    Finished(Result<CapabilityOutput, InvokeError>),
    /// Cancelled while waiting for backoff or admission; never called.
    Cancelled,
}

struct RunState {
    run_id: String,
    tasks: Vec<Task>,
    index: HashMap<TaskId, usize>,
    /// Every task transitively downstream of each task.
    downstream: HashMap<TaskId, Vec<TaskId>>,
}

impl RunState {
    fn new(plan: Plan) -> Self {
        let downstream = plan
            .tasks
            .iter()
            .map(|task| (task.id.clone(), plan.transitive_dependents(&task.id)))
            .collect();
        let mut tasks = plan.tasks;
        for task in &mut tasks {
            task.status = TaskStatus::Pending;
            task.output_ref = None;
            task.error = None;
            task.attempts = 0;
        }
        let index = tasks
            .iter()
            .enumerate()
            .map(|(idx, task)| (task.id.clone(), idx))
            .collect();
        Self {
            run_id: plan.run_id,
            tasks,
            index,
            downstream,
        }
    }

    fn task(&self, id: &TaskId) -> Option<&Task> {
        self.index.get(id).and_then(|idx| self.tasks.get(*idx))
    }

    fn task_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        match self.index.get(id) {
            Some(idx) => self.tasks.get_mut(*idx),
            None => None,
        }
    }

    fn status(&self, id: &TaskId) -> Option<TaskStatus> {
        self.task(id).map(|task| task.status)
    }

    /// Pending tasks whose producers have all succeeded.
    fn newly_ready(&self) -> Vec<TaskId> {
        self.tasks
            .iter()
            .filter(|task| task.status == TaskStatus::Pending)
            .filter(|task| {
                task.dependencies()
                    .iter()
                    .all(|dep| self.status(dep) == Some(TaskStatus::Succeeded))
            })
            .map(|task| task.id.clone())
            .collect()
    }

    /// Downstream tasks of `id` that have not reached a terminal state.
    fn open_dependents(&self, id: &TaskId) -> Vec<TaskId> {
        let mut open: Vec<TaskId> = self
            .downstream
            .get(id)
            .into_iter()
            .flatten()
            .filter(|dep| self.status(dep).is_some_and(|status| !status.is_terminal()))
            .cloned()
            .collect();
        open.sort_by_key(|dep| self.index.get(dep).copied().unwrap_or(usize::MAX));
        open
    }

    /// Bind literals and producer references into the call arguments.
    fn resolve_arguments(&self, task: &Task) -> Result<Value, TaskError> {
        let mut arguments = Map::new();
        for (name, binding) in &task.inputs {
            let value = match binding {
                InputBinding::Literal(value) => value.clone(),
                InputBinding::Reference { task: producer } => {
                    let reference = self
                        .task(producer)
                        .and_then(|p| p.output_ref.as_ref())
                        .ok_or_else(|| {
                            TaskError::new(
                                TaskErrorKind::ReferenceNotFound,
                                format!("producer '{}' has no output reference", producer),
                                task.id.clone(),
                            )
                        })?;
                    reference.to_value()
                }
            };
            arguments.insert(name.clone(), value);
        }
        Ok(Value::Object(arguments))
    }

    fn outcome(&self) -> PlanOutcome {
        let succeeded = self
            .tasks
            .iter()
            .filter(|task| task.status == TaskStatus::Succeeded)
            .count();
        if succeeded == self.tasks.len() {
            PlanOutcome::Succeeded
        } else if succeeded > 0 {
            PlanOutcome::PartiallySucceeded
        } else {
            PlanOutcome::Failed
        }
    }
}

/// DAG executor over registered capabilities.
pub struct Orchestrator {
    registry: Arc<CapabilityRegistry>,
    adapter: Arc<CapabilityAdapter>,
    retry: RetryPolicy,
    max_in_flight: usize,
    audit: Option<Arc<dyn AuditSink>>,
}

impl Orchestrator {
    pub fn new(registry: Arc<CapabilityRegistry>, adapter: Arc<CapabilityAdapter>) -> Self {
        Self {
            registry,
            adapter,
            retry: RetryPolicy::default(),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            audit: None,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Upper bound on concurrent capability calls.
    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max.max(1);
        self
    }

    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn store(&self) -> &Arc<dyn ResultStore> {
        self.adapter.store()
    }

    /// Execute a plan to completion.
    pub async fn execute(&self, plan: Plan) -> Result<PlanResult, ExecuteError> {
        self.execute_with_cancel(plan, CancellationToken::new()).await
    }

    /// Execute a plan until it completes or `cancel` fires.
    pub async fn execute_with_cancel(
        &self,
        plan: Plan,
        cancel: CancellationToken,
    ) -> Result<PlanResult, ExecuteError> {
        plan.validate()?;
        let started_at = Utc::now();
        let mut state = RunState::new(plan);
        let (admitted, mut admissions) = mpsc::unbounded_channel();
        let control = RunControl {
            semaphore: Arc::new(Semaphore::new(self.max_in_flight)),
            cancel: cancel.clone(),
            admitted,
        };
        let mut in_flight: FuturesUnordered<AttemptFuture> = FuturesUnordered::new();
        let mut cancelled = false;

        tracing::info!(
            run_id = %state.run_id,
            tasks = state.tasks.len(),
            max_in_flight = self.max_in_flight,
            "plan execution started"
        );
        self.emit(
            AuditEvent::new(&state.run_id, AuditPhase::PlanStarted)
                .with_summary(format!("{} tasks", state.tasks.len())),
        )
        .await;

        loop {
            if !cancelled && cancel.is_cancelled() {
                cancelled = true;
                self.cancel_waiting(&mut state).await;
            }
            if !cancelled {
                for task_id in state.newly_ready() {
                    if let Some(future) = self
                        .dispatch(&mut state, &task_id, &control)
                        .await
                    {
                        in_flight.push(future);
                    }
                }
            }
            if in_flight.is_empty() {
                break;
            }
            tokio::select! {
                biased;
                Some(admission) = admissions.recv() => {
                    self.mark_running(&mut state, admission).await;
                }
                _ = cancel.cancelled(), if !cancelled => {}
                Some(mut outcome) = in_flight.next() => {
                    // An attempt admits itself before it finishes.
                    while let Ok(admission) = admissions.try_recv() {
                        self.mark_running(&mut state, admission).await;
                    }
                    let permit = outcome.permit.take();
                    if let Some(next) = self
                        .handle_outcome(&mut state, outcome, cancelled, &control)
                        .await
                    {
                        in_flight.push(next);
                    }
                    drop(permit);
                }
                else => break,
            }
        }

        let outcome = state.outcome();
        let result = PlanResult {
            run_id: state.run_id.clone(),
            outcome,
            cancelled,
            tasks: state.tasks.iter().map(TaskReport::from).collect(),
            started_at,
            finished_at: Utc::now(),
        };
        tracing::info!(
            run_id = %result.run_id,
            outcome = ?result.outcome,
            cancelled,
            failed = result.failures().len(),
            "plan execution finished"
        );
        self.emit(
            AuditEvent::new(&result.run_id, AuditPhase::PlanFinished)
                .with_summary(format!("{:?}, cancelled={}", outcome, cancelled)),
        )
        .await;
        Ok(result)
    }

    /// Drop every stored output of a run. References into it stop resolving.
    pub async fn discard(&self, run_id: &str) -> Result<usize, StoreError> {
        let removed = self.adapter.store().purge_run(run_id).await?;
        tracing::debug!(run_id, removed, "run outputs discarded");
        Ok(removed)
    }

    async fn dispatch(
        &self,
        state: &mut RunState,
        task_id: &TaskId,
        control: &RunControl,
    ) -> Option<AttemptFuture> {
        let task = state.task(task_id)?.clone();
        let descriptor = match self.registry.lookup(&task.capability) {
            Ok(descriptor) => descriptor,
            Err(err) => {
                let error = TaskError::new(TaskErrorKind::UnknownCapability, err.to_string(), task_id);
                self.fail_and_short_circuit(state, task_id, error).await;
                return None;
            }
        };
        let arguments = match state.resolve_arguments(&task) {
            Ok(arguments) => arguments,
            Err(error) => {
                self.fail_and_short_circuit(state, task_id, error).await;
                return None;
            }
        };

        self.set_status(state, task_id, TaskStatus::Ready);
        self.emit(
            AuditEvent::new(&state.run_id, AuditPhase::TaskReady).for_task(task_id, &task.capability, 0),
        )
        .await;

        if let Some(task) = state.task_mut(task_id) {
            task.attempts = 1;
        }

        Some(self.attempt(
            descriptor,
            state.run_id.clone(),
            task_id.clone(),
            1,
            arguments,
            Duration::ZERO,
            control.clone(),
        ))
    }

    /// Record that an attempt got a permit and is calling its provider.
    async fn mark_running(&self, state: &mut RunState, admission: Admission) {
        let Admission {
            task_id,
            capability,
            attempt,
            summary,
        } = admission;
        if !matches!(
            state.status(&task_id),
            Some(TaskStatus::Ready | TaskStatus::Retrying)
        ) {
            return;
        }
        self.set_status(state, &task_id, TaskStatus::Running);
        tracing::info!(
            run_id = %state.run_id,
            task_id = %task_id,
            capability = %capability,
            attempt,
            "task dispatched"
        );
        tracing::debug!(task_id = %task_id, arguments = %summary, "task arguments");
        self.emit(
            AuditEvent::new(&state.run_id, AuditPhase::TaskDispatched)
                .for_task(&task_id, &capability, attempt)
                .with_summary(&summary),
        )
        .await;
    }

    #[allow(clippy::too_many_arguments)]
    fn attempt(
        &self,
        descriptor: Arc<CapabilityDescriptor>,
        run_id: String,
        task_id: TaskId,
        attempt: u32,
        arguments: Value,
        delay: Duration,
        control: RunControl,
    ) -> AttemptFuture {
        let adapter = self.adapter.clone();
        let summary = truncate_for_log(&arguments.to_string(), MAX_LOG_JSON_CHARS);
        Box::pin(async move {
            let RunControl {
                semaphore,
                cancel,
                admitted,
            } = control;
            if !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        return AttemptOutcome::cancelled(descriptor, task_id, attempt, arguments);
                    }
                }
            }
            let permit = tokio::select! {
                permit = semaphore.acquire_owned() => permit,
                _ = cancel.cancelled() => {
                    return AttemptOutcome::cancelled(descriptor, task_id, attempt, arguments);
                }
            };
            let Ok(permit) = permit else {
                return AttemptOutcome::cancelled(descriptor, task_id, attempt, arguments);
            };
            let _ = admitted.send(Admission {
                task_id: task_id.clone(),
                capability: descriptor.name.clone(),
                attempt,
                summary,
            });
            let context = CallContext::new(run_id).with_task(task_id.clone(), attempt);
            let result = adapter.invoke(&descriptor, arguments.clone(), context).await;
            AttemptOutcome {
                descriptor,
                task_id,
                attempt,
                arguments,
                result: AttemptResult::Finished(result),
                permit: Some(permit),
            }
        })
    }

    async fn handle_outcome(
        &self,
        state: &mut RunState,
        outcome: AttemptOutcome,
        cancelled: bool,
        control: &RunControl,
    ) -> Option<AttemptFuture> {
        let AttemptOutcome {
            descriptor,
            task_id,
            attempt,
            arguments,
            result,
            ..
        } = outcome;
        let capability = descriptor.name.clone();

        let result = match result {
            AttemptResult::Cancelled => {
                let error = TaskError::new(
                    TaskErrorKind::Cancelled,
                    "plan cancelled before the task was called",
                    task_id.clone(),
                );
                self.fail(state, &task_id, error, AuditPhase::TaskCancelled).await;
                return None;
            }
            AttemptResult::Finished(result) => result,
        };

        match result {
            Ok(output) if cancelled => {
                if let CapabilityOutput::Stored(reference) = &output {
                    if let Err(err) = self.adapter.store().delete(reference).await {
                        tracing::warn!(task_id = %task_id, error = %err, "failed to drop discarded output");
                    }
                }
                let error = TaskError::new(
                    TaskErrorKind::Cancelled,
                    "result discarded after plan cancellation",
                    task_id.clone(),
                );
                self.fail(state, &task_id, error, AuditPhase::ResultDiscarded).await;
                None
            }
            Ok(output) => {
                match self.to_reference(&state.run_id, output).await {
                    Ok(reference) => {
                        tracing::info!(
                            run_id = %state.run_id,
                            task_id = %task_id,
                            capability = %capability,
                            attempt,
                            output = %reference.summary(),
                            "task succeeded"
                        );
                        self.emit(
                            AuditEvent::new(&state.run_id, AuditPhase::TaskSucceeded)
                                .for_task(&task_id, &capability, attempt)
                                .with_summary(reference.summary()),
                        )
                        .await;
                        if let Some(task) = state.task_mut(&task_id) {
                            task.status = TaskStatus::Succeeded;
                            task.output_ref = Some(reference);
                        }
                    }
                    Err(err) => {
                        let kind = match err {
                            StoreError::ReferenceNotFound(_) => TaskErrorKind::ReferenceNotFound,
                            _ => TaskErrorKind::Storage,
                        };
                        let error = TaskError::new(kind, err.to_string(), task_id.clone());
                        self.fail_and_short_circuit(state, &task_id, error).await;
                    }
                }
                None
            }
            Err(err) if !cancelled && err.is_retryable() && self.retry.allows_retry(attempt) => {
                let delay = self.retry.backoff(attempt - 1);
                let next_attempt = attempt + 1;
                tracing::warn!(
                    run_id = %state.run_id,
                    task_id = %task_id,
                    capability = %capability,
                    attempt,
                    next_attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "task attempt failed, retrying"
                );
                self.emit(
                    AuditEvent::new(&state.run_id, AuditPhase::TaskRetrying)
                        .for_task(&task_id, &capability, attempt)
                        .with_summary(format!("{}; next attempt in {}ms", err, delay.as_millis())),
                )
                .await;
                if let Some(task) = state.task_mut(&task_id) {
                    task.status = TaskStatus::Retrying;
                    task.attempts = next_attempt;
                }
                Some(self.attempt(
                    descriptor,
                    state.run_id.clone(),
                    task_id,
                    next_attempt,
                    arguments,
                    delay,
                    control.clone(),
                ))
            }
            Err(err) => {
                let kind = error_kind(&err);
                let message = if err.is_retryable() {
                    format!("{} (gave up after {} attempts)", err, attempt)
                } else {
                    err.to_string()
                };
                let error = TaskError::new(kind, message, task_id.clone());
                self.fail_and_short_circuit(state, &task_id, error).await;
                None
            }
        }
    }

    async fn to_reference(
        &self,
        run_id: &str,
        output: CapabilityOutput,
    ) -> Result<ResultRef, StoreError> {
        match output {
            CapabilityOutput::Stored(reference) => Ok(reference),
            CapabilityOutput::Inline {
                payload,
                content_type,
                ..
            } => self.adapter.store().put(run_id, &payload, &content_type).await,
        }
    }

    async fn fail(
        &self,
        state: &mut RunState,
        task_id: &TaskId,
        error: TaskError,
        phase: AuditPhase,
    ) {
        let Some(task) = state.task_mut(task_id) else {
            return;
        };
        task.status = TaskStatus::Failed;
        task.error = Some(error.clone());
        let capability = task.capability.clone();
        let attempts = task.attempts;
        tracing::error!(
            run_id = %state.run_id,
            task_id = %task_id,
            capability = %capability,
            kind = %error.kind,
            root_cause = %error.root_cause,
            "task failed: {}",
            error.message
        );
        self.emit(
            AuditEvent::new(&state.run_id, phase)
                .for_task(task_id, &capability, attempts)
                .with_summary(format!("{}: {}", error.kind, error.message)),
        )
        .await;
    }

    /// Fail a task and every open task downstream of it.
    async fn fail_and_short_circuit(&self, state: &mut RunState, task_id: &TaskId, error: TaskError) {
        let reason = error.message.clone();
        self.fail(state, task_id, error, AuditPhase::TaskFailed).await;
        for dependent in state.open_dependents(task_id) {
            let skipped = TaskError::new(
                TaskErrorKind::UpstreamFailed,
                format!("upstream task '{}' failed: {}", task_id, reason),
                task_id.clone(),
            );
            self.fail(state, &dependent, skipped, AuditPhase::TaskSkipped).await;
        }
    }

    async fn cancel_waiting(&self, state: &mut RunState) {
        tracing::warn!(run_id = %state.run_id, "plan cancelled");
        let waiting: Vec<TaskId> = state
            .tasks
            .iter()
            // Ready and retrying tasks have an attempt in flight that reports
            // its own cancellation.
            .filter(|task| task.status == TaskStatus::Pending)
            .map(|task| task.id.clone())
            .collect();
        for task_id in waiting {
            let error = TaskError::new(TaskErrorKind::Cancelled, "plan cancelled", task_id.clone());
            self.fail(state, &task_id, error, AuditPhase::TaskCancelled).await;
        }
    }

    fn set_status(&self, state: &mut RunState, task_id: &TaskId, status: TaskStatus) {
        if let Some(task) = state.task_mut(task_id) {
            task.status = status;
        }
    }

    async fn emit(&self, event: AuditEvent) {
        if let Some(sink) = &self.audit {
            if let Err(err) = sink.record(event).await {
                tracing::warn!("failed to record audit event: {}", err);
            }
        }
    }
}

fn error_kind(err: &InvokeError) -> TaskErrorKind {
    match err {
        InvokeError::SchemaViolation { .. } => TaskErrorKind::SchemaViolation,
        InvokeError::Transport { .. } => TaskErrorKind::Transport,
        InvokeError::Capability { .. } => TaskErrorKind::Capability,
        InvokeError::UnknownTransport(_) => TaskErrorKind::UnknownCapability,
        InvokeError::Store(StoreError::ReferenceNotFound(_)) => TaskErrorKind::ReferenceNotFound,
        InvokeError::Store(_) => TaskErrorKind::Storage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{ProviderError, TransportFailure};
    use crate::capability::TransportHandle;
    use crate::testing::{MemoryStore, ScriptedTransport, Step};
    use serde_json::json;
    use std::sync::Mutex;

    struct Harness {
        orchestrator: Orchestrator,
        transport: Arc<ScriptedTransport>,
        store: Arc<MemoryStore>,
    }

    fn harness(transport: ScriptedTransport, capabilities: &[&str]) -> Harness {
        let mut registry = CapabilityRegistry::new();
        for name in capabilities {
            registry
                .register(CapabilityDescriptor::new(*name, TransportHandle::local("scripted")))
                .expect("register");
        }
        let transport = Arc::new(transport);
        let store = Arc::new(MemoryStore::default());
        let adapter = CapabilityAdapter::new(store.clone()).with_transport(transport.clone());
        let orchestrator = Orchestrator::new(Arc::new(registry), Arc::new(adapter))
            .with_retry_policy(RetryPolicy::new(
                3,
                Duration::from_millis(10),
                Duration::from_millis(100),
            ));
        Harness {
            orchestrator,
            transport,
            store,
        }
    }

    fn slow(ms: u64, value: Value) -> Vec<Step> {
        vec![Step::Delay(Duration::from_millis(ms), value)]
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<AuditEvent>>,
    }

    #[async_trait::async_trait]
    impl AuditSink for RecordingSink {
        async fn record(&self, event: AuditEvent) -> Result<(), String> {
            self.events.lock().expect("lock").push(event);
            Ok(())
        }
    }

    #[test]
    fn test_dispatch_waits_for_all_producers() {
        tokio_test::block_on(async {
            let transport = ScriptedTransport::new("scripted")
                .with_script("a", slow(40, json!({"a": 1})))
                .with_script("b", slow(5, json!({"b": 1})))
                .with_script("c", slow(5, json!({"c": 1})))
                .with_script("d", slow(5, json!({"d": 1})));
            let h = harness(transport, &["a", "b", "c", "d"]);
            let plan = Plan::new(
                "diamond",
                vec![
                    Task::new("a", "a"),
                    Task::new("b", "b"),
                    Task::new("c", "c").with_reference("in", "a"),
                    Task::new("d", "d")
                        .with_reference("left", "c")
                        .with_reference("right", "b"),
                ],
            );
            let result = h.orchestrator.execute(plan).await.expect("execute");
            assert_eq!(result.outcome, PlanOutcome::Succeeded);

            let records = h.transport.records();
            let find = |name: &str| {
                records
                    .iter()
                    .find(|r| r.capability == name)
                    .cloned()
                    .expect("record")
            };
            let (a, b, c, d) = (find("a"), find("b"), find("c"), find("d"));
            assert!(c.started >= a.finished);
            assert!(d.started >= c.finished);
            assert!(d.started >= b.finished);
            assert!(b.started < a.finished);
        });
    }

    #[test]
    fn test_consumers_receive_references_not_payloads() {
        tokio_test::block_on(async {
            let transport = ScriptedTransport::new("scripted")
                .with_script("producer", vec![Step::Ok(json!({"transcript": "hello world"}))]);
            let h = harness(transport, &["producer", "consumer"]);
            let plan = Plan::new(
                "chain",
                vec![
                    Task::new("p", "producer"),
                    Task::new("c", "consumer")
                        .with_reference("transcript", "p")
                        .with_literal("task_type", "speech"),
                ],
            );
            let result = h.orchestrator.execute(plan).await.expect("execute");
            assert!(result.is_success());

            let records = h.transport.records();
            let consumer = records
                .iter()
                .find(|r| r.capability == "consumer")
                .expect("consumer called");
            let passed = ResultRef::from_value(&consumer.arguments["transcript"]).expect("reference");
            assert_eq!(Some(&passed), result.output(&"p".into()));
            assert!(consumer.arguments["transcript"].get("transcript").is_none());
            assert_eq!(consumer.arguments["task_type"], json!("speech"));

            let resolved = h.store.get(&passed).await.expect("resolve");
            assert_eq!(resolved["transcript"], json!("hello world"));
        });
    }

    #[test]
    fn test_chain_short_circuits_after_retry_ceiling() {
        tokio_test::block_on(async {
            let transport = ScriptedTransport::new("scripted").with_script(
                "a",
                vec![Step::Transport(TransportFailure::Connection("refused".into()))],
            );
            let h = harness(transport, &["a", "b", "c"]);
            let plan = Plan::new(
                "a then b then c",
                vec![
                    Task::new("A", "a"),
                    Task::new("B", "b").with_reference("in", "A"),
                    Task::new("C", "c").with_reference("in", "B"),
                ],
            );
            let result = h.orchestrator.execute(plan).await.expect("execute");

            assert_eq!(result.outcome, PlanOutcome::Failed);
            assert_eq!(h.transport.calls("a"), 3);
            assert_eq!(h.transport.calls("b"), 0);
            assert_eq!(h.transport.calls("c"), 0);

            let a = result.task(&"A".into()).expect("A");
            assert_eq!(a.attempts, 3);
            assert_eq!(a.error.as_ref().map(|e| e.kind), Some(TaskErrorKind::Transport));
            for id in ["B", "C"] {
                let report = result.task(&id.into()).expect("report");
                assert_eq!(report.status, TaskStatus::Failed);
                let error = report.error.as_ref().expect("error");
                assert_eq!(error.kind, TaskErrorKind::UpstreamFailed);
                assert_eq!(error.root_cause, "A");
            }
        });
    }

    #[test]
    fn test_retry_backoff_increases_between_attempts() {
        tokio_test::block_on(async {
            let transport = ScriptedTransport::new("scripted").with_script(
                "flaky",
                vec![Step::Transport(TransportFailure::Timeout(Duration::from_millis(1)))],
            );
            let mut h = harness(transport, &["flaky"]);
            h.orchestrator = h.orchestrator.with_retry_policy(RetryPolicy::new(
                4,
                Duration::from_millis(20),
                Duration::from_millis(60),
            ));
            let result = h
                .orchestrator
                .execute(Plan::new("flaky", vec![Task::new("f", "flaky")]))
                .await
                .expect("execute");
            assert_eq!(result.outcome, PlanOutcome::Failed);

            let records = h.transport.records();
            assert_eq!(records.len(), 4);
            let gaps: Vec<Duration> = records
                .windows(2)
                .map(|pair| pair[1].started.duration_since(pair[0].finished))
                .collect();
            assert!(gaps[0] >= Duration::from_millis(20));
            assert!(gaps[1] >= Duration::from_millis(40));
            assert!(gaps[2] >= Duration::from_millis(60));
        });
    }

    #[test]
    fn test_transient_failure_recovers() {
        tokio_test::block_on(async {
            let transport = ScriptedTransport::new("scripted").with_script(
                "flaky",
                vec![
                    Step::Transport(TransportFailure::Unavailable {
                        status: 503,
                        message: "busy".into(),
                    }),
                    Step::Transport(TransportFailure::Connection("reset".into())),
                    Step::Ok(json!({"transcript": "ok"})),
                ],
            );
            let h = harness(transport, &["flaky"]);
            let result = h
                .orchestrator
                .execute(Plan::new("flaky", vec![Task::new("f", "flaky")]))
                .await
                .expect("execute");
            assert!(result.is_success());
            assert_eq!(result.task(&"f".into()).map(|t| t.attempts), Some(3));
        });
    }

    #[test]
    fn test_non_retryable_errors_fail_once() {
        tokio_test::block_on(async {
            let transport = ScriptedTransport::new("scripted").with_script(
                "strict",
                vec![Step::Fail(ProviderError::new("InvalidAudioUrl", "cannot fetch audio"))],
            );
            let mut h = harness(transport, &["strict", "sibling"]);
            let mut registry = CapabilityRegistry::new();
            registry
                .register(
                    CapabilityDescriptor::new("strict", TransportHandle::local("scripted")),
                )
                .expect("register");
            registry
                .register(
                    CapabilityDescriptor::new("validated", TransportHandle::local("scripted"))
                        .with_input_schema(json!({"type": "object", "required": ["audio_url"]})),
                )
                .expect("register");
            registry
                .register(CapabilityDescriptor::new("sibling", TransportHandle::local("scripted")))
                .expect("register");
            let adapter = CapabilityAdapter::new(h.store.clone()).with_transport(h.transport.clone());
            h.orchestrator = Orchestrator::new(Arc::new(registry), Arc::new(adapter));

            let plan = Plan::new(
                "mixed",
                vec![
                    Task::new("s", "strict"),
                    Task::new("v", "validated"),
                    Task::new("ok", "sibling"),
                ],
            );
            let result = h.orchestrator.execute(plan).await.expect("execute");
            assert_eq!(result.outcome, PlanOutcome::PartiallySucceeded);
            assert_eq!(h.transport.calls("strict"), 1);
            assert_eq!(h.transport.calls("validated"), 0);
            assert_eq!(
                result.task(&"s".into()).and_then(|t| t.error.as_ref()).map(|e| e.kind),
                Some(TaskErrorKind::Capability)
            );
            assert_eq!(
                result.task(&"v".into()).and_then(|t| t.error.as_ref()).map(|e| e.kind),
                Some(TaskErrorKind::SchemaViolation)
            );
            assert!(result.output(&"ok".into()).is_some());
            assert_eq!(result.failures().len(), 2);
        });
    }

    #[test]
    fn test_independent_tasks_run_concurrently_within_bound() {
        tokio_test::block_on(async {
            let mut transport = ScriptedTransport::new("scripted");
            for name in ["t1", "t2", "t3", "t4"] {
                transport = transport.with_script(name, slow(40, json!({"name": name})));
            }
            let h = harness(transport, &["t1", "t2", "t3", "t4"]);
            let orchestrator = h.orchestrator.with_max_in_flight(2);
            let tasks = ["t1", "t2", "t3", "t4"]
                .iter()
                .map(|name| Task::new(*name, *name))
                .collect();
            let result = orchestrator
                .execute(Plan::new("parallel", tasks))
                .await
                .expect("execute");
            assert!(result.is_success());
            assert_eq!(h.transport.peak_concurrency(), 2);
        });
    }

    #[test]
    fn test_cancellation_fails_waiting_and_discards_running() {
        tokio_test::block_on(async {
            let transport = ScriptedTransport::new("scripted")
                .with_script("slow", slow(120, json!({"done": true})))
                .with_script(
                    "flaky",
                    vec![Step::Transport(TransportFailure::Connection("down".into()))],
                );
            let mut h = harness(transport, &["slow", "after", "flaky"]);
            h.orchestrator = h.orchestrator.with_retry_policy(RetryPolicy::new(
                5,
                Duration::from_secs(2),
                Duration::from_secs(2),
            ));
            let plan = Plan::new(
                "cancel me",
                vec![
                    Task::new("slow", "slow"),
                    Task::new("after", "after").with_reference("in", "slow"),
                    Task::new("flaky", "flaky"),
                ],
            );
            let token = CancellationToken::new();
            let trigger = token.clone();
            let started = std::time::Instant::now();
            let (result, _) = tokio::join!(
                h.orchestrator.execute_with_cancel(plan, token),
                async move {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    trigger.cancel();
                }
            );
            let result = result.expect("execute");

            assert!(result.cancelled);
            assert_eq!(result.outcome, PlanOutcome::Failed);
            assert!(started.elapsed() < Duration::from_secs(2));
            assert_eq!(h.transport.calls("slow"), 1);
            assert_eq!(h.transport.calls("after"), 0);
            assert_eq!(h.transport.calls("flaky"), 1);
            for id in ["slow", "after", "flaky"] {
                let report = result.task(&id.into()).expect("report");
                assert_eq!(report.status, TaskStatus::Failed);
                assert_eq!(report.error.as_ref().map(|e| e.kind), Some(TaskErrorKind::Cancelled));
                assert!(report.output_ref.is_none());
            }
            assert_eq!(h.store.entry_count(), 0);
        });
    }

    #[test]
    fn test_discard_invalidates_references() {
        tokio_test::block_on(async {
            let transport = ScriptedTransport::new("scripted")
                .with_script("transcribe", vec![Step::Ok(json!({"transcript": "hi"}))]);
            let h = harness(transport, &["transcribe"]);
            let result = h
                .orchestrator
                .execute(Plan::new("t", vec![Task::new("t", "transcribe")]).with_run_id("run-x"))
                .await
                .expect("execute");
            let reference = result.final_output().cloned().expect("output");
            assert!(h.store.get(&reference).await.is_ok());

            assert_eq!(h.orchestrator.discard("run-x").await.expect("discard"), 1);
            assert!(matches!(
                h.store.get(&reference).await,
                Err(StoreError::ReferenceNotFound(_))
            ));
        });
    }

    #[test]
    fn test_unknown_capability_is_contained() {
        tokio_test::block_on(async {
            let h = harness(ScriptedTransport::new("scripted"), &["known"]);
            let plan = Plan::new(
                "partial",
                vec![
                    Task::new("x", "missing"),
                    Task::new("y", "known").with_reference("in", "x"),
                    Task::new("z", "known"),
                ],
            );
            let result = h.orchestrator.execute(plan).await.expect("execute");
            assert_eq!(result.outcome, PlanOutcome::PartiallySucceeded);
            assert_eq!(
                result.task(&"x".into()).and_then(|t| t.error.as_ref()).map(|e| e.kind),
                Some(TaskErrorKind::UnknownCapability)
            );
            assert_eq!(
                result.task(&"y".into()).and_then(|t| t.error.as_ref()).map(|e| e.kind),
                Some(TaskErrorKind::UpstreamFailed)
            );
            assert!(result.output(&"z".into()).is_some());
        });
    }

    #[test]
    fn test_invalid_plan_rejected() {
        tokio_test::block_on(async {
            let h = harness(ScriptedTransport::new("scripted"), &["a"]);
            let err = h
                .orchestrator
                .execute(Plan::new("empty", Vec::new()))
                .await
                .unwrap_err();
            assert!(matches!(err, ExecuteError::InvalidPlan(PlanValidationError::EmptyPlan)));
        });
    }

    #[test]
    fn test_tasks_count_as_dispatched_only_once_admitted() {
        tokio_test::block_on(async {
            let mut transport = ScriptedTransport::new("scripted");
            for name in ["t1", "t2", "t3"] {
                transport = transport.with_script(name, slow(20, json!({"name": name})));
            }
            let h = harness(transport, &["t1", "t2", "t3"]);
            let sink = Arc::new(RecordingSink::default());
            let orchestrator = h
                .orchestrator
                .with_max_in_flight(1)
                .with_audit_sink(sink.clone());
            let tasks = ["t1", "t2", "t3"]
                .iter()
                .map(|name| Task::new(*name, *name))
                .collect();
            let result = orchestrator
                .execute(Plan::new("serial", tasks))
                .await
                .expect("execute");
            assert!(result.is_success());

            let events = sink.events.lock().expect("lock");
            let mut running = 0usize;
            let mut dispatched = 0usize;
            for event in events.iter() {
                match event.phase {
                    AuditPhase::TaskDispatched => {
                        running += 1;
                        dispatched += 1;
                        assert!(running <= 1, "two tasks marked running under one permit");
                    }
                    AuditPhase::TaskSucceeded | AuditPhase::TaskFailed => running -= 1,
                    _ => {}
                }
            }
            assert_eq!(dispatched, 3);
        });
    }

    #[test]
    fn test_audit_trail_records_transitions() {
        tokio_test::block_on(async {
            let transport = ScriptedTransport::new("scripted").with_script(
                "a",
                vec![
                    Step::Transport(TransportFailure::Connection("refused".into())),
                    Step::Ok(json!({"ok": true})),
                ],
            );
            let h = harness(transport, &["a"]);
            let sink = Arc::new(RecordingSink::default());
            let orchestrator = h.orchestrator.with_audit_sink(sink.clone());
            orchestrator
                .execute(Plan::new("a", vec![Task::new("a", "a")]))
                .await
                .expect("execute");
            let phases: Vec<AuditPhase> = sink
                .events
                .lock()
                .expect("lock")
                .iter()
                .map(|e| e.phase)
                .collect();
            assert_eq!(
                phases,
                vec![
                    AuditPhase::PlanStarted,
                    AuditPhase::TaskReady,
                    AuditPhase::TaskDispatched,
                    AuditPhase::TaskRetrying,
                    AuditPhase::TaskDispatched,
                    AuditPhase::TaskSucceeded,
                    AuditPhase::PlanFinished,
                ]
            );
        });
    }
}
