//! Task graph builder
//!
//! Turns an instruction into a [`Plan`]. Intent classification is a
//! pluggable [`IntentClassifier`]; binding, edge detection and validation
//! are fixed here so every classifier yields plans with the same guarantees.

mod reasoning;
mod rules;

pub use reasoning::{ReasoningClassifier, ReasoningClient, ReasoningRequest, ToolDecision};
pub use rules::{extract_parameters, IntentRule, RuleClassifier, RuleTarget};

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use crate::capability::{CapabilityDescriptor, CapabilityRegistry, RegistryError};
use crate::types::{InputBinding, Instruction, Plan, PlanValidationError, Task, TaskId};

/// Plan construction errors. None of them is retried.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("no capability matches instruction: {0}")]
    UnresolvableIntent(String),

    #[error("cannot bind parameter '{parameter}' of '{capability}': {reason}")]
    AmbiguousBinding {
        capability: String,
        parameter: String,
        reason: String,
    },

    #[error("dependency resolution produced a cycle at task {0}")]
    CyclicPlan(String),

    #[error("invalid plan: {0}")]
    InvalidPlan(PlanValidationError),

    #[error("reasoning collaborator failed: {0}")]
    Reasoning(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// One capability invocation chosen by a classifier, in plan order.
#[derive(Debug, Clone, PartialEq)]
pub struct IntentMatch {
    pub capability: String,
    /// Parameters extracted for this invocation.
    pub arguments: BTreeMap<String, Value>,
    /// Instruction fragment that triggered the match.
    pub evidence: String,
}

impl IntentMatch {
    pub fn new(capability: impl Into<String>) -> Self {
        Self {
            capability: capability.into(),
            arguments: BTreeMap::new(),
            evidence: String::new(),
        }
    }

    pub fn with_arguments(mut self, arguments: BTreeMap<String, Value>) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn with_evidence(mut self, evidence: impl Into<String>) -> Self {
        self.evidence = evidence.into();
        self
    }
}

/// Strategy mapping an instruction to capability invocations.
#[async_trait]
pub trait IntentClassifier: Send + Sync {
    fn name(&self) -> &str;

    async fn classify(
        &self,
        instruction: &Instruction,
        registry: &CapabilityRegistry,
    ) -> Result<Vec<IntentMatch>, BuildError>;
}

/// Builds plans over a fixed registry.
pub struct TaskGraphBuilder {
    registry: Arc<CapabilityRegistry>,
    classifier: Arc<dyn IntentClassifier>,
    defaults: BTreeMap<String, Value>,
}

impl TaskGraphBuilder {
    pub fn new(registry: Arc<CapabilityRegistry>, classifier: Arc<dyn IntentClassifier>) -> Self {
        Self {
            registry,
            classifier,
            defaults: BTreeMap::new(),
        }
    }

    /// Fallback parameter values used when neither hints nor the
    /// instruction provide one (e.g. `task_type`, `language`).
    pub fn with_defaults(mut self, defaults: BTreeMap<String, Value>) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub async fn build(&self, instruction: &Instruction) -> Result<Plan, BuildError> {
        let matches = self.classifier.classify(instruction, &self.registry).await?;
        if matches.is_empty() {
            return Err(BuildError::UnresolvableIntent(instruction.text.clone()));
        }

        let mut tasks: Vec<Task> = Vec::with_capacity(matches.len());
        let mut produced: Vec<(TaskId, Arc<CapabilityDescriptor>)> = Vec::new();
        for (idx, intent) in matches.iter().enumerate() {
            let descriptor = self.registry.lookup(&intent.capability)?;
            let mut task = Task::new(format!("t{}", idx + 1), descriptor.name.clone());
            bind_references(&descriptor, &produced, &mut task)?;
            self.bind_literals(&descriptor, instruction, intent, &mut task)?;
            tracing::debug!(
                task_id = %task.id,
                capability = %task.capability,
                evidence = %intent.evidence,
                "task planned"
            );
            produced.push((task.id.clone(), descriptor));
            tasks.push(task);
        }

        let plan = Plan::new(instruction.text.clone(), tasks);
        plan.validate().map_err(|err| match err {
            PlanValidationError::CycleDetected(task) => BuildError::CyclicPlan(task),
            other => BuildError::InvalidPlan(other),
        })?;
        tracing::info!(
            run_id = %plan.run_id,
            classifier = self.classifier.name(),
            tasks = plan.tasks.len(),
            roots = plan.roots().len(),
            "plan built"
        );
        Ok(plan)
    }

    fn bind_literals(
        &self,
        descriptor: &CapabilityDescriptor,
        instruction: &Instruction,
        intent: &IntentMatch,
        task: &mut Task,
    ) -> Result<(), BuildError> {
        let lookup = |name: &str| -> Option<Value> {
            instruction
                .hint(name)
                .or_else(|| intent.arguments.get(name))
                .or_else(|| self.defaults.get(name))
                .cloned()
        };

        let declared = descriptor.input_names();
        if declared.is_empty() {
            for (name, value) in &intent.arguments {
                task.inputs
                    .entry(name.clone())
                    .or_insert_with(|| InputBinding::Literal(value.clone()));
            }
            return Ok(());
        }

        let required = descriptor.required_inputs();
        for name in declared {
            if descriptor.consumes.contains_key(&name) {
                continue;
            }
            match lookup(&name) {
                Some(value) => {
                    task.inputs.insert(name, InputBinding::Literal(value));
                }
                None if required.contains(&name) => {
                    return Err(BuildError::AmbiguousBinding {
                        capability: descriptor.name.clone(),
                        parameter: name,
                        reason: "required value not found in instruction".to_string(),
                    });
                }
                None => {}
            }
        }
        Ok(())
    }
}

/// Bind each consumed artifact to the nearest earlier producer of it.
fn bind_references(
    descriptor: &CapabilityDescriptor,
    produced: &[(TaskId, Arc<CapabilityDescriptor>)],
    task: &mut Task,
) -> Result<(), BuildError> {
    if descriptor.consumes.is_empty() {
        return Ok(());
    }
    let required = descriptor.required_inputs();
    let mut bound = 0;
    for (param, artifact) in &descriptor.consumes {
        let producer = produced
            .iter()
            .rev()
            .find(|(_, candidate)| candidate.produces.as_deref() == Some(artifact.as_str()));
        match producer {
            Some((producer_id, _)) => {
                task.inputs
                    .insert(param.clone(), InputBinding::reference(producer_id));
                bound += 1;
            }
            None if required.contains(param) => {
                return Err(BuildError::AmbiguousBinding {
                    capability: descriptor.name.clone(),
                    parameter: param.clone(),
                    reason: format!("no earlier task produces '{}'", artifact),
                });
            }
            None => {}
        }
    }
    if bound == 0 {
        let wanted: Vec<&str> = descriptor.consumes.values().map(String::as_str).collect();
        return Err(BuildError::AmbiguousBinding {
            capability: descriptor.name.clone(),
            parameter: descriptor
                .consumes
                .keys()
                .next()
                .cloned()
                .unwrap_or_default(),
            reason: format!("no earlier task produces any of {:?}", wanted),
        });
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::InputBinding;
    use serde_json::json;

    fn builder() -> TaskGraphBuilder {
        TaskGraphBuilder::new(
            Arc::new(fixtures::registry()),
            Arc::new(RuleClassifier::default()),
        )
        .with_defaults(BTreeMap::from([("task_type".to_string(), json!("speech"))]))
    }

    #[test]
    fn test_transcribe_builds_single_task() {
        tokio_test::block_on(async {
            let plan = builder()
                .build(&Instruction::new(
                    "transcribe this audio https://cdn.example.com/meeting.wav",
                ))
                .await
                .expect("plan");
            assert_eq!(plan.tasks.len(), 1);
            let task = &plan.tasks[0];
            assert_eq!(task.capability, "transcribe_audio");
            assert_eq!(
                task.inputs.get("audio_url"),
                Some(&InputBinding::Literal(json!("https://cdn.example.com/meeting.wav")))
            );
        });
    }

    #[test]
    fn test_comprehensive_analysis_builds_three_roots() {
        tokio_test::block_on(async {
            let plan = builder()
                .build(&Instruction::new(
                    "run a comprehensive analysis of https://cdn.example.com/a.mp3",
                ))
                .await
                .expect("plan");
            let capabilities: Vec<&str> = plan.tasks.iter().map(|t| t.capability.as_str()).collect();
            assert_eq!(
                capabilities,
                vec!["transcribe_audio", "diarize_speakers", "detect_audio_events"]
            );
            assert_eq!(plan.roots().len(), 3);
        });
    }

    #[test]
    fn test_then_annotate_binds_references() {
        tokio_test::block_on(async {
            let plan = builder()
                .build(&Instruction::new(
                    "Comprehensive analysis of https://x.test/call.wav, then annotate the result",
                ))
                .await
                .expect("plan");
            assert_eq!(plan.tasks.len(), 4);
            let annotate = &plan.tasks[3];
            assert_eq!(annotate.capability, "annotate_audio");
            assert_eq!(annotate.inputs.get("transcript"), Some(&InputBinding::reference("t1")));
            assert_eq!(annotate.inputs.get("diarization"), Some(&InputBinding::reference("t2")));
            assert_eq!(annotate.inputs.get("events"), Some(&InputBinding::reference("t3")));
            assert!(annotate.inputs.get("keywords").is_none());
            assert_eq!(annotate.inputs.get("task_type"), Some(&InputBinding::literal("speech")));
            assert_eq!(annotate.dependencies().len(), 3);
        });
    }

    #[test]
    fn test_annotate_without_producer_is_ambiguous() {
        tokio_test::block_on(async {
            let err = builder()
                .build(&Instruction::new("annotate https://x.test/a.wav"))
                .await
                .unwrap_err();
            assert!(matches!(err, BuildError::AmbiguousBinding { ref capability, .. } if capability == "annotate_audio"));
        });
    }

    #[test]
    fn test_missing_required_parameter_is_ambiguous() {
        tokio_test::block_on(async {
            let err = builder()
                .build(&Instruction::new("transcribe the recording"))
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                BuildError::AmbiguousBinding { ref parameter, .. } if parameter == "audio_url"
            ));
        });
    }

    #[test]
    fn test_hint_overrides_extracted_value() {
        tokio_test::block_on(async {
            let instruction = Instruction::new("transcribe https://x.test/a.wav in english")
                .with_hint("language", "ja");
            let plan = builder().build(&instruction).await.expect("plan");
            assert_eq!(
                plan.tasks[0].inputs.get("language"),
                Some(&InputBinding::literal("ja"))
            );
        });
    }

    #[test]
    fn test_unmatched_instruction_is_unresolvable() {
        tokio_test::block_on(async {
            let err = builder()
                .build(&Instruction::new("make me a sandwich"))
                .await
                .unwrap_err();
            assert!(matches!(err, BuildError::UnresolvableIntent(_)));
        });
    }

    struct Fixed(Vec<IntentMatch>);

    #[async_trait]
    impl IntentClassifier for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn classify(
            &self,
            _instruction: &Instruction,
            _registry: &CapabilityRegistry,
        ) -> Result<Vec<IntentMatch>, BuildError> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_classifier_naming_unknown_capability_fails() {
        tokio_test::block_on(async {
            let builder = TaskGraphBuilder::new(
                Arc::new(fixtures::registry()),
                Arc::new(Fixed(vec![IntentMatch::new("teleport")])),
            );
            let err = builder.build(&Instruction::new("anything")).await.unwrap_err();
            assert!(matches!(
                err,
                BuildError::Registry(RegistryError::UnknownCapability(_))
            ));
        });
    }

    #[test]
    fn test_keyword_search_then_annotate() {
        tokio_test::block_on(async {
            let plan = builder()
                .build(&Instruction::new(
                    "transcribe https://x.test/a.wav and search for \"refund\"; then annotate it",
                ))
                .await
                .expect("plan");
            let capabilities: Vec<&str> = plan.tasks.iter().map(|t| t.capability.as_str()).collect();
            assert_eq!(capabilities, vec!["transcribe_audio", "search_keyword", "annotate_audio"]);
            assert_eq!(plan.tasks[1].inputs.get("keyword"), Some(&InputBinding::literal("refund")));
            assert_eq!(plan.tasks[2].dependencies(), vec![TaskId::from("t2"), TaskId::from("t1")]);
        });
    }
}
