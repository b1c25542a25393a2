use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::rules::{extract_parameters, RuleClassifier};
use super::{BuildError, IntentClassifier, IntentMatch};
use crate::capability::{CapabilityRegistry, CatalogEntry, RegistryError};
use crate::types::Instruction;

/// What the reasoning collaborator sees: the instruction and the catalog.
/// Never payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningRequest {
    pub instruction: String,
    pub catalog: Vec<CatalogEntry>,
}

/// One capability call proposed by the collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDecision {
    pub capability: String,
    #[serde(default)]
    pub arguments: BTreeMap<String, Value>,
}

/// External model choosing capabilities for an instruction.
#[async_trait]
pub trait ReasoningClient: Send + Sync {
    async fn decide(&self, request: &ReasoningRequest) -> Result<Vec<ToolDecision>, String>;
}

/// Classifier delegating intent selection to a [`ReasoningClient`].
///
/// Arguments the collaborator supplies win over ones extracted from the
/// text. With a fallback configured, a collaborator failure degrades to
/// rule matching instead of failing the build.
pub struct ReasoningClassifier {
    client: Arc<dyn ReasoningClient>,
    fallback: Option<RuleClassifier>,
}

impl ReasoningClassifier {
    pub fn new(client: Arc<dyn ReasoningClient>) -> Self {
        Self {
            client,
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, rules: RuleClassifier) -> Self {
        self.fallback = Some(rules);
        self
    }
}

#[async_trait]
impl IntentClassifier for ReasoningClassifier {
    fn name(&self) -> &str {
        "reasoning"
    }

    async fn classify(
        &self,
        instruction: &Instruction,
        registry: &CapabilityRegistry,
    ) -> Result<Vec<IntentMatch>, BuildError> {
        let request = ReasoningRequest {
            instruction: instruction.text.clone(),
            catalog: registry.catalog(),
        };
        let decisions = match self.client.decide(&request).await {
            Ok(decisions) => decisions,
            Err(err) => match &self.fallback {
                Some(rules) => {
                    tracing::warn!(error = %err, "reasoning failed, falling back to rules");
                    return Ok(rules.classify_text(&instruction.text, registry));
                }
                None => return Err(BuildError::Reasoning(err)),
            },
        };

        let extracted = extract_parameters(&instruction.text);
        decisions
            .into_iter()
            .map(|decision| {
                if !registry.contains(&decision.capability) {
                    return Err(BuildError::Registry(RegistryError::UnknownCapability(
                        decision.capability,
                    )));
                }
                let mut arguments = extracted.clone();
                arguments.extend(decision.arguments);
                Ok(IntentMatch::new(decision.capability)
                    .with_arguments(arguments)
                    .with_evidence("reasoning"))
            })
            .collect()
    }
}
