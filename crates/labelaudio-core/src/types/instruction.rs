use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A natural-language request plus optional explicit parameters.
///
/// `hints` carry values supplied out of band (for example a `--audio` flag)
/// and take precedence over values extracted from `text`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instruction {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub hints: BTreeMap<String, Value>,
}

impl Instruction {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            text: text.into(),
            hints: BTreeMap::new(),
        }
    }

    pub fn with_hint(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.hints.insert(key.into(), value.into());
        self
    }

    pub fn hint(&self, key: &str) -> Option<&Value> {
        self.hints.get(key)
    }
}
