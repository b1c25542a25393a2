use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::time::Duration;

use labelaudio_core::planner::{ReasoningClient, ReasoningRequest, ToolDecision};

use crate::{preview_body, preview_text};

const MAX_PROMPT_LOG_CHARS: usize = 4_000;

const SYSTEM_PROMPT: &str = "You pick audio analysis capabilities for an annotation request. \
Return ONLY one JSON object.";

/// Settings for an OpenAI-compatible chat completions endpoint.
#[derive(Debug, Clone)]
pub struct HttpReasoningConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub timeout: Duration,
}

impl Default for HttpReasoningConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            temperature: 0.0,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Reasoning collaborator backed by a chat model.
///
/// Only the instruction text and the capability catalog are sent.
pub struct HttpReasoningClient {
    client: reqwest::Client,
    config: HttpReasoningConfig,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Debug, Deserialize)]
struct ChatMessageResponse {
    content: String,
}

#[derive(Debug, Deserialize)]
struct DecisionList {
    decisions: Vec<ToolDecision>,
}

impl HttpReasoningClient {
    pub fn new(config: HttpReasoningConfig) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &HttpReasoningConfig {
        &self.config
    }

    async fn complete(&self, system: String, user: String) -> Result<String, String> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = &self.config.api_key {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", key)).map_err(|e| e.to_string())?,
            );
        }
        let body = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            temperature: self.config.temperature,
        };

        let response = self
            .client
            .post(&self.config.endpoint)
            .headers(headers)
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("http error: {}", e))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| format!("http error: {}", e))?;
        if !status.is_success() {
            return Err(format!("HTTP {}: {}", status, preview_body(&text)));
        }
        let parsed: ChatResponse =
            serde_json::from_str(&text).map_err(|e| format!("invalid chat response: {}", e))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| "chat response has no choices".to_string())
    }
}

pub(crate) fn build_system_prompt(request: &ReasoningRequest) -> String {
    let mut system = String::from(SYSTEM_PROMPT);
    system.push_str("\n\nRules:\n");
    system.push_str("1) Use only capability names listed in the catalog.\n");
    system.push_str("2) List capabilities in the order they should run.\n");
    system.push_str("3) Put values stated in the request into arguments; omit anything unknown.\n");
    system.push_str("4) Return {\"decisions\": []} when nothing in the catalog applies.\n");
    system.push_str("\nCapability Catalog:\n");
    for entry in &request.catalog {
        let _ = writeln!(system, "- name: {}", entry.name);
        if !entry.description.is_empty() {
            let _ = writeln!(system, "  description: {}", entry.description);
        }
        if let Some(produces) = &entry.produces {
            let _ = writeln!(system, "  produces: {}", produces);
        }
        let _ = writeln!(system, "  input_schema: {}", entry.input_schema);
    }
    system
}

pub(crate) fn build_user_prompt(request: &ReasoningRequest) -> String {
    let mut user = String::new();
    let _ = writeln!(user, "Request:\n{}\n", request.instruction);
    user.push_str("Return a JSON object with shape:\n");
    user.push_str(r#"{"decisions":[{"capability":"name","arguments":{}}]}"#);
    user.push('\n');
    user
}

pub(crate) fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    Some(&text[start..=end])
}

pub(crate) fn parse_decisions(output: &str) -> Result<Vec<ToolDecision>, String> {
    let json = extract_json(output).ok_or_else(|| "model output did not contain JSON".to_string())?;
    serde_json::from_str::<DecisionList>(json)
        .map(|list| list.decisions)
        .map_err(|e| format!("invalid decision JSON: {}", e))
}

#[async_trait]
impl ReasoningClient for HttpReasoningClient {
    async fn decide(&self, request: &ReasoningRequest) -> Result<Vec<ToolDecision>, String> {
        let system = build_system_prompt(request);
        let user = build_user_prompt(request);
        tracing::info!(
            model = %self.config.model,
            catalog = request.catalog.len(),
            instruction_len = request.instruction.len(),
            "reasoning request prepared"
        );
        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(
                system_prompt = %preview_text(&system, MAX_PROMPT_LOG_CHARS),
                "reasoning prompt"
            );
        }
        let output = self.complete(system, user).await?;
        let decisions = parse_decisions(&output)?;
        tracing::info!(decisions = decisions.len(), "reasoning decided");
        Ok(decisions)
    }
}
