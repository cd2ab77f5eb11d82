//! OpenAI-compatible decision backend
//!
//! Asks a chat-completions endpoint for a structured routing decision using a
//! strict JSON schema, so the reply always parses into a [`RawDecision`].

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::config::OracleSettings;
use crate::error::OracleError;
use crate::oracle::{BackendFactory, DecisionBackend};
use crate::types::{AgentId, RawDecision};

const SCHEMA_NAME: &str = "routing_decision";

/// JSON schema the model must answer with
pub fn decision_schema() -> Value {
    let mut agents: Vec<Value> = AgentId::ALL.iter().map(|a| json!(a.as_str())).collect();
    agents.push(Value::Null);

    json!({
        "type": "object",
        "properties": {
            "action": {
                "type": "string",
                "enum": ["respond", "delegate"],
            },
            "agent_name": {
                "type": ["string", "null"],
                "enum": agents,
            },
            "response": {
                "type": "string",
            },
        },
        "required": ["action", "agent_name", "response"],
        "additionalProperties": false,
    })
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    temperature: f32,
    max_tokens: u32,
    messages: [CompletionMessage<'a>; 2],
    response_format: Value,
}

#[derive(Debug, Serialize)]
struct CompletionMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionResponseMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
}

/// Chat-completions classifier
pub struct OpenAiBackend {
    http: Client,
    api_key: String,
    base_url: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl std::fmt::Debug for OpenAiBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiBackend")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish()
    }
}

impl OpenAiBackend {
    pub fn new(settings: &OracleSettings, api_key: impl Into<String>) -> anyhow::Result<Self> {
        let http = Client::builder().build()?;
        Ok(Self {
            http,
            api_key: api_key.into(),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
        })
    }

    fn api_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[async_trait]
impl DecisionBackend for OpenAiBackend {
    async fn classify(&self, system_prompt: &str, message: &str) -> Result<RawDecision, OracleError> {
        let body = CompletionRequest {
            model: &self.model,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            messages: [
                CompletionMessage {
                    role: "system",
                    content: system_prompt,
                },
                CompletionMessage {
                    role: "user",
                    content: message,
                },
            ],
            response_format: json!({
                "type": "json_schema",
                "json_schema": {
                    "name": SCHEMA_NAME,
                    "strict": true,
                    "schema": decision_schema(),
                },
            }),
        };

        let url = self.api_url();
        debug!(url = %url, model = %self.model, "Requesting routing decision");

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| OracleError::Backend(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| OracleError::Backend(format!("reading response: {e}")))?;

        if !status.is_success() {
            return Err(match status.as_u16() {
                401 => OracleError::Backend("authentication failed".into()),
                429 => OracleError::Backend("rate limited".into()),
                code => OracleError::Backend(format!("HTTP {code}: {text}")),
            });
        }

        parse_completion(&text)
    }
}

/// Decision carried by a chat-completions response body
fn parse_completion(body: &str) -> Result<RawDecision, OracleError> {
    let response: CompletionResponse = serde_json::from_str(body)
        .map_err(|e| OracleError::Malformed(format!("completion: {e}")))?;

    let message = response
        .choices
        .into_iter()
        .next()
        .map(|choice| choice.message)
        .ok_or_else(|| OracleError::Malformed("no choices".into()))?;

    if let Some(refusal) = message.refusal {
        return Err(OracleError::Backend(format!("model refused: {refusal}")));
    }

    let content = message
        .content
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| OracleError::Malformed("empty content".into()))?;

    serde_json::from_str(&content).map_err(|e| OracleError::Malformed(e.to_string()))
}

/// Builds an [`OpenAiBackend`] on first use.
///
/// Fails when no API key is configured.
#[derive(Debug, Clone)]
pub struct OpenAiBackendFactory {
    settings: OracleSettings,
}

impl OpenAiBackendFactory {
    pub fn new(settings: OracleSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl BackendFactory for OpenAiBackendFactory {
    async fn create(&self) -> anyhow::Result<Arc<dyn DecisionBackend>> {
        let Some(api_key) = self
            .settings
            .api_key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
        else {
            anyhow::bail!("oracle.api_key is not set");
        };
        let backend = OpenAiBackend::new(&self.settings, api_key)?;
        Ok(Arc::new(backend))
    }
}
