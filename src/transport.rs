//! HTTP transport to specialist agents
//!
//! Posts the `chat` tool call as JSON to the agent's endpoint and normalises
//! whatever the agent sends back into plain reply text.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use crate::delegation::{AgentTransport, ToolCall};
use crate::error::TransportError;
use crate::types::AgentId;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Reqwest-backed [`AgentTransport`]
#[derive(Clone)]
pub struct HttpAgentTransport {
    http: Client,
    endpoints: HashMap<AgentId, String>,
}

impl std::fmt::Debug for HttpAgentTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpAgentTransport")
            .field("endpoints", &self.endpoints)
            .finish()
    }
}

impl HttpAgentTransport {
    /// Transport for the given agent endpoints; agents without one are refused
    pub fn new(endpoints: HashMap<AgentId, String>) -> Result<Self, TransportError> {
        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self::with_client(http, endpoints))
    }

    pub fn with_client(http: Client, endpoints: HashMap<AgentId, String>) -> Self {
        Self { http, endpoints }
    }

    pub fn endpoint(&self, agent: AgentId) -> Option<&str> {
        self.endpoints.get(&agent).map(String::as_str)
    }
}

#[async_trait]
impl AgentTransport for HttpAgentTransport {
    async fn call(&self, agent: AgentId, call: &ToolCall) -> Result<String, TransportError> {
        let url = self
            .endpoint(agent)
            .ok_or(TransportError::NotConfigured(agent))?;

        debug!(agent = %agent, url = %url, "Calling agent");
        let response = self.http.post(url).json(call).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }

        let body = response.text().await?;
        let text = extract_text(&body);
        if text.is_empty() {
            return Err(TransportError::EmptyResponse);
        }
        Ok(text)
    }
}

/// Plain text from an agent response body.
///
/// Accepts a bare string, a JSON string, a list of `{text}` / `{content}`
/// blocks (joined by newlines), or an object carrying `text`, `content` or
/// `result`. Anything else is returned as trimmed raw text.
pub fn extract_text(body: &str) -> String {
    match serde_json::from_str::<Value>(body) {
        Ok(value) => text_from_value(&value),
        Err(_) => body.trim().to_string(),
    }
}

fn text_from_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.trim().to_string(),
        Value::Array(items) => items
            .iter()
            .map(text_from_value)
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Object(map) => ["text", "content", "result"]
            .iter()
            .filter_map(|key| map.get(*key))
            .map(text_from_value)
            .find(|text| !text.is_empty())
            .unwrap_or_default(),
        other => other.to_string(),
    }
}
