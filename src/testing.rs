//! Scripted collaborators for unit tests

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::delegation::{AgentTransport, ToolCall};
use crate::error::{OracleError, TransportError};
use crate::oracle::DecisionBackend;
use crate::types::{Action, AgentId, RawDecision};

/// Transport that replays canned results and records every call
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<String, TransportError>>>,
    always_fail: bool,
    delay: Option<Duration>,
    calls: Mutex<Vec<(AgentId, ToolCall, Instant)>>,
}

impl ScriptedTransport {
    pub fn new(script: Vec<Result<String, TransportError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            always_fail: false,
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn always_failing() -> Self {
        Self {
            always_fail: true,
            ..Self::new(Vec::new())
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls(&self) -> Vec<(AgentId, ToolCall)> {
        self.calls
            .lock()
            .iter()
            .map(|(agent, call, _)| (*agent, call.clone()))
            .collect()
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().iter().map(|(_, _, at)| *at).collect()
    }
}

#[async_trait]
impl AgentTransport for ScriptedTransport {
    async fn call(&self, agent: AgentId, call: &ToolCall) -> Result<String, TransportError> {
        self.calls.lock().push((agent, call.clone(), Instant::now()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.always_fail {
            return Err(TransportError::Http("connection refused".into()));
        }
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::Http("script exhausted".into())))
    }
}

/// Classifier that replays canned decisions and records prompts
pub struct ScriptedBackend {
    script: Mutex<VecDeque<Result<RawDecision, OracleError>>>,
    repeat: Option<RawDecision>,
    delay: Option<Duration>,
    prompts: Mutex<Vec<(String, String)>>,
}

impl ScriptedBackend {
    pub fn new(script: Vec<Result<RawDecision, OracleError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            repeat: None,
            delay: None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn repeating(decision: RawDecision) -> Self {
        Self {
            repeat: Some(decision),
            ..Self::new(Vec::new())
        }
    }

    pub fn respond(reply: &str) -> Self {
        Self::repeating(RawDecision {
            action: Action::Respond,
            agent_name: None,
            response: reply.to_string(),
        })
    }

    pub fn delegate(agent: &str, reply: &str) -> Self {
        Self::repeating(RawDecision {
            action: Action::Delegate,
            agent_name: Some(agent.to_string()),
            response: reply.to_string(),
        })
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn prompts(&self) -> Vec<(String, String)> {
        self.prompts.lock().clone()
    }
}

#[async_trait]
impl DecisionBackend for ScriptedBackend {
    async fn classify(&self, system_prompt: &str, message: &str) -> Result<RawDecision, OracleError> {
        self.prompts
            .lock()
            .push((system_prompt.to_string(), message.to_string()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(next) = self.script.lock().pop_front() {
            return next;
        }
        self.repeat
            .clone()
            .ok_or_else(|| OracleError::Backend("script exhausted".into()))
    }
}

/// Mock HTTP endpoint answering every POST with one canned response
pub async fn json_endpoint(status: u16, body: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(status).set_body_raw(body.to_string(), "application/json"))
        .mount(&server)
        .await;
    server
}

/// JSON bodies of every request the server has seen, oldest first
pub async fn sent_bodies(server: &MockServer) -> Vec<serde_json::Value> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .map(|request| serde_json::from_slice(&request.body).unwrap())
        .collect()
}

pub async fn hits(server: &MockServer) -> usize {
    server.received_requests().await.map_or(0, |requests| requests.len())
}
