//! Delegation to specialist agents
//!
//! Every call goes through the agent's circuit breaker. Failures are recorded
//! per attempt, so a breaker that opens while a call is still retrying stops
//! the remaining attempts of that call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::breaker::{CircuitBreakerRegistry, CircuitState};
use crate::error::{DelegationFailure, TransportError};
use crate::types::AgentId;

/// Arguments of the agent-side `chat` tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatArgs {
    pub message: String,
    pub session_id: String,
    pub context: serde_json::Value,
}

/// Envelope sent to a specialist agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    pub args: ChatArgs,
}

impl ToolCall {
    pub fn chat(message: &str, session_id: &str, context: serde_json::Value) -> Self {
        Self {
            tool: "chat".to_string(),
            args: ChatArgs {
                message: message.to_string(),
                session_id: session_id.to_string(),
                context,
            },
        }
    }
}

/// Carries one tool call to one agent
#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn call(&self, agent: AgentId, call: &ToolCall) -> Result<String, TransportError>;
}

/// Attempt budget and pacing for one delegation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_retries: u32,
    pub attempt_timeout: Duration,
    /// Delay before the second attempt; doubles after each failure
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            attempt_timeout: Duration::from_secs(30),
            backoff_base: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Pause after the failed attempt `attempt_index` (0-based): base * 2^index
    pub fn backoff(&self, attempt_index: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt_index);
        self.backoff_base.saturating_mul(factor)
    }
}

/// Invokes agents through their breakers with bounded retry
pub struct DelegationClient {
    transport: Arc<dyn AgentTransport>,
    breakers: Arc<CircuitBreakerRegistry<AgentId>>,
    policy: RetryPolicy,
    enabled: HashMap<AgentId, bool>,
}

impl DelegationClient {
    pub fn new(
        transport: Arc<dyn AgentTransport>,
        breakers: Arc<CircuitBreakerRegistry<AgentId>>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            breakers,
            policy: RetryPolicy {
                max_retries: policy.max_retries.max(1),
                ..policy
            },
            enabled: HashMap::new(),
        }
    }

    /// Switch an agent on or off; agents default to enabled
    pub fn with_enabled(mut self, agent: AgentId, enabled: bool) -> Self {
        self.enabled.insert(agent, enabled);
        self
    }

    pub fn is_enabled(&self, agent: AgentId) -> bool {
        self.enabled.get(&agent).copied().unwrap_or(true)
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry<AgentId>> {
        &self.breakers
    }

    /// Forward `message` to `agent` and return its reply text
    pub async fn invoke(
        &self,
        agent: AgentId,
        message: &str,
        session_id: &str,
        context: serde_json::Value,
    ) -> Result<String, DelegationFailure> {
        if !self.is_enabled(agent) {
            info!(agent = %agent, "Agent disabled, not delegating");
            return Err(DelegationFailure::Disabled);
        }

        let breaker = self.breakers.breaker(&agent);
        if !breaker.can_attempt() {
            warn!(agent = %agent, "Circuit open, rejecting delegation");
            return Err(DelegationFailure::CircuitOpen);
        }

        let call = ToolCall::chat(message, session_id, context);
        let max_retries = self.policy.max_retries;
        let mut attempts = 0;
        let mut last_error = None;

        for attempt in 0..max_retries {
            if attempt > 0 && !breaker.can_attempt() {
                warn!(agent = %agent, attempt = attempt + 1, "Circuit opened mid-call, stopping retries");
                break;
            }
            attempts += 1;

            let outcome =
                tokio::time::timeout(self.policy.attempt_timeout, self.transport.call(agent, &call))
                    .await;

            let err = match outcome {
                Ok(Ok(text)) if !text.trim().is_empty() => {
                    breaker.record_success();
                    if attempt > 0 {
                        info!(agent = %agent, attempts, "Delegation succeeded after retry");
                    } else {
                        debug!(agent = %agent, "Delegation succeeded");
                    }
                    return Ok(text);
                }
                Ok(Ok(_)) => TransportError::EmptyResponse,
                Ok(Err(err)) => err,
                Err(_) => TransportError::Timeout(self.policy.attempt_timeout),
            };

            breaker.record_failure();
            warn!(
                agent = %agent,
                attempt = attempt + 1,
                max_retries,
                error = %err,
                "Delegation attempt failed"
            );
            last_error = Some(err);

            if attempt + 1 < max_retries && breaker.state() != CircuitState::Open {
                let delay = self.policy.backoff(attempt);
                debug!(agent = %agent, delay_ms = delay.as_millis() as u64, "Backing off");
                tokio::time::sleep(delay).await;
            }
        }

        let stats = breaker.stats();
        match last_error {
            Some(last_error) => {
                error!(
                    agent = %agent,
                    attempts,
                    error = %last_error,
                    state = stats.state.as_str(),
                    failures = stats.consecutive_failures,
                    "All delegation attempts failed"
                );
                Err(DelegationFailure::Exhausted {
                    attempts,
                    last_error,
                })
            }
            None => Err(DelegationFailure::CircuitOpen),
        }
    }
}
