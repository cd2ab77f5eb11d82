//! Router error types

use std::time::Duration;

use thiserror::Error;

use crate::types::AgentId;

/// Errors that end a chat request without a reply
#[derive(Debug, Error)]
pub enum HandoffError {
    /// Request rejected before entering the flow
    #[error("Invalid request: {0}")]
    Validation(#[from] ValidationError),

    /// Decision oracle failed; nothing was recorded
    #[error("Decision oracle failed: {0}")]
    Oracle(#[from] OracleError),

    /// Request deadline exceeded while deciding
    #[error("Request timed out after {after:?}")]
    Timeout { after: Duration },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Input validation failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("message must not be empty")]
    EmptyMessage,

    #[error("session_id must not be empty")]
    EmptySessionId,

    #[error("tenant id must be positive, got {0}")]
    InvalidTenant(i64),
}

/// Failures of the decision oracle adapter
#[derive(Debug, Clone, Error)]
pub enum OracleError {
    /// The underlying classifier could not be constructed
    #[error("Oracle initialisation failed: {0}")]
    Init(String),

    #[error("Oracle timed out after {0:?}")]
    Timeout(Duration),

    #[error("Oracle backend error: {0}")]
    Backend(String),

    /// Output did not match the decision schema
    #[error("Malformed decision: {0}")]
    Malformed(String),
}

/// Failures of a single delegation transport call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Transport timed out after {0:?}")]
    Timeout(Duration),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Agent returned status {0}")]
    Status(u16),

    #[error("Agent returned an empty response")]
    EmptyResponse,

    #[error("Agent {0} has no endpoint configured")]
    NotConfigured(AgentId),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => TransportError::Status(status.as_u16()),
            None => TransportError::Http(err.to_string()),
        }
    }
}

/// Why a delegation produced no agent reply.
///
/// Not fatal: the orchestrator substitutes a fallback reply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DelegationFailure {
    /// Breaker refused the call; no attempt was made
    #[error("circuit open")]
    CircuitOpen,

    /// Every permitted attempt failed
    #[error("exhausted after {attempts} attempt(s): {last_error}")]
    Exhausted {
        attempts: u32,
        last_error: TransportError,
    },

    /// Agent switched off in configuration
    #[error("agent disabled")]
    Disabled,
}

/// Failures fetching tenant business context
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("Context fetch timed out")]
    Timeout,

    #[error("Context HTTP error: {0}")]
    Http(String),

    #[error("Context service rejected the request")]
    Rejected,

    /// Tenant's context breaker is open; no request was made
    #[error("Context circuit open")]
    CircuitOpen,
}
