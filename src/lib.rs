//! # Handoff
//!
//! Conversational request router - decides whether a message is answered
//! directly or handed off to a specialist agent.
//!
//! ## Architecture
//!
//! ```text
//!                     ┌──────────────────────────────┐
//!   ChatRequest ────▶ │          ORCHESTRATOR         │ ────▶ ChatResponse
//!                     └──┬──────────┬──────────┬─────┘
//!                        │          │          │
//!            ┌───────────▼──┐  ┌────▼─────┐  ┌─▼─────────────────┐
//!            │ Conversation │  │ Decision │  │ Delegation Client │
//!            │    Memory    │  │  Oracle  │  │  retry + backoff  │
//!            └──────────────┘  └──────────┘  └─┬─────────────────┘
//!                                              │ per-agent breakers
//!                                 ┌────────────┼────────────┐
//!                                 ▼            ▼            ▼
//!                             reserva        venta         cita
//! ```
//!
//! ## Key Concepts
//!
//! - **Turn**: one recorded exchange (message, agent used, reply)
//! - **Session**: the last ten turns of one conversation
//! - **Breaker**: per-agent failure isolation; an open breaker fails fast
//! - **Sticky agent**: the most recent agent a session was handed to

pub mod breaker;
pub mod config;
pub mod context;
pub mod delegation;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod openai;
pub mod oracle;
pub mod orchestrator;
pub mod prompt;
pub mod telemetry;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testing;

pub use breaker::{BreakerConfig, BreakerStats, CircuitBreaker, CircuitBreakerRegistry, CircuitState};
pub use config::{load_settings, load_settings_with_env, Settings};
pub use context::{ContextSource, HttpContextSource, NoContext};
pub use delegation::{AgentTransport, DelegationClient, RetryPolicy, ToolCall};
pub use error::{ContextError, DelegationFailure, HandoffError, OracleError, TransportError, ValidationError};
pub use memory::{ConversationMemory, MemoryConfig, SessionSnapshot};
pub use metrics::{MetricsSnapshot, RequestMetrics};
pub use oracle::{BackendFactory, DecisionBackend, DecisionOracle};
pub use orchestrator::Orchestrator;
pub use prompt::{DefaultPromptBuilder, PromptBuilder};
pub use telemetry::init_tracing;
pub use transport::HttpAgentTransport;
pub use types::{Action, AgentId, ChatConfig, ChatRequest, ChatResponse, Decision, RawDecision, Turn};
