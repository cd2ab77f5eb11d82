//! Wire and domain types shared across the router

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{OracleError, ValidationError};

/// Known downstream specialist agents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentId {
    Reserva,
    Venta,
    Cita,
}

impl AgentId {
    pub const ALL: [AgentId; 3] = [AgentId::Reserva, AgentId::Venta, AgentId::Cita];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentId::Reserva => "reserva",
            AgentId::Venta => "venta",
            AgentId::Cita => "cita",
        }
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when an agent name is not one of [`AgentId::ALL`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown agent: {0}")]
pub struct UnknownAgent(pub String);

impl FromStr for AgentId {
    type Err = UnknownAgent;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reserva" => Ok(AgentId::Reserva),
            "venta" => Ok(AgentId::Venta),
            "cita" => Ok(AgentId::Cita),
            _ => Err(UnknownAgent(s.to_string())),
        }
    }
}

/// What the router did with a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Respond,
    Delegate,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Respond => "respond",
            Action::Delegate => "delegate",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated routing decision.
///
/// The delegate target exists exactly when the action is [`Action::Delegate`],
/// so the variant carries it rather than an optional field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Respond { reply: String },
    Delegate { agent: AgentId, reply: String },
}

impl Decision {
    pub fn action(&self) -> Action {
        match self {
            Decision::Respond { .. } => Action::Respond,
            Decision::Delegate { .. } => Action::Delegate,
        }
    }

    pub fn agent(&self) -> Option<AgentId> {
        match self {
            Decision::Respond { .. } => None,
            Decision::Delegate { agent, .. } => Some(*agent),
        }
    }

    pub fn reply_text(&self) -> &str {
        match self {
            Decision::Respond { reply } | Decision::Delegate { reply, .. } => reply,
        }
    }
}

/// Decision exactly as the classifier emits it, before validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawDecision {
    pub action: Action,
    #[serde(default)]
    pub agent_name: Option<String>,
    pub response: String,
}

impl TryFrom<RawDecision> for Decision {
    type Error = OracleError;

    fn try_from(raw: RawDecision) -> Result<Self, Self::Error> {
        let agent = raw
            .agent_name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .map(|name| {
                name.parse::<AgentId>()
                    .map_err(|e| OracleError::Malformed(e.to_string()))
            })
            .transpose()?;

        match (raw.action, agent) {
            (Action::Respond, None) => Ok(Decision::Respond {
                reply: raw.response,
            }),
            (Action::Delegate, Some(agent)) => Ok(Decision::Delegate {
                agent,
                reply: raw.response,
            }),
            (Action::Respond, Some(agent)) => Err(OracleError::Malformed(format!(
                "respond decision names agent {agent}"
            ))),
            (Action::Delegate, None) => Err(OracleError::Malformed(
                "delegate decision without agent_name".into(),
            )),
        }
    }
}

/// One recorded exchange within a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub user_message: String,
    pub agent_used: Option<AgentId>,
    pub response: String,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn new(
        user_message: impl Into<String>,
        agent_used: Option<AgentId>,
        response: impl Into<String>,
    ) -> Self {
        Self {
            user_message: user_message.into(),
            agent_used,
            response: response.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Per-tenant bot configuration carried with each request.
///
/// Only the fields the router reads are named; everything else is kept in
/// `extra` and forwarded untouched to the delegated agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatConfig {
    #[serde(alias = "id_empresa")]
    pub tenant_id: i64,
    #[serde(default, alias = "nombre_bot")]
    pub bot_name: Option<String>,
    #[serde(default, alias = "objetivo_principal")]
    pub goal: Option<String>,
    #[serde(default, alias = "personalidad")]
    pub personality: Option<String>,
    #[serde(default, alias = "frase_saludo")]
    pub greeting: Option<String>,
    #[serde(default, alias = "frase_des")]
    pub farewell: Option<String>,
    #[serde(default, alias = "frase_no_sabe")]
    pub unknown_answer: Option<String>,
    #[serde(default, alias = "frase_esc")]
    pub escalation: Option<String>,
    #[serde(default, alias = "modalidad")]
    pub modality: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ChatConfig {
    pub fn for_tenant(tenant_id: i64) -> Self {
        Self {
            tenant_id,
            ..Default::default()
        }
    }

    /// Agent the tenant's modality pins delegation to, if a modality is set.
    ///
    /// "Ventas" maps to `venta`; any other modality maps to `cita`.
    pub fn modality_agent(&self) -> Option<AgentId> {
        let modality = self.modality.as_deref()?.trim();
        if modality.is_empty() {
            return None;
        }
        if modality.to_lowercase().contains("ventas") {
            Some(AgentId::Venta)
        } else {
            Some(AgentId::Cita)
        }
    }
}

/// Inbound chat request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    pub session_id: String,
    pub config: ChatConfig,
}

impl ChatRequest {
    pub fn new(
        session_id: impl Into<String>,
        message: impl Into<String>,
        config: ChatConfig,
    ) -> Self {
        Self {
            message: message.into(),
            session_id: session_id.into(),
            config,
        }
    }

    /// Reject requests that must never reach memory or the breakers
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.message.trim().is_empty() {
            return Err(ValidationError::EmptyMessage);
        }
        if self.session_id.trim().is_empty() {
            return Err(ValidationError::EmptySessionId);
        }
        if self.config.tenant_id <= 0 {
            return Err(ValidationError::InvalidTenant(self.config.tenant_id));
        }
        Ok(())
    }
}

/// Outbound chat response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub reply: String,
    pub session_id: String,
    pub agent_used: Option<AgentId>,
    pub action: Action,
}
