//! Service settings
//!
//! Loaded from an optional TOML file and then overridden by `HANDOFF__*`
//! environment variables (double underscore nests, e.g.
//! `HANDOFF__BREAKER__FAILURE_THRESHOLD=3`).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::breaker::{BreakerConfig, CircuitBreakerRegistry};
use crate::delegation::RetryPolicy;
use crate::memory::MemoryConfig;
use crate::types::AgentId;

/// Reply used when a delegated agent cannot answer
pub const DEFAULT_FALLBACK_REPLY: &str =
    "Lo siento, en este momento no puedo procesar tu solicitud. Por favor, intenta de nuevo en unos minutos.";

/// Root settings
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub memory: MemorySettings,
    pub breaker: BreakerSettings,
    pub delegation: DelegationSettings,
    pub oracle: OracleSettings,
    pub context: ContextSettings,
    pub agents: AgentsSettings,
    pub request: RequestSettings,
    pub logging: LoggingSettings,
}

/// [memory]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemorySettings {
    pub max_turns: usize,
    pub max_sessions: Option<usize>,
    /// Idle sessions older than this are swept; unset disables the sweep
    pub idle_ttl_secs: Option<u64>,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            max_turns: crate::memory::DEFAULT_MAX_TURNS,
            max_sessions: None,
            idle_ttl_secs: None,
        }
    }
}

impl MemorySettings {
    pub fn memory_config(&self) -> MemoryConfig {
        MemoryConfig {
            max_turns: self.max_turns,
            max_sessions: self.max_sessions,
        }
    }

    pub fn idle_ttl(&self) -> Option<Duration> {
        self.idle_ttl_secs.map(Duration::from_secs)
    }
}

/// Per-agent breaker override; unset fields inherit the defaults
#[derive(Debug, Clone, Copy, Deserialize, Default)]
pub struct BreakerOverride {
    pub failure_threshold: Option<u32>,
    pub reset_timeout_secs: Option<u64>,
}

/// [breaker]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub reset_timeout_secs: u64,
    /// Keyed by agent name; unknown names are ignored
    pub overrides: HashMap<String, BreakerOverride>,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        let defaults = BreakerConfig::default();
        Self {
            failure_threshold: defaults.failure_threshold,
            reset_timeout_secs: defaults.reset_timeout.as_secs(),
            overrides: HashMap::new(),
        }
    }
}

impl BreakerSettings {
    pub fn default_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold.max(1),
            reset_timeout: Duration::from_secs(self.reset_timeout_secs),
        }
    }

    pub fn config_for(&self, agent: AgentId) -> BreakerConfig {
        let base = self.default_config();
        match self.overrides.get(agent.as_str()) {
            Some(o) => BreakerConfig {
                failure_threshold: o.failure_threshold.unwrap_or(base.failure_threshold).max(1),
                reset_timeout: o
                    .reset_timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(base.reset_timeout),
            },
            None => base,
        }
    }

    /// Registry carrying the defaults and every override
    pub fn registry(&self) -> Arc<CircuitBreakerRegistry<AgentId>> {
        let registry = AgentId::ALL
            .into_iter()
            .filter(|agent| self.overrides.contains_key(agent.as_str()))
            .fold(CircuitBreakerRegistry::new(self.default_config()), |registry, agent| {
                registry.with_override(agent, self.config_for(agent))
            });
        Arc::new(registry)
    }
}

/// [delegation]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DelegationSettings {
    pub max_retries: u32,
    pub attempt_timeout_secs: u64,
    pub backoff_base_ms: u64,
    pub fallback_reply: String,
}

impl Default for DelegationSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            attempt_timeout_secs: 30,
            backoff_base_ms: 1000,
            fallback_reply: DEFAULT_FALLBACK_REPLY.to_string(),
        }
    }
}

impl DelegationSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries.max(1),
            attempt_timeout: Duration::from_secs(self.attempt_timeout_secs),
            backoff_base: Duration::from_millis(self.backoff_base_ms),
        }
    }
}

/// [oracle]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OracleSettings {
    pub timeout_secs: u64,
    pub model: String,
    pub api_key: Option<String>,
    pub base_url: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for OracleSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            base_url: "https://api.openai.com/v1".to_string(),
            temperature: 0.4,
            max_tokens: 4096,
        }
    }
}

impl OracleSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// [context]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContextSettings {
    /// Business-context endpoint; unset disables context lookups
    pub endpoint: Option<String>,
    pub timeout_secs: u64,
    pub cache_ttl_secs: u64,
    /// Tenants kept in the context cache; expired then oldest go first
    pub cache_max_tenants: usize,
    pub failure_threshold: u32,
    pub failure_window_secs: u64,
    pub max_retries: u32,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_secs: 10,
            cache_ttl_secs: 3600,
            cache_max_tenants: 500,
            failure_threshold: 3,
            failure_window_secs: 300,
            max_retries: 2,
        }
    }
}

impl ContextSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold.max(1),
            reset_timeout: Duration::from_secs(self.failure_window_secs),
        }
    }
}

/// One specialist agent's endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct AgentEndpoint {
    pub url: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl AgentEndpoint {
    fn local(port: u16, enabled: bool) -> Self {
        Self {
            url: Some(format!("http://localhost:{port}/mcp")),
            enabled,
        }
    }
}

/// [agents]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentsSettings {
    pub reserva: AgentEndpoint,
    pub venta: AgentEndpoint,
    pub cita: AgentEndpoint,
}

impl Default for AgentsSettings {
    fn default() -> Self {
        Self {
            reserva: AgentEndpoint::local(8003, true),
            venta: AgentEndpoint::local(8001, false),
            cita: AgentEndpoint::local(8002, true),
        }
    }
}

impl AgentsSettings {
    pub fn endpoint(&self, agent: AgentId) -> &AgentEndpoint {
        match agent {
            AgentId::Reserva => &self.reserva,
            AgentId::Venta => &self.venta,
            AgentId::Cita => &self.cita,
        }
    }

    /// An agent is usable when switched on and given a URL
    pub fn is_enabled(&self, agent: AgentId) -> bool {
        let endpoint = self.endpoint(agent);
        endpoint.enabled && endpoint.url.as_deref().is_some_and(|u| !u.trim().is_empty())
    }

    /// URLs of usable agents
    pub fn urls(&self) -> HashMap<AgentId, String> {
        AgentId::ALL
            .into_iter()
            .filter(|agent| self.is_enabled(*agent))
            .filter_map(|agent| self.endpoint(agent).url.clone().map(|url| (agent, url)))
            .collect()
    }
}

/// [request]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RequestSettings {
    /// Deadline for loading context and getting a routing decision
    pub timeout_secs: u64,
}

impl Default for RequestSettings {
    fn default() -> Self {
        Self { timeout_secs: 120 }
    }
}

impl RequestSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// [logging]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
        }
    }
}

/// Load settings: `config/handoff.toml` if present, then `path` if given,
/// then `HANDOFF__*` environment variables.
///
/// `OPENAI_API_KEY` fills `oracle.api_key` when nothing else set it.
pub fn load_settings(path: Option<&Path>) -> Result<Settings, config::ConfigError> {
    load_settings_with_env(path, None)
}

/// [`load_settings`] reading variables from `env` instead of the process
/// environment when given
pub fn load_settings_with_env(
    path: Option<&Path>,
    env: Option<config::Map<String, String>>,
) -> Result<Settings, config::ConfigError> {
    let mut builder = config::Config::builder()
        .add_source(config::File::with_name("config/handoff").required(false));

    if let Some(path) = path {
        builder = builder.add_source(config::File::from(path).required(true));
    }

    let api_key_fallback = match &env {
        Some(vars) => vars.get("OPENAI_API_KEY").cloned(),
        None => std::env::var("OPENAI_API_KEY").ok(),
    };

    builder = builder.add_source(
        config::Environment::with_prefix("HANDOFF")
            .separator("__")
            .try_parsing(true)
            .source(env),
    );

    let mut settings: Settings = builder.build()?.try_deserialize()?;

    if settings.oracle.api_key.is_none() {
        settings.oracle.api_key = api_key_fallback.filter(|key| !key.trim().is_empty());
    }

    Ok(settings)
}
