//! Request lifecycle - decide, delegate, remember

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::breaker::BreakerStats;
use crate::config::{Settings, DEFAULT_FALLBACK_REPLY};
use crate::context::{ContextSource, HttpContextSource, NoContext};
use crate::delegation::DelegationClient;
use crate::error::HandoffError;
use crate::memory::ConversationMemory;
use crate::metrics::{MetricsSnapshot, Outcome, RequestMetrics};
use crate::oracle::DecisionOracle;
use crate::openai::OpenAiBackendFactory;
use crate::prompt::{DefaultPromptBuilder, PromptBuilder};
use crate::transport::HttpAgentTransport;
use crate::types::{Action, AgentId, ChatConfig, ChatRequest, ChatResponse, Decision, Turn};

/// Default deadline for loading context and deciding a chat request
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// The request router
///
/// Owns the process-wide session memory and agent breakers and drives every
/// chat request through them.
pub struct Orchestrator {
    memory: Arc<ConversationMemory>,
    delegation: DelegationClient,
    oracle: DecisionOracle,
    context: Arc<dyn ContextSource>,
    prompts: Arc<dyn PromptBuilder>,
    metrics: RequestMetrics,
    fallback_reply: String,
    request_timeout: Duration,
}

impl Orchestrator {
    /// Router with no business context and the default prompt
    pub fn new(memory: Arc<ConversationMemory>, delegation: DelegationClient, oracle: DecisionOracle) -> Self {
        Self {
            memory,
            delegation,
            oracle,
            context: Arc::new(NoContext),
            prompts: Arc::new(DefaultPromptBuilder),
            metrics: RequestMetrics::new(),
            fallback_reply: DEFAULT_FALLBACK_REPLY.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Wire the HTTP adapters described by `settings`
    pub fn from_settings(settings: &Settings) -> Result<Self, HandoffError> {
        let transport = HttpAgentTransport::new(settings.agents.urls())
            .map_err(|e| HandoffError::Config(format!("agent transport: {e}")))?;

        let delegation = AgentId::ALL.into_iter().fold(
            DelegationClient::new(
                Arc::new(transport),
                settings.breaker.registry(),
                settings.delegation.retry_policy(),
            ),
            |client, agent| client.with_enabled(agent, settings.agents.is_enabled(agent)),
        );

        let oracle = DecisionOracle::new(
            Arc::new(OpenAiBackendFactory::new(settings.oracle.clone())),
            settings.oracle.timeout(),
        );

        let memory = Arc::new(ConversationMemory::new(settings.memory.memory_config()));

        let mut orchestrator = Self::new(memory, delegation, oracle)
            .with_fallback_reply(settings.delegation.fallback_reply.clone())
            .with_request_timeout(settings.request.timeout());

        if let Some(source) = HttpContextSource::from_settings(&settings.context)
            .map_err(|e| HandoffError::Config(format!("context source: {e}")))?
        {
            orchestrator = orchestrator.with_context_source(Arc::new(source));
        }

        let enabled: Vec<&str> = AgentId::ALL
            .iter()
            .filter(|agent| settings.agents.is_enabled(**agent))
            .map(AgentId::as_str)
            .collect();
        info!(
            enabled_agents = ?enabled,
            request_timeout_secs = settings.request.timeout_secs,
            "Orchestrator configured"
        );
        Ok(orchestrator)
    }

    pub fn with_context_source(mut self, context: Arc<dyn ContextSource>) -> Self {
        self.context = context;
        self
    }

    pub fn with_prompt_builder(mut self, prompts: Arc<dyn PromptBuilder>) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn with_fallback_reply(mut self, reply: impl Into<String>) -> Self {
        self.fallback_reply = reply.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Handle one chat request end to end.
    ///
    /// The request deadline covers the context lookup and the oracle call.
    /// Delegation runs outside it, bounded by its own retry policy, so a slow
    /// agent always ends in a reply and a stored turn.
    ///
    /// Memory is written once, as the last step, and only when a reply exists.
    /// Delegation failures still produce a reply (the fallback); oracle
    /// failures and timeouts do not.
    #[instrument(
        skip(self, request),
        fields(
            request_id = %Uuid::new_v4(),
            session_id = %request.session_id,
            tenant_id = request.config.tenant_id,
        )
    )]
    pub async fn handle(&self, request: ChatRequest) -> Result<ChatResponse, HandoffError> {
        let started = Instant::now();

        if let Err(err) = request.validate() {
            warn!(error = %err, "Rejected invalid request");
            self.metrics.record(Outcome::Failed, started.elapsed());
            return Err(err.into());
        }

        let result = match tokio::time::timeout(self.request_timeout, self.decide(&request)).await {
            Ok(Ok(decision)) => self.act(&request, decision).await,
            Ok(Err(err)) => Err(err),
            Err(_) => Err(HandoffError::Timeout {
                after: self.request_timeout,
            }),
        };

        match result {
            Ok((response, outcome)) => {
                self.metrics.record(outcome, started.elapsed());
                info!(
                    action = %response.action,
                    agent = ?response.agent_used,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Request completed"
                );
                Ok(response)
            }
            Err(err) => {
                self.metrics.record(Outcome::Failed, started.elapsed());
                warn!(error = %err, "Request failed");
                Err(err)
            }
        }
    }

    /// Load session and context, then ask the oracle
    async fn decide(&self, request: &ChatRequest) -> Result<Decision, HandoffError> {
        let session_id = request.session_id.as_str();

        let (session, context) = tokio::join!(
            async { self.memory.snapshot(session_id) },
            self.business_context(request.config.tenant_id),
        );
        debug!(
            turns = session.turns.len(),
            current_agent = ?session.current_agent,
            has_context = context.is_some(),
            "Loaded session"
        );

        let prompt = self.prompts.build(&request.config, &session, context.as_deref());
        let decision = self.oracle.decide(&prompt, &request.message).await?;
        Ok(self.pin_to_modality(decision, &request.config))
    }

    /// Reply or delegate, then record the turn
    async fn act(&self, request: &ChatRequest, decision: Decision) -> Result<(ChatResponse, Outcome), HandoffError> {
        let session_id = request.session_id.as_str();

        let (reply, agent_used, outcome) = match decision {
            Decision::Respond { reply } => (reply, None, Outcome::Replied(Action::Respond)),
            Decision::Delegate { agent, .. } => {
                self.metrics.record_delegation(agent);
                let config = serde_json::to_value(&request.config)
                    .map_err(|e| HandoffError::Internal(e.into()))?;
                let payload = serde_json::json!({ "session_id": session_id, "config": config });

                match self
                    .delegation
                    .invoke(agent, &request.message, session_id, payload)
                    .await
                {
                    Ok(text) => (text, Some(agent), Outcome::Replied(Action::Delegate)),
                    Err(failure) => {
                        warn!(agent = %agent, reason = %failure, "Delegation failed, sending fallback reply");
                        (self.fallback_reply.clone(), Some(agent), Outcome::Fallback)
                    }
                }
            }
        };

        let action = match outcome {
            Outcome::Replied(Action::Respond) => Action::Respond,
            _ => Action::Delegate,
        };

        self.memory
            .add(session_id, Turn::new(request.message.as_str(), agent_used, reply.as_str()));

        let response = ChatResponse {
            reply,
            session_id: request.session_id.clone(),
            agent_used,
            action,
        };
        Ok((response, outcome))
    }

    async fn business_context(&self, tenant_id: i64) -> Option<String> {
        match self.context.fetch(tenant_id).await {
            Ok(context) => context,
            Err(err) => {
                warn!(tenant_id, error = %err, "Business context unavailable, continuing without it");
                None
            }
        }
    }

    /// Keep sales and appointment tenants on their own agent
    fn pin_to_modality(&self, decision: Decision, config: &ChatConfig) -> Decision {
        match (decision, config.modality_agent()) {
            (Decision::Delegate { agent, reply }, Some(pinned))
                if agent != pinned && agent != AgentId::Reserva =>
            {
                warn!(
                    oracle_agent = %agent,
                    pinned_agent = %pinned,
                    modality = config.modality.as_deref().unwrap_or_default(),
                    "Oracle picked an agent outside the tenant modality, corrected"
                );
                self.metrics.record_correction();
                Decision::Delegate { agent: pinned, reply }
            }
            (decision, _) => decision,
        }
    }

    /// Turn count per session
    pub fn memory_stats(&self) -> BTreeMap<String, usize> {
        self.memory.stats()
    }

    /// Breaker state per agent that has been called at least once
    pub fn breaker_stats(&self) -> BTreeMap<AgentId, BreakerStats> {
        self.delegation.breakers().stats()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn clear_session(&self, session_id: &str) {
        self.memory.clear(session_id);
        info!(session_id, "Session cleared");
    }

    pub fn memory(&self) -> &Arc<ConversationMemory> {
        &self.memory
    }

    /// Periodically drop sessions idle for longer than `ttl`
    pub fn spawn_idle_sweeper(&self, ttl: Duration) -> JoinHandle<()> {
        let memory = Arc::clone(&self.memory);
        let period = (ttl / 4).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let evicted = memory.evict_idle(ttl);
                if evicted > 0 {
                    info!(evicted, remaining = memory.session_count(), "Swept idle sessions");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::breaker::{BreakerConfig, CircuitBreakerRegistry, CircuitState};
    use crate::delegation::RetryPolicy;
    use crate::error::{ContextError, OracleError, ValidationError};
    use crate::oracle::DEFAULT_ORACLE_TIMEOUT;
    use crate::testing::{ScriptedBackend, ScriptedTransport};
    use crate::types::RawDecision;

    struct Harness {
        orchestrator: Orchestrator,
        backend: Arc<ScriptedBackend>,
        transport: Arc<ScriptedTransport>,
        breakers: Arc<CircuitBreakerRegistry<AgentId>>,
    }

    fn harness(backend: ScriptedBackend, transport: ScriptedTransport) -> Harness {
        let backend = Arc::new(backend);
        let transport = Arc::new(transport);
        let breakers = Arc::new(CircuitBreakerRegistry::new(BreakerConfig::default()));
        let delegation = DelegationClient::new(transport.clone(), Arc::clone(&breakers), RetryPolicy::default());
        let oracle = DecisionOracle::with_backend(backend.clone(), DEFAULT_ORACLE_TIMEOUT);
        let orchestrator = Orchestrator::new(Arc::new(ConversationMemory::default()), delegation, oracle);
        Harness {
            orchestrator,
            backend,
            transport,
            breakers,
        }
    }

    fn request(session_id: &str, message: &str) -> ChatRequest {
        ChatRequest::new(session_id, message, ChatConfig::for_tenant(1))
    }

    struct FixedContext(Result<Option<String>, ContextError>);

    #[async_trait]
    impl ContextSource for FixedContext {
        async fn fetch(&self, _tenant_id: i64) -> Result<Option<String>, ContextError> {
            self.0.clone()
        }
    }

    #[tokio::test]
    async fn test_greeting_is_answered_directly() {
        let h = harness(ScriptedBackend::respond("Hola! ¿En qué puedo ayudarte?"), ScriptedTransport::new(vec![]));

        let response = h.orchestrator.handle(request("s-1", "Hola")).await.unwrap();

        assert_eq!(response.reply, "Hola! ¿En qué puedo ayudarte?");
        assert_eq!(response.agent_used, None);
        assert_eq!(response.action, Action::Respond);
        assert_eq!(response.session_id, "s-1");
        assert_eq!(h.transport.call_count(), 0);

        let turns = h.orchestrator.memory().get("s-1");
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].user_message, "Hola");
        assert_eq!(turns[0].agent_used, None);
    }

    #[tokio::test]
    async fn test_reservation_is_delegated() {
        let h = harness(
            ScriptedBackend::delegate("reserva", "Te ayudo con tu reserva"),
            ScriptedTransport::new(vec![Ok("¿Para cuántas personas?".into())]),
        );

        let response = h
            .orchestrator
            .handle(request("s-1", "Quiero reservar para manana"))
            .await
            .unwrap();

        assert_eq!(response.agent_used, Some(AgentId::Reserva));
        assert_eq!(response.action, Action::Delegate);
        assert_eq!(response.reply, "¿Para cuántas personas?");

        let calls = h.transport.calls();
        assert_eq!(calls.len(), 1);
        let (agent, call) = &calls[0];
        assert_eq!(*agent, AgentId::Reserva);
        assert_eq!(call.tool, "chat");
        assert_eq!(call.args.message, "Quiero reservar para manana");
        assert_eq!(call.args.session_id, "s-1");
        assert_eq!(call.args.context["session_id"], "s-1");
        assert_eq!(call.args.context["config"]["tenant_id"], 1);

        assert_eq!(h.breakers.breaker(&AgentId::Reserva).state(), CircuitState::Closed);
        let turns = h.orchestrator.memory().get("s-1");
        assert_eq!(turns[0].agent_used, Some(AgentId::Reserva));
        assert_eq!(turns[0].response, "¿Para cuántas personas?");
    }

    #[tokio::test]
    async fn test_open_breaker_short_circuits_to_fallback() {
        let h = harness(
            ScriptedBackend::delegate("reserva", "..."),
            ScriptedTransport::new(vec![Ok("never sent".into())]),
        );
        for _ in 0..BreakerConfig::default().failure_threshold {
            h.breakers.record_failure(&AgentId::Reserva);
        }

        let response = h.orchestrator.handle(request("s-1", "mesa para 2")).await.unwrap();

        assert_eq!(h.transport.call_count(), 0);
        assert_eq!(response.reply, DEFAULT_FALLBACK_REPLY);
        assert_eq!(response.agent_used, Some(AgentId::Reserva));
        assert_eq!(response.action, Action::Delegate);

        let turns = h.orchestrator.memory().get("s-1");
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].response, DEFAULT_FALLBACK_REPLY);
        assert_eq!(h.orchestrator.metrics().fallback_total, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_delegation_still_records_turn() {
        let h = harness(ScriptedBackend::delegate("cita", "..."), ScriptedTransport::always_failing());
        let h = Harness {
            orchestrator: h.orchestrator.with_fallback_reply("Intenta más tarde"),
            ..h
        };

        let response = h.orchestrator.handle(request("s-1", "una cita el lunes")).await.unwrap();

        assert_eq!(h.transport.call_count(), 3);
        assert_eq!(response.reply, "Intenta más tarde");
        assert_eq!(h.orchestrator.memory().get("s-1").len(), 1);
        let stats = h.orchestrator.breaker_stats();
        assert_eq!(stats[&AgentId::Cita].consecutive_failures, 3);
    }

    #[tokio::test]
    async fn test_oracle_failure_leaves_memory_untouched() {
        let h = harness(
            ScriptedBackend::new(vec![Err(OracleError::Backend("boom".into()))]),
            ScriptedTransport::new(vec![]),
        );

        let err = h.orchestrator.handle(request("s-1", "Hola")).await.unwrap_err();

        assert!(matches!(err, HandoffError::Oracle(OracleError::Backend(_))));
        assert_eq!(h.orchestrator.memory().session_count(), 0);
        assert_eq!(h.orchestrator.metrics().requests_error, 1);
    }

    #[tokio::test]
    async fn test_malformed_decision_is_rejected() {
        let h = harness(
            ScriptedBackend::repeating(RawDecision {
                action: Action::Delegate,
                agent_name: None,
                response: "?".into(),
            }),
            ScriptedTransport::new(vec![]),
        );

        let err = h.orchestrator.handle(request("s-1", "Hola")).await.unwrap_err();

        assert!(matches!(err, HandoffError::Oracle(OracleError::Malformed(_))));
        assert_eq!(h.transport.call_count(), 0);
        assert!(h.orchestrator.memory_stats().is_empty());
    }

    #[tokio::test]
    async fn test_validation_touches_no_state() {
        let h = harness(ScriptedBackend::respond("hola"), ScriptedTransport::new(vec![]));

        let err = h.orchestrator.handle(request("s-1", "   ")).await.unwrap_err();
        assert!(matches!(err, HandoffError::Validation(ValidationError::EmptyMessage)));

        let bad_tenant = ChatRequest::new("s-1", "Hola", ChatConfig::for_tenant(0));
        let err = h.orchestrator.handle(bad_tenant).await.unwrap_err();
        assert!(matches!(err, HandoffError::Validation(ValidationError::InvalidTenant(0))));

        assert!(h.backend.prompts().is_empty());
        assert_eq!(h.orchestrator.memory().session_count(), 0);
        assert!(h.breakers.is_empty());
    }

    #[tokio::test]
    async fn test_modality_corrects_delegate_target() {
        let h = harness(
            ScriptedBackend::delegate("cita", "..."),
            ScriptedTransport::new(vec![Ok("Tenemos stock".into())]),
        );
        let config = ChatConfig {
            modality: Some("Ventas".into()),
            ..ChatConfig::for_tenant(4)
        };

        let response = h
            .orchestrator
            .handle(ChatRequest::new("s-1", "¿cuánto cuesta?", config))
            .await
            .unwrap();

        assert_eq!(response.agent_used, Some(AgentId::Venta));
        assert_eq!(h.transport.calls()[0].0, AgentId::Venta);
        assert_eq!(h.orchestrator.metrics().agent_corrections, 1);
    }

    #[tokio::test]
    async fn test_reservations_are_not_pinned() {
        let h = harness(
            ScriptedBackend::delegate("reserva", "..."),
            ScriptedTransport::new(vec![Ok("ok".into())]),
        );
        let config = ChatConfig {
            modality: Some("Citas".into()),
            ..ChatConfig::for_tenant(4)
        };

        let response = h
            .orchestrator
            .handle(ChatRequest::new("s-1", "mesa para 3", config))
            .await
            .unwrap();

        assert_eq!(response.agent_used, Some(AgentId::Reserva));
        assert_eq!(h.orchestrator.metrics().agent_corrections, 0);
    }

    #[tokio::test]
    async fn test_history_and_sticky_agent_reach_the_prompt() {
        let h = harness(
            ScriptedBackend::delegate("reserva", "..."),
            ScriptedTransport::new(vec![Ok("¿A qué hora?".into()), Ok("Listo".into())]),
        );

        h.orchestrator.handle(request("s-1", "mesa para 4")).await.unwrap();
        h.orchestrator.handle(request("s-1", "a las 8")).await.unwrap();

        let prompts = h.backend.prompts();
        assert_eq!(prompts.len(), 2);
        assert!(!prompts[0].0.contains("en curso con el agente"));
        assert!(prompts[1].0.contains("\"¿A qué hora?\" (derivaste a: reserva)"));
        assert!(prompts[1].0.contains("en curso con el agente reserva"));
        assert_eq!(prompts[1].1, "a las 8");
    }

    #[tokio::test]
    async fn test_business_context_is_best_effort() {
        let h = harness(ScriptedBackend::respond("Abrimos a las 9"), ScriptedTransport::new(vec![]));
        let orchestrator = h
            .orchestrator
            .with_context_source(Arc::new(FixedContext(Ok(Some("Pizzería en Cusco".into())))));
        orchestrator.handle(request("s-1", "¿a qué hora abren?")).await.unwrap();
        assert!(h.backend.prompts()[0].0.contains("Pizzería en Cusco"));

        let orchestrator = orchestrator.with_context_source(Arc::new(FixedContext(Err(ContextError::Timeout))));
        let response = orchestrator.handle(request("s-1", "¿y los domingos?")).await.unwrap();
        assert_eq!(response.action, Action::Respond);
        assert!(!h.backend.prompts()[1].0.contains("Pizzería en Cusco"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_deadline() {
        let h = harness(
            ScriptedBackend::respond("tarde").with_delay(Duration::from_secs(30)),
            ScriptedTransport::new(vec![]),
        );
        let orchestrator = h.orchestrator.with_request_timeout(Duration::from_secs(10));

        let err = orchestrator.handle(request("s-1", "Hola")).await.unwrap_err();

        assert!(matches!(err, HandoffError::Timeout { after } if after == Duration::from_secs(10)));
        assert_eq!(orchestrator.memory().session_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_oracle_and_failing_agent_still_fall_back() {
        let h = harness(
            ScriptedBackend::delegate("reserva", "...").with_delay(Duration::from_secs(50)),
            ScriptedTransport::always_failing().with_delay(Duration::from_secs(40)),
        );
        let started = Instant::now();

        let response = h.orchestrator.handle(request("s-1", "mesa para 6")).await.unwrap();

        // 50 s deciding plus three 30 s attempts and backoff outlast the deadline
        assert!(started.elapsed() > DEFAULT_REQUEST_TIMEOUT);
        assert_eq!(response.reply, DEFAULT_FALLBACK_REPLY);
        assert_eq!(response.agent_used, Some(AgentId::Reserva));
        assert_eq!(h.transport.call_count(), 3);

        let turns = h.orchestrator.memory().get("s-1");
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].response, DEFAULT_FALLBACK_REPLY);

        let stats = h.orchestrator.breaker_stats();
        assert_eq!(stats[&AgentId::Reserva].state, CircuitState::Closed);
        assert_eq!(stats[&AgentId::Reserva].consecutive_failures, 3);
        assert_eq!(h.orchestrator.metrics().fallback_total, 1);
    }

    #[tokio::test]
    async fn test_concurrent_requests_on_one_session() {
        let h = harness(ScriptedBackend::respond("ok"), ScriptedTransport::new(vec![]));
        let orchestrator = Arc::new(h.orchestrator);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let orchestrator = Arc::clone(&orchestrator);
                tokio::spawn(async move { orchestrator.handle(request("shared", &format!("msg-{i}"))).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(orchestrator.memory_stats()["shared"], 8);
        assert_eq!(orchestrator.metrics().requests_total, 8);
        assert_eq!(orchestrator.metrics().respond_total, 8);
    }

    #[tokio::test]
    async fn test_clear_session() {
        let h = harness(ScriptedBackend::respond("ok"), ScriptedTransport::new(vec![]));
        h.orchestrator.handle(request("s-1", "Hola")).await.unwrap();
        h.orchestrator.handle(request("s-2", "Hola")).await.unwrap();

        h.orchestrator.clear_session("s-1");
        h.orchestrator.clear_session("s-1");

        let stats = h.orchestrator.memory_stats();
        assert!(!stats.contains_key("s-1"));
        assert_eq!(stats["s-2"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_sweeper() {
        let h = harness(ScriptedBackend::respond("ok"), ScriptedTransport::new(vec![]));
        h.orchestrator.handle(request("s-1", "Hola")).await.unwrap();

        let sweeper = h.orchestrator.spawn_idle_sweeper(Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(200)).await;

        assert_eq!(h.orchestrator.memory().session_count(), 0);
        sweeper.abort();
    }

    #[test]
    fn test_from_settings_defaults() {
        let orchestrator = Orchestrator::from_settings(&Settings::default()).unwrap();
        assert!(!orchestrator.delegation.is_enabled(AgentId::Venta));
        assert!(orchestrator.delegation.is_enabled(AgentId::Reserva));
        assert_eq!(orchestrator.request_timeout, DEFAULT_REQUEST_TIMEOUT);
        assert!(!orchestrator.oracle.is_initialized());
    }
}
