//! Tenant business context
//!
//! The business description injected into the decision prompt. Lookups are
//! best-effort: a failure here never fails a chat request.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::breaker::CircuitBreakerRegistry;
use crate::config::ContextSettings;
use crate::error::ContextError;

const FETCH_OPERATION: &str = "OBTENER_CONTEXTO_NEGOCIO";

/// Source of per-tenant business context
#[async_trait]
pub trait ContextSource: Send + Sync {
    /// Context text for a tenant, `None` when the tenant has none
    async fn fetch(&self, tenant_id: i64) -> Result<Option<String>, ContextError>;
}

/// Context source that never has anything to say
#[derive(Debug, Clone, Copy, Default)]
pub struct NoContext;

#[async_trait]
impl ContextSource for NoContext {
    async fn fetch(&self, _tenant_id: i64) -> Result<Option<String>, ContextError> {
        Ok(None)
    }
}

#[derive(Debug, Serialize)]
struct ContextRequest {
    #[serde(rename = "codOpe")]
    operation: &'static str,
    id_empresa: i64,
}

#[derive(Debug, Deserialize)]
struct ContextResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    contexto_negocio: Option<String>,
}

#[derive(Debug, Clone)]
struct CachedContext {
    value: Option<String>,
    fetched_at: Instant,
}

/// HTTP context source with a bounded TTL cache and a per-tenant breaker.
///
/// Empty answers are cached like any other so tenants without context are not
/// re-queried on every message. Breakers are only kept for tenants with
/// failures on record.
pub struct HttpContextSource {
    http: Client,
    endpoint: String,
    timeout: Duration,
    cache_ttl: Duration,
    max_cached_tenants: usize,
    max_retries: u32,
    backoff_base: Duration,
    cache: DashMap<i64, CachedContext>,
    breakers: CircuitBreakerRegistry<i64>,
}

impl HttpContextSource {
    pub fn new(endpoint: impl Into<String>, settings: &ContextSettings) -> Result<Self, ContextError> {
        let http = Client::builder()
            .build()
            .map_err(|e| ContextError::Http(e.to_string()))?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            timeout: settings.timeout(),
            cache_ttl: settings.cache_ttl(),
            max_cached_tenants: settings.cache_max_tenants.max(1),
            max_retries: settings.max_retries.max(1),
            backoff_base: Duration::from_secs(1),
            cache: DashMap::new(),
            breakers: CircuitBreakerRegistry::new(settings.breaker_config()),
        })
    }

    /// Build from settings; `None` when no endpoint is configured
    pub fn from_settings(settings: &ContextSettings) -> Result<Option<Self>, ContextError> {
        match settings.endpoint.as_deref() {
            Some(endpoint) if !endpoint.trim().is_empty() => Self::new(endpoint, settings).map(Some),
            _ => Ok(None),
        }
    }

    pub fn with_backoff_base(mut self, backoff_base: Duration) -> Self {
        self.backoff_base = backoff_base;
        self
    }

    pub fn cached_tenants(&self) -> usize {
        self.cache.len()
    }

    /// Drop a tenant's cached context
    pub fn invalidate(&self, tenant_id: i64) {
        self.cache.remove(&tenant_id);
    }

    fn cached(&self, tenant_id: i64) -> Option<Option<String>> {
        let fresh = {
            let entry = self.cache.get(&tenant_id)?;
            (entry.fetched_at.elapsed() < self.cache_ttl).then(|| entry.value.clone())
        };
        if fresh.is_none() {
            let ttl = self.cache_ttl;
            self.cache.remove_if(&tenant_id, |_, entry| entry.fetched_at.elapsed() >= ttl);
        }
        fresh
    }

    fn store(&self, tenant_id: i64, value: Option<String>) {
        self.cache.insert(
            tenant_id,
            CachedContext {
                value,
                fetched_at: Instant::now(),
            },
        );
        if self.cache.len() <= self.max_cached_tenants {
            return;
        }

        let ttl = self.cache_ttl;
        self.cache
            .retain(|key, entry| *key == tenant_id || entry.fetched_at.elapsed() < ttl);
        while self.cache.len() > self.max_cached_tenants {
            let oldest = self
                .cache
                .iter()
                .filter(|entry| *entry.key() != tenant_id)
                .min_by_key(|entry| entry.value().fetched_at)
                .map(|entry| *entry.key());
            let Some(oldest) = oldest else {
                break;
            };
            self.cache.remove(&oldest);
            debug!(tenant_id = oldest, "Evicted oldest cached context");
        }
    }

    async fn request(&self, tenant_id: i64) -> Result<Option<String>, ContextError> {
        let body = ContextRequest {
            operation: FETCH_OPERATION,
            id_empresa: tenant_id,
        };
        let response = self
            .http
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| ContextError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ContextError::Http(format!("status {}", status.as_u16())));
        }

        let parsed: ContextResponse = response
            .json()
            .await
            .map_err(|e| ContextError::Http(e.to_string()))?;
        if !parsed.success {
            return Err(ContextError::Rejected);
        }

        Ok(parsed
            .contexto_negocio
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty()))
    }
}

#[async_trait]
impl ContextSource for HttpContextSource {
    async fn fetch(&self, tenant_id: i64) -> Result<Option<String>, ContextError> {
        if let Some(hit) = self.cached(tenant_id) {
            debug!(tenant_id, "Context cache hit");
            return Ok(hit);
        }

        if !self.breakers.can_attempt(&tenant_id) {
            warn!(tenant_id, "Context circuit open, skipping lookup");
            return Err(ContextError::CircuitOpen);
        }

        let mut last_error = ContextError::Timeout;
        for attempt in 0..self.max_retries {
            let outcome = match tokio::time::timeout(self.timeout, self.request(tenant_id)).await {
                Ok(result) => result,
                Err(_) => Err(ContextError::Timeout),
            };

            match outcome {
                Ok(value) => {
                    self.breakers.record_success(&tenant_id);
                    self.breakers.forget_if_pristine(&tenant_id);
                    info!(tenant_id, found = value.is_some(), "Context fetched");
                    self.store(tenant_id, value.clone());
                    return Ok(value);
                }
                Err(err) => {
                    debug!(tenant_id, attempt = attempt + 1, error = %err, "Context fetch attempt failed");
                    last_error = err;
                    if attempt + 1 < self.max_retries {
                        tokio::time::sleep(self.backoff_base * 2u32.saturating_pow(attempt)).await;
                    }
                }
            }
        }

        self.breakers.record_failure(&tenant_id);
        warn!(tenant_id, error = %last_error, "Context unavailable");
        Err(last_error)
    }
}
