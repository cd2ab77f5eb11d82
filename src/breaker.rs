//! Per-key circuit breakers
//!
//! Each key (a downstream agent, or a tenant for context lookups) owns an
//! independent breaker behind its own mutex, so unrelated keys never contend.
//! Breakers are created lazily through the registry's sharded map.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Breaker tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// How long the circuit stays open before a probe is allowed
    #[serde(with = "duration_secs")]
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

/// Circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Point-in-time view of one breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BreakerStats {
    pub state: CircuitState,
    pub consecutive_failures: u32,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    /// Set while the single half-open probe is outstanding
    probe_started_at: Option<Instant>,
}

/// Failure-isolation state machine for one key
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a closed breaker
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure_at: None,
                probe_started_at: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> BreakerConfig {
        self.config
    }

    /// Ask permission for one call.
    ///
    /// Open circuits move to half-open once `reset_timeout` has passed since the
    /// last failure. Half-open admits a single probe; further callers are refused
    /// until the probe reports, or until the probe itself has been outstanding
    /// for `reset_timeout` (an abandoned probe must not wedge the breaker).
    pub fn can_attempt(&self) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure_at
                    .map(|at| now.saturating_duration_since(at))
                    .unwrap_or(self.config.reset_timeout);

                if elapsed >= self.config.reset_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_started_at = Some(now);
                    info!(breaker = %self.name, "Circuit half-open, probing recovery");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => match inner.probe_started_at {
                Some(started) if now.saturating_duration_since(started) < self.config.reset_timeout => {
                    debug!(breaker = %self.name, "Probe already in flight");
                    false
                }
                _ => {
                    inner.probe_started_at = Some(now);
                    true
                }
            },
        }
    }

    /// Report a successful call; always closes the circuit
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            info!(
                breaker = %self.name,
                from = inner.state.as_str(),
                "Circuit closed"
            );
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.last_failure_at = None;
        inner.probe_started_at = None;
    }

    /// Report a failed call
    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure_at = Some(now);

        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    warn!(
                        breaker = %self.name,
                        failures = inner.consecutive_failures,
                        "Circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.probe_started_at = None;
                warn!(breaker = %self.name, "Probe failed, circuit re-opened");
            }
            CircuitState::Open => {}
        }
    }

    /// Current state without side effects
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn stats(&self) -> BreakerStats {
        let inner = self.inner.lock();
        BreakerStats {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
        }
    }

    pub fn last_failure_at(&self) -> Option<Instant> {
        self.inner.lock().last_failure_at
    }

    /// Closed with no failures on record, indistinguishable from a new breaker
    pub fn is_pristine(&self) -> bool {
        let inner = self.inner.lock();
        inner.state == CircuitState::Closed && inner.consecutive_failures == 0
    }
}

/// Lazily-populated breakers, one per key
pub struct CircuitBreakerRegistry<K> {
    breakers: DashMap<K, Arc<CircuitBreaker>>,
    default_config: BreakerConfig,
    overrides: HashMap<K, BreakerConfig>,
}

impl<K> CircuitBreakerRegistry<K>
where
    K: Eq + Hash + Clone + Display,
{
    pub fn new(default_config: BreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            default_config,
            overrides: HashMap::new(),
        }
    }

    /// Use a different configuration for one key
    pub fn with_override(mut self, key: K, config: BreakerConfig) -> Self {
        self.overrides.insert(key, config);
        self
    }

    /// Get or create the breaker for `key`.
    ///
    /// Creation happens under the shard's entry lock, so concurrent first
    /// references observe the same breaker.
    pub fn breaker(&self, key: &K) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(key) {
            return Arc::clone(existing.value());
        }

        let entry = self.breakers.entry(key.clone()).or_insert_with(|| {
            let config = self
                .overrides
                .get(key)
                .copied()
                .unwrap_or(self.default_config);
            debug!(breaker = %key, "Creating circuit breaker");
            Arc::new(CircuitBreaker::new(key.to_string(), config))
        });
        Arc::clone(entry.value())
    }

    pub fn can_attempt(&self, key: &K) -> bool {
        self.breaker(key).can_attempt()
    }

    pub fn record_success(&self, key: &K) {
        self.breaker(key).record_success();
    }

    pub fn record_failure(&self, key: &K) {
        self.breaker(key).record_failure();
    }

    /// Drop the breaker for `key` if it carries no failure history.
    ///
    /// Lets registries keyed by an open-ended id keep only the keys that are
    /// currently failing. Returns whether a breaker was removed.
    pub fn forget_if_pristine(&self, key: &K) -> bool {
        self.breakers
            .remove_if(key, |_, breaker| breaker.is_pristine())
            .is_some()
    }

    /// Number of breakers created so far
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

impl<K> CircuitBreakerRegistry<K>
where
    K: Eq + Hash + Clone + Display + Ord,
{
    /// Snapshot of every breaker created so far
    pub fn stats(&self) -> BTreeMap<K, BreakerStats> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().stats()))
            .collect()
    }
}

impl<K> Default for CircuitBreakerRegistry<K>
where
    K: Eq + Hash + Clone + Display,
{
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
