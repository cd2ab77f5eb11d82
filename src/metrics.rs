//! Request counters and latency percentiles

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use crate::types::{Action, AgentId};

/// Latency samples kept for percentile estimates
pub const LATENCY_WINDOW: usize = 1024;

/// How a finished request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Replied(Action),
    /// Delegation failed and the fallback reply was sent
    Fallback,
    Failed,
}

/// Process-wide request statistics; lock-free except for the latency window
#[derive(Debug, Default)]
pub struct RequestMetrics {
    total: AtomicU64,
    success: AtomicU64,
    errors: AtomicU64,
    respond: AtomicU64,
    delegate: AtomicU64,
    fallback: AtomicU64,
    agent_corrections: AtomicU64,
    delegations: [AtomicU64; 3],
    latencies: Mutex<VecDeque<Duration>>,
}

/// Point-in-time copy of [`RequestMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub requests_success: u64,
    pub requests_error: u64,
    pub respond_total: u64,
    pub delegate_total: u64,
    pub fallback_total: u64,
    pub agent_corrections: u64,
    pub delegations_by_agent: BTreeMap<AgentId, u64>,
    pub latency_p50_ms: Option<u64>,
    pub latency_p95_ms: Option<u64>,
    pub latency_p99_ms: Option<u64>,
}

fn agent_slot(agent: AgentId) -> usize {
    match agent {
        AgentId::Reserva => 0,
        AgentId::Venta => 1,
        AgentId::Cita => 2,
    }
}

impl RequestMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one finished request
    pub fn record(&self, outcome: Outcome, elapsed: Duration) {
        self.total.fetch_add(1, Ordering::Relaxed);
        match outcome {
            Outcome::Replied(Action::Respond) => {
                self.success.fetch_add(1, Ordering::Relaxed);
                self.respond.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Replied(Action::Delegate) => {
                self.success.fetch_add(1, Ordering::Relaxed);
                self.delegate.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Fallback => {
                self.success.fetch_add(1, Ordering::Relaxed);
                self.delegate.fetch_add(1, Ordering::Relaxed);
                self.fallback.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Failed => {
                self.errors.fetch_add(1, Ordering::Relaxed);
            }
        }

        let mut latencies = self.latencies.lock();
        if latencies.len() == LATENCY_WINDOW {
            latencies.pop_front();
        }
        latencies.push_back(elapsed);
    }

    pub fn record_delegation(&self, agent: AgentId) {
        self.delegations[agent_slot(agent)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_correction(&self) {
        self.agent_corrections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut sorted: Vec<Duration> = self.latencies.lock().iter().copied().collect();
        sorted.sort_unstable();

        MetricsSnapshot {
            requests_total: self.total.load(Ordering::Relaxed),
            requests_success: self.success.load(Ordering::Relaxed),
            requests_error: self.errors.load(Ordering::Relaxed),
            respond_total: self.respond.load(Ordering::Relaxed),
            delegate_total: self.delegate.load(Ordering::Relaxed),
            fallback_total: self.fallback.load(Ordering::Relaxed),
            agent_corrections: self.agent_corrections.load(Ordering::Relaxed),
            delegations_by_agent: AgentId::ALL
                .iter()
                .map(|agent| (*agent, self.delegations[agent_slot(*agent)].load(Ordering::Relaxed)))
                .collect(),
            latency_p50_ms: percentile(&sorted, 50),
            latency_p95_ms: percentile(&sorted, 95),
            latency_p99_ms: percentile(&sorted, 99),
        }
    }
}

/// Nearest-rank percentile over sorted samples, in milliseconds
fn percentile(sorted: &[Duration], pct: usize) -> Option<u64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = (pct * sorted.len()).div_ceil(100).max(1);
    sorted
        .get(rank - 1)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}
