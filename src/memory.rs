//! Bounded per-session conversation memory
//!
//! Sessions live in a sharded map; every mutation of a session happens under
//! that session's shard lock, so concurrent writers to the same session are
//! linearized while unrelated sessions proceed in parallel. Reads hand out
//! owned snapshots and never observe a half-applied `add`.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::types::{AgentId, Turn};

/// Default number of turns kept per session
pub const DEFAULT_MAX_TURNS: usize = 10;

/// Memory limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Turns kept per session; older turns are evicted first
    pub max_turns: usize,
    /// Upper bound on live sessions; least recently written is evicted.
    /// `None` keeps every session until cleared.
    pub max_sessions: Option<usize>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_turns: DEFAULT_MAX_TURNS,
            max_sessions: None,
        }
    }
}

#[derive(Debug)]
struct SessionLog {
    turns: VecDeque<Turn>,
    last_written: Instant,
}

impl SessionLog {
    fn new(capacity: usize) -> Self {
        Self {
            turns: VecDeque::with_capacity(capacity),
            last_written: Instant::now(),
        }
    }

    fn current_agent(&self) -> Option<AgentId> {
        self.turns.iter().rev().find_map(|turn| turn.agent_used)
    }
}

/// Consistent view of one session taken under a single lock acquisition
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub turns: Vec<Turn>,
    /// Most recent non-empty `agent_used` among `turns`
    pub current_agent: Option<AgentId>,
}

/// Sessions and their bounded turn history
#[derive(Debug)]
pub struct ConversationMemory {
    sessions: DashMap<String, SessionLog>,
    config: MemoryConfig,
}

impl ConversationMemory {
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            config: MemoryConfig {
                max_turns: config.max_turns.max(1),
                ..config
            },
        }
    }

    pub fn config(&self) -> MemoryConfig {
        self.config
    }

    /// Append a turn, evicting the oldest turns beyond `max_turns`
    pub fn add(&self, session_id: &str, turn: Turn) {
        let max_turns = self.config.max_turns;
        let len = {
            let mut log = self
                .sessions
                .entry(session_id.to_string())
                .or_insert_with(|| SessionLog::new(max_turns));
            log.turns.push_back(turn);
            while log.turns.len() > max_turns {
                log.turns.pop_front();
            }
            log.last_written = Instant::now();
            log.turns.len()
        };

        debug!(session_id = %session_id, turns = len, "Turn stored");

        if let Some(max_sessions) = self.config.max_sessions {
            self.enforce_session_bound(max_sessions, session_id);
        }
    }

    /// Owned copy of a session's turns, oldest first; empty when unknown
    pub fn get(&self, session_id: &str) -> Vec<Turn> {
        self.sessions
            .get(session_id)
            .map(|log| log.turns.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Turns and sticky agent read atomically
    pub fn snapshot(&self, session_id: &str) -> SessionSnapshot {
        self.sessions
            .get(session_id)
            .map(|log| SessionSnapshot {
                turns: log.turns.iter().cloned().collect(),
                current_agent: log.current_agent(),
            })
            .unwrap_or_default()
    }

    /// Most recent agent that handled this session, if any
    pub fn current_agent(&self, session_id: &str) -> Option<AgentId> {
        self.sessions
            .get(session_id)
            .and_then(|log| log.current_agent())
    }

    /// Forget a session; no-op when it does not exist
    pub fn clear(&self, session_id: &str) {
        if self.sessions.remove(session_id).is_some() {
            debug!(session_id = %session_id, "Session cleared");
        }
    }

    /// Turn count per session
    pub fn stats(&self) -> BTreeMap<String, usize> {
        self.sessions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().turns.len()))
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Drop sessions not written for at least `ttl`; returns how many went
    pub fn evict_idle(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let before = self.sessions.len();
        self.sessions
            .retain(|_, log| now.saturating_duration_since(log.last_written) < ttl);
        let evicted = before.saturating_sub(self.sessions.len());
        if evicted > 0 {
            debug!(evicted, "Evicted idle sessions");
        }
        evicted
    }

    fn enforce_session_bound(&self, max_sessions: usize, keep: &str) {
        while self.sessions.len() > max_sessions {
            let victim = self
                .sessions
                .iter()
                .filter(|entry| entry.key() != keep)
                .min_by_key(|entry| entry.value().last_written)
                .map(|entry| (entry.key().clone(), entry.value().last_written));

            let Some((victim, seen)) = victim else {
                break;
            };
            // A concurrent write refreshed it; let the next pass pick again
            if self
                .sessions
                .remove_if(&victim, |_, log| log.last_written == seen)
                .is_some()
            {
                debug!(session_id = %victim, "Evicted least recently written session");
            }
        }
    }
}

impl Default for ConversationMemory {
    fn default() -> Self {
        Self::new(MemoryConfig::default())
    }
}
