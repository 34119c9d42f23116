//! Per-node exponential backoff for unreachable peers.
//!
//! A node is backed off while `now < last_attempt + delay`. The first failure
//! sets `delay` to the base value, each further consecutive failure multiplies
//! it, and a success forgets the node entirely.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use super::NodeId;

/// Backoff state of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffEntry {
    /// When the last failed attempt happened.
    pub last_attempt: Instant,
    /// Cooldown after `last_attempt`.
    pub delay: Duration,
}

impl BackoffEntry {
    /// Whether the cooldown is still running at `now`.
    pub fn is_active(&self, now: Instant) -> bool {
        now < self.last_attempt + self.delay
    }
}

/// Growth parameters of the backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay after the first failure.
    pub base: Duration,
    /// Factor applied per consecutive failure.
    pub multiplier: u32,
    /// Upper bound of the delay.
    pub max: Duration,
}

impl BackoffPolicy {
    fn next_delay(&self, previous: Option<Duration>) -> Duration {
        match previous {
            None => self.base.min(self.max),
            Some(delay) => delay
                .checked_mul(self.multiplier)
                .unwrap_or(self.max)
                .min(self.max),
        }
    }
}

/// Backoff entries keyed by node id.
#[derive(Debug, Clone)]
pub struct BackoffTable {
    policy: BackoffPolicy,
    entries: HashMap<NodeId, BackoffEntry>,
}

impl BackoffTable {
    /// Empty table.
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            entries: HashMap::new(),
        }
    }

    /// Whether `node_id` is cooling down at `now`.
    pub fn is_backed_off(&self, node_id: &NodeId, now: Instant) -> bool {
        self.entries
            .get(node_id)
            .is_some_and(|entry| entry.is_active(now))
    }

    /// Record a failed attempt and return the new delay.
    pub fn record_failure(&mut self, node_id: &NodeId, now: Instant) -> Duration {
        let previous = self.entries.get(node_id).map(|e| e.delay);
        let delay = self.policy.next_delay(previous);
        self.entries.insert(
            node_id.clone(),
            BackoffEntry {
                last_attempt: now,
                delay,
            },
        );
        delay
    }

    /// Forget `node_id` after a success. Returns whether an entry existed.
    pub fn record_success(&mut self, node_id: &NodeId) -> bool {
        self.entries.remove(node_id).is_some()
    }

    /// Current entry of `node_id`.
    pub fn get(&self, node_id: &NodeId) -> Option<&BackoffEntry> {
        self.entries.get(node_id)
    }

    /// Number of tracked nodes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no node is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget every node.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
