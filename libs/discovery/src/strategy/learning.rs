//! Q-learning for the ai-driven strategy
//!
//! State is the client key (or the service name when the client is
//! anonymous), actions are nodes. Selection is epsilon-greedy over the
//! learned values; every observed outcome moves the value towards its
//! reward with `Q ← Q + α(reward − Q)`.

use dashmap::DashMap;
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

use crate::clock::Clock;
use crate::config::LearningConfig;
use crate::registry::NodeSlot;

/// Reward for a failed request
pub const FAILURE_REWARD: f64 = -50.0;

/// `max(0, 100 - latency/10)` on success, `-50` on failure
pub fn reward(latency_ms: Option<f64>, success: bool) -> f64 {
    if success {
        (100.0 - latency_ms.unwrap_or(0.0) / 10.0).max(0.0)
    } else {
        FAILURE_REWARD
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LearningStats {
    pub states: usize,
    pub entries: usize,
    pub updates: u64,
    pub explorations: u64,
    pub pending: usize,
}

#[derive(Debug)]
pub struct QLearner {
    table: DashMap<(String, String), f64>,
    /// Node → (state, selected at) awaiting an outcome
    pending: DashMap<String, (String, Instant)>,
    config: RwLock<LearningConfig>,
    updates: AtomicU64,
    explorations: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl QLearner {
    pub fn new(config: LearningConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            table: DashMap::new(),
            pending: DashMap::new(),
            config: RwLock::new(config),
            updates: Default::default(),
            explorations: Default::default(),
            clock,
        }
    }

    pub fn update_config(&self, config: LearningConfig) {
        *self.config.write() = config;
    }

    pub fn q_value(&self, state: &str, node: &str) -> f64 {
        self.table
            .get(&(state.to_string(), node.to_string()))
            .map(|v| *v)
            .unwrap_or(0.0)
    }

    /// Epsilon-greedy choice; ties on Q go to the first candidate
    pub fn choose<R: Rng + ?Sized>(&self, state: &str, candidates: &[&NodeSlot], rng: &mut R) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let epsilon = self.config.read().epsilon;
        if rng.gen::<f64>() < epsilon {
            self.explorations.fetch_add(1, Ordering::Relaxed);
            return Some(rng.gen_range(0..candidates.len()));
        }

        let mut best = (0, f64::NEG_INFINITY);
        for (i, slot) in candidates.iter().enumerate() {
            let q = self.q_value(state, &slot.node.name);
            if q > best.1 {
                best = (i, q);
            }
        }
        Some(best.0)
    }

    /// Remember which state selected `node` so its next outcome is credited
    pub fn remember(&self, state: &str, node: &str) {
        self.pending
            .insert(node.to_string(), (state.to_string(), self.clock.now()));
    }

    /// Apply an outcome for an explicit state
    pub fn update(&self, state: &str, node: &str, reward: f64) -> f64 {
        let alpha = self.config.read().alpha;
        let mut entry = self
            .table
            .entry((state.to_string(), node.to_string()))
            .or_insert(0.0);
        let updated = *entry + alpha * (reward - *entry);
        *entry = updated;
        self.updates.fetch_add(1, Ordering::Relaxed);
        trace!("Q({}, {}) = {:.3}", state, node, updated);
        updated
    }

    /// Credit an outcome to the state that last selected `node`, if the
    /// selection is still recent
    pub fn observe(&self, node: &str, latency_ms: Option<f64>, success: bool) -> Option<f64> {
        let ttl: Duration = self.config.read().pending_ttl;
        let (_, (state, at)) = self.pending.remove(node)?;
        if self.clock.now().saturating_duration_since(at) > ttl {
            return None;
        }
        Some(self.update(&state, node, reward(latency_ms, success)))
    }

    pub fn forget_node(&self, node: &str) {
        self.pending.remove(node);
        self.table.retain(|(_, n), _| n != node);
    }

    pub fn stats(&self) -> LearningStats {
        let mut states: Vec<String> = self.table.iter().map(|e| e.key().0.clone()).collect();
        states.sort();
        states.dedup();
        LearningStats {
            states: states.len(),
            entries: self.table.len(),
            updates: self.updates.load(Ordering::Relaxed),
            explorations: self.explorations.load(Ordering::Relaxed),
            pending: self.pending.len(),
        }
    }

    pub(crate) fn entries(&self) -> Vec<(String, String, f64)> {
        self.table
            .iter()
            .map(|e| (e.key().0.clone(), e.key().1.clone(), *e.value()))
            .collect()
    }

    pub(crate) fn restore(&self, state: String, node: String, value: f64) {
        self.table.insert((state, node), value);
    }
}
