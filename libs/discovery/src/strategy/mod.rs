//! Strategy Engine
//!
//! Load-balancing algorithms over the eligible candidates of one service.
//! Every strategy is a function of `(candidates, context)` returning the
//! index of the chosen candidate; per-strategy state (round-robin cursor,
//! sticky assignments, Q-table) lives either on the service entry or in
//! the [`StrategyEngine`].
//!
//! ## Strategies
//!
//! | id | picks |
//! |---|---|
//! | `round-robin` | next in rotation |
//! | `random` | uniform |
//! | `weighted-random` | proportional to weight |
//! | `least-connections` | fewest in-flight |
//! | `weighted-least-connections` | fewest in-flight per weight |
//! | `consistent-hash` | hash ring position of the client key |
//! | `ip-hash` / `hash` | client key hash modulo count |
//! | `rendezvous-hash` | highest hash of (client, node) |
//! | `geo-aware` | nearest by great-circle distance |
//! | `least-response-time` | lowest average latency |
//! | `health-score` | highest score |
//! | `predictive` | most improving latency trend |
//! | `ai-driven` | epsilon-greedy over learned Q-values |
//! | `power-of-two-choices` | less loaded of two random picks |
//! | `cost-aware` | cheapest tier, then least loaded |
//! | `sticky` | previous pick for the client |
//! | `adaptive` | best latency/load blend of a small sample |
//!
//! Unknown identifiers resolve to round-robin.

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::warn;

pub mod adaptive;
pub mod basic;
pub mod geo;
pub mod hashing;
pub mod learning;

pub use geo::{haversine_km, GeoResolver, StaticGeoResolver};
pub use learning::{LearningStats, QLearner};

use crate::clock::Clock;
use crate::config::{LearningConfig, StoreConfig};
use crate::model::GeoPoint;
use crate::registry::NodeSlot;
use crate::RegistryError;

/// Load-balancing strategy identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    RoundRobin,
    Random,
    WeightedRandom,
    LeastConnections,
    WeightedLeastConnections,
    ConsistentHash,
    IpHash,
    RendezvousHash,
    GeoAware,
    LeastResponseTime,
    HealthScore,
    Predictive,
    AiDriven,
    PowerOfTwoChoices,
    CostAware,
    Sticky,
    Adaptive,
}

impl Strategy {
    pub const ALL: [Strategy; 17] = [
        Strategy::RoundRobin,
        Strategy::Random,
        Strategy::WeightedRandom,
        Strategy::LeastConnections,
        Strategy::WeightedLeastConnections,
        Strategy::ConsistentHash,
        Strategy::IpHash,
        Strategy::RendezvousHash,
        Strategy::GeoAware,
        Strategy::LeastResponseTime,
        Strategy::HealthScore,
        Strategy::Predictive,
        Strategy::AiDriven,
        Strategy::PowerOfTwoChoices,
        Strategy::CostAware,
        Strategy::Sticky,
        Strategy::Adaptive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::RoundRobin => "round-robin",
            Strategy::Random => "random",
            Strategy::WeightedRandom => "weighted-random",
            Strategy::LeastConnections => "least-connections",
            Strategy::WeightedLeastConnections => "weighted-least-connections",
            Strategy::ConsistentHash => "consistent-hash",
            Strategy::IpHash => "ip-hash",
            Strategy::RendezvousHash => "rendezvous-hash",
            Strategy::GeoAware => "geo-aware",
            Strategy::LeastResponseTime => "least-response-time",
            Strategy::HealthScore => "health-score",
            Strategy::Predictive => "predictive",
            Strategy::AiDriven => "ai-driven",
            Strategy::PowerOfTwoChoices => "power-of-two-choices",
            Strategy::CostAware => "cost-aware",
            Strategy::Sticky => "sticky",
            Strategy::Adaptive => "adaptive",
        }
    }

    /// Parse an identifier, accepting the common aliases
    pub fn from_id(id: &str) -> Option<Self> {
        let normalized = id.trim().to_ascii_lowercase().replace('_', "-");
        let strategy = match normalized.as_str() {
            "round-robin" | "rr" => Strategy::RoundRobin,
            "random" => Strategy::Random,
            "weighted-random" | "weighted" => Strategy::WeightedRandom,
            "least-connections" => Strategy::LeastConnections,
            "weighted-least-connections" => Strategy::WeightedLeastConnections,
            "consistent-hash" => Strategy::ConsistentHash,
            "ip-hash" | "hash" => Strategy::IpHash,
            "rendezvous-hash" | "rendezvous" => Strategy::RendezvousHash,
            "geo-aware" | "geo" => Strategy::GeoAware,
            "least-response-time" => Strategy::LeastResponseTime,
            "health-score" => Strategy::HealthScore,
            "predictive" => Strategy::Predictive,
            "ai-driven" | "ai" => Strategy::AiDriven,
            "power-of-two-choices" | "power-of-two" | "p2c" => Strategy::PowerOfTwoChoices,
            "cost-aware" => Strategy::CostAware,
            "sticky" => Strategy::Sticky,
            "adaptive" => Strategy::Adaptive,
            _ => return None,
        };
        Some(strategy)
    }

    /// Parse an identifier, falling back to round-robin
    pub fn resolve(id: &str) -> Self {
        Self::from_id(id).unwrap_or_else(|| {
            warn!("Unknown strategy '{}', falling back to round-robin", id);
            Strategy::RoundRobin
        })
    }

    /// Hash-family strategies that rotate when the request has no client key
    pub fn keys_on_client(&self) -> bool {
        matches!(
            self,
            Strategy::ConsistentHash | Strategy::IpHash | Strategy::RendezvousHash | Strategy::Sticky
        )
    }

    /// Whether the answer for a fixed request is stable enough to cache
    ///
    /// Rotation and random draws would be frozen by a cache.
    pub fn is_cacheable(&self) -> bool {
        matches!(
            self,
            Strategy::ConsistentHash
                | Strategy::IpHash
                | Strategy::RendezvousHash
                | Strategy::Sticky
                | Strategy::GeoAware
                | Strategy::LeastResponseTime
                | Strategy::HealthScore
                | Strategy::Predictive
                | Strategy::CostAware
        )
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_id(s).ok_or_else(|| {
            RegistryError::validation(format!("unknown strategy '{}'", s), Some("strategy"))
        })
    }
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::RoundRobin
    }
}

/// Per-call inputs beyond the candidate list
#[derive(Debug, Clone, Copy)]
pub struct SelectionContext<'a> {
    pub service: &'a str,
    pub client_key: Option<&'a str>,
    pub client_location: Option<GeoPoint>,
    /// Service round-robin cursor
    pub cursor: &'a AtomicUsize,
    /// Precomputed minimums, valid only when candidates are the full view
    pub min_connections: Option<&'a str>,
    pub min_response_time: Option<&'a str>,
}

impl<'a> SelectionContext<'a> {
    pub fn new(service: &'a str, cursor: &'a AtomicUsize) -> Self {
        Self {
            service,
            client_key: None,
            client_location: None,
            cursor,
            min_connections: None,
            min_response_time: None,
        }
    }

    pub fn with_client(mut self, client_key: Option<&'a str>) -> Self {
        self.client_key = client_key;
        self
    }

    pub fn with_location(mut self, location: Option<GeoPoint>) -> Self {
        self.client_location = location;
        self
    }

    pub fn with_aux(mut self, min_connections: Option<&'a str>, min_response_time: Option<&'a str>) -> Self {
        self.min_connections = min_connections;
        self.min_response_time = min_response_time;
        self
    }

    /// Key used as Q-learning state: the client when known, else the service
    pub fn learning_state(&self) -> &'a str {
        self.client_key.unwrap_or(self.service)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EngineSettings {
    hash_ring_replicas: usize,
    trend_window: usize,
}

/// Dispatches to the strategy implementations and owns their state
pub struct StrategyEngine {
    rng: Mutex<StdRng>,
    sticky: DashMap<(String, String), String>,
    learner: QLearner,
    geo: RwLock<Arc<dyn GeoResolver>>,
    settings: RwLock<EngineSettings>,
}

impl fmt::Debug for StrategyEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrategyEngine")
            .field("sticky_assignments", &self.sticky.len())
            .field("learner", &self.learner)
            .field("settings", &*self.settings.read())
            .finish()
    }
}

impl StrategyEngine {
    pub fn new(store: &StoreConfig, learning: LearningConfig, trend_window: usize, clock: Arc<dyn Clock>) -> Self {
        let rng = match store.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rng: Mutex::new(rng),
            sticky: DashMap::new(),
            learner: QLearner::new(learning, clock),
            geo: RwLock::new(Arc::new(StaticGeoResolver::default())),
            settings: RwLock::new(EngineSettings {
                hash_ring_replicas: store.hash_ring_replicas,
                trend_window,
            }),
        }
    }

    pub fn update_config(&self, store: &StoreConfig, learning: LearningConfig, trend_window: usize) {
        *self.settings.write() = EngineSettings {
            hash_ring_replicas: store.hash_ring_replicas,
            trend_window,
        };
        self.learner.update_config(learning);
    }

    pub fn set_geo_resolver(&self, resolver: Arc<dyn GeoResolver>) {
        *self.geo.write() = resolver;
    }

    pub fn learner(&self) -> &QLearner {
        &self.learner
    }

    /// Choose one candidate; `None` only when `candidates` is empty
    pub fn select(&self, strategy: Strategy, candidates: &[&NodeSlot], ctx: &SelectionContext<'_>) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let settings = *self.settings.read();

        match strategy {
            Strategy::RoundRobin => Some(basic::round_robin(candidates.len(), ctx.cursor)),
            Strategy::Random => Some(basic::random(candidates.len(), &mut *self.rng.lock())),
            Strategy::WeightedRandom => basic::weighted_random(candidates, &mut *self.rng.lock()),
            Strategy::LeastConnections => {
                basic::indexed_minimum(candidates, ctx.min_connections)
                    .or_else(|| basic::least_connections(candidates))
            }
            Strategy::WeightedLeastConnections => basic::weighted_least_connections(candidates),
            Strategy::PowerOfTwoChoices => basic::power_of_two(candidates, &mut *self.rng.lock()),
            Strategy::CostAware => basic::cost_aware(candidates),
            Strategy::ConsistentHash => match ctx.client_key {
                Some(key) => hashing::consistent_hash(candidates, key, settings.hash_ring_replicas),
                None => Some(basic::round_robin(candidates.len(), ctx.cursor)),
            },
            Strategy::IpHash => match ctx.client_key {
                Some(key) => Some(hashing::modulo_hash(candidates.len(), key)),
                None => Some(basic::round_robin(candidates.len(), ctx.cursor)),
            },
            Strategy::RendezvousHash => match ctx.client_key {
                Some(key) => hashing::rendezvous(candidates, key),
                None => Some(basic::round_robin(candidates.len(), ctx.cursor)),
            },
            Strategy::Sticky => match ctx.client_key {
                Some(key) => Some(self.sticky(candidates, ctx.service, key)),
                None => Some(basic::round_robin(candidates.len(), ctx.cursor)),
            },
            Strategy::GeoAware => {
                geo::nearest(candidates, self.geo_origin(ctx.client_location, ctx.client_key))
                    .or_else(|| Some(basic::random(candidates.len(), &mut *self.rng.lock())))
            }
            Strategy::LeastResponseTime => basic::indexed_minimum(candidates, ctx.min_response_time)
                .or_else(|| adaptive::least_response_time(candidates)),
            Strategy::HealthScore => adaptive::health_score(candidates),
            Strategy::Predictive => adaptive::predictive(candidates, settings.trend_window),
            Strategy::Adaptive => adaptive::sampled(candidates, &mut *self.rng.lock()),
            Strategy::AiDriven => {
                let state = ctx.learning_state();
                let choice = self.learner.choose(state, candidates, &mut *self.rng.lock());
                if let Some(index) = choice {
                    self.learner.remember(state, &candidates[index].node.name);
                }
                choice
            }
        }
    }

    /// Client coordinates: the request's own, else the resolver's
    pub fn geo_origin(&self, location: Option<GeoPoint>, client_key: Option<&str>) -> Option<GeoPoint> {
        location.or_else(|| client_key.and_then(|key| self.geo.read().locate(key)))
    }

    fn sticky(&self, candidates: &[&NodeSlot], service: &str, client: &str) -> usize {
        let key = (service.to_string(), client.to_string());
        if let Some(assigned) = self.sticky.get(&key) {
            if let Some(index) = candidates.iter().position(|s| s.node.name == *assigned) {
                return index;
            }
        }
        let index = hashing::modulo_hash(candidates.len(), client);
        self.sticky.insert(key, candidates[index].node.name.clone());
        index
    }

    /// Forget sticky assignments pointing at a removed node
    pub fn forget_node(&self, node: &str) {
        self.sticky.retain(|_, assigned| assigned != node);
        self.learner.forget_node(node);
    }

    pub fn sticky_assignments(&self) -> usize {
        self.sticky.len()
    }

    pub(crate) fn sticky_snapshot(&self) -> Vec<(String, String, String)> {
        self.sticky
            .iter()
            .map(|e| (e.key().0.clone(), e.key().1.clone(), e.value().clone()))
            .collect()
    }

    pub(crate) fn restore_sticky(&self, service: String, client: String, node: String) {
        self.sticky.insert((service, client), node);
    }
}

/// Index of the candidate named `name`
pub(crate) fn position_of(candidates: &[&NodeSlot], name: &str) -> Option<usize> {
    candidates.iter().position(|s| s.node.name == name)
}

/// Advance a cursor modulo `len`
pub(crate) fn rotate(cursor: &AtomicUsize, len: usize) -> usize {
    cursor.fetch_add(1, Ordering::Relaxed) % len
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::model::{Node, NodeInfo};
    use std::time::Instant;

    pub fn slot(port: u16) -> NodeSlot {
        slot_with(NodeInfo::new("10.0.0.1", port))
    }

    pub fn slot_with(info: NodeInfo) -> NodeSlot {
        let seq = info.port as u64;
        NodeSlot::new(Node::from_info("svc", &info, 1), seq, Instant::now(), false)
    }

    pub fn refs(slots: &[NodeSlot]) -> Vec<&NodeSlot> {
        slots.iter().collect()
    }

    pub fn engine(seed: u64) -> StrategyEngine {
        let mut config = crate::RegistryConfig::default();
        config.store.rng_seed = Some(seed);
        let clock = Arc::new(crate::clock::ManualClock::new());
        StrategyEngine::new(&config.store, config.learning.clone(), config.health.trend_window, clock)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_identifier_round_trip_and_aliases() {
        for strategy in Strategy::ALL {
            assert_eq!(Strategy::from_id(strategy.as_str()), Some(strategy));
            assert_eq!(strategy.to_string().parse::<Strategy>().unwrap(), strategy);
        }
        assert_eq!(Strategy::from_id("hash"), Some(Strategy::IpHash));
        assert_eq!(Strategy::from_id("P2C"), Some(Strategy::PowerOfTwoChoices));
        assert_eq!(Strategy::from_id("least_connections"), Some(Strategy::LeastConnections));
    }

    #[test]
    fn test_unknown_strategy_falls_back_to_round_robin() {
        assert_eq!(Strategy::resolve("telepathy"), Strategy::RoundRobin);
        assert!("telepathy".parse::<Strategy>().is_err());
    }

    #[test]
    fn test_every_strategy_selects_from_non_empty_set() {
        let engine = engine(7);
        let slots: Vec<NodeSlot> = (1..=4).map(slot).collect();
        let candidates = refs(&slots);
        let cursor = AtomicUsize::new(0);
        let ctx = SelectionContext::new("svc", &cursor).with_client(Some("client-1"));

        for strategy in Strategy::ALL {
            let index = engine.select(strategy, &candidates, &ctx);
            assert!(matches!(index, Some(i) if i < candidates.len()), "{}", strategy);
            assert_eq!(engine.select(strategy, &[], &ctx), None);
        }
    }

    #[test]
    fn test_sticky_remembers_until_node_leaves() {
        let engine = engine(1);
        let slots: Vec<NodeSlot> = (1..=5).map(slot).collect();
        let cursor = AtomicUsize::new(0);
        let ctx = SelectionContext::new("svc", &cursor).with_client(Some("alice"));

        let first = engine.select(Strategy::Sticky, &refs(&slots), &ctx).unwrap();
        let chosen = slots[first].node.name.clone();
        for _ in 0..10 {
            let again = engine.select(Strategy::Sticky, &refs(&slots), &ctx).unwrap();
            assert_eq!(slots[again].node.name, chosen);
        }

        let remaining: Vec<NodeSlot> = slots.iter().filter(|s| s.node.name != chosen).cloned().collect();
        let next = engine.select(Strategy::Sticky, &refs(&remaining), &ctx).unwrap();
        assert_ne!(remaining[next].node.name, chosen);
        assert_eq!(engine.sticky_assignments(), 1);
    }

    #[test]
    fn test_least_connections_uses_index_only_when_present() {
        let engine = engine(1);
        let mut slots: Vec<NodeSlot> = (1..=3).map(slot).collect();
        slots[0].node.connections = 4;
        slots[1].node.connections = 1;
        slots[2].node.connections = 1;
        let cursor = AtomicUsize::new(0);

        let ctx = SelectionContext::new("svc", &cursor);
        assert_eq!(engine.select(Strategy::LeastConnections, &refs(&slots), &ctx), Some(1));

        let ctx = ctx.with_aux(Some("10.0.0.1:3"), None);
        assert_eq!(engine.select(Strategy::LeastConnections, &refs(&slots), &ctx), Some(2));
    }
}
