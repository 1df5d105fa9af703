//! Discovery Engine
//!
//! [`DiscoveryEngine`] owns every component and is the single entry point
//! for callers: registration and leases, outcome feedback (circuit,
//! health, learning), traffic policies, discovery, snapshots and
//! configuration reloads. Share it by `Arc`.
//!
//! ## Discovery path
//!
//! 1. Promote circuits whose retry deadline passed (half-open).
//! 2. Resolve the service (or alias) and take its read lock.
//! 3. For cacheable strategies without traffic overrides, return a
//!    cached node if it is still eligible.
//! 4. Collect eligible candidates matching the tag/version/environment
//!    filter. None: `CircuitOpen` if open circuits are the reason,
//!    otherwise `NotFound`.
//! 5. Let the traffic router override or narrow the pick, then run the
//!    strategy.
//!
//! Every mutation that changes a service's eligible set invalidates its
//! cache entries before returning.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::cache::{CacheKey, CacheStats, DiscoveryCache};
use crate::circuit::{CircuitBreaker, CircuitState, CircuitTransition};
use crate::clock::{Clock, SystemClock};
use crate::config::{FeatureFlags, RegistryConfig};
use crate::federation::Federation;
use crate::health::HealthScorer;
use crate::lease::{LeaseManager, SweepReport};
use crate::model::{GeoPoint, Node, NodeInfo, ServiceKey};
use crate::registry::{NodeFilter, NodeSlot, Registry, ServiceEntry};
use crate::scheduler::TimerQueue;
use crate::snapshot::{self, ImportReport, SnapshotFormat};
use crate::strategy::geo::GeoResolver;
use crate::strategy::learning::LearningStats;
use crate::strategy::{SelectionContext, Strategy, StrategyEngine};
use crate::traffic::{Deployment, Routing, TrafficPolicy, TrafficRouter};
use crate::{RegistryError, Result};

/// One discovery query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryRequest {
    /// Qualified service name or alias
    pub service: String,
    /// Falls back to the configured default strategy
    pub strategy: Option<Strategy>,
    /// Hash / sticky / learning key, usually the caller's address or id
    pub client_key: Option<String>,
    pub tags: Vec<String>,
    pub version: Option<String>,
    pub environment: Option<String>,
    pub location: Option<GeoPoint>,
}

impl DiscoveryRequest {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            ..Default::default()
        }
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Strategy by id; unknown ids fall back to round-robin
    pub fn with_strategy_id(mut self, id: &str) -> Self {
        self.strategy = Some(Strategy::resolve(id));
        self
    }

    pub fn with_client(mut self, client_key: impl Into<String>) -> Self {
        self.client_key = Some(client_key.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    pub fn with_location(mut self, location: GeoPoint) -> Self {
        self.location = Some(location);
        self
    }

    pub fn filter(&self) -> NodeFilter {
        NodeFilter {
            tags: self.tags.clone(),
            version: self.version.clone(),
            environment: self.environment.clone(),
        }
    }
}

/// Point-in-time counters for dashboards and health endpoints
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub services: usize,
    pub nodes: usize,
    pub available: usize,
    pub open_circuits: usize,
    pub half_open_circuits: usize,
    pub maintenance: usize,
    pub self_preservation: bool,
    pub pending_timers: usize,
    pub sweeps: u64,
    pub evictions: u64,
    pub cache: CacheStats,
}

#[derive(Debug)]
pub struct DiscoveryEngine {
    config: RwLock<RegistryConfig>,
    clock: Arc<dyn Clock>,
    registry: Registry,
    leases: LeaseManager,
    breaker: CircuitBreaker,
    scorer: HealthScorer,
    strategies: StrategyEngine,
    router: TrafficRouter,
    cache: DiscoveryCache,
    federation: Federation,
    timers: Mutex<TimerQueue<String>>,
}

impl DiscoveryEngine {
    pub fn new(config: RegistryConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: RegistryConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let features = config.features;
        Ok(Self {
            registry: Registry::new(config.store.clone(), features.secondary_indices, clock.clone()),
            leases: LeaseManager::new(config.lease.clone()),
            breaker: CircuitBreaker::new(config.circuit.clone()),
            scorer: HealthScorer::new(config.health.clone(), features.health_scoring),
            strategies: StrategyEngine::new(
                &config.store,
                config.learning.clone(),
                config.health.trend_window,
                clock.clone(),
            ),
            router: TrafficRouter::new(features.traffic_routing, config.store.rng_seed),
            cache: DiscoveryCache::new(config.cache.clone(), clock.clone()),
            federation: Federation::new(config.federation.query_timeout),
            timers: Mutex::new(TimerQueue::new()),
            config: RwLock::new(config),
            clock,
        })
    }

    pub fn config(&self) -> RegistryConfig {
        self.config.read().clone()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn federation(&self) -> &Federation {
        &self.federation
    }

    pub fn set_geo_resolver(&self, resolver: Arc<dyn GeoResolver>) {
        self.strategies.set_geo_resolver(resolver);
    }

    fn features(&self) -> FeatureFlags {
        self.config.read().features
    }

    fn invalidate(&self, service: &str) {
        self.cache.invalidate(service);
    }

    /// Alias target when `name` is not itself a registered service
    fn canonical(&self, name: &str) -> String {
        self.registry
            .resolve(name)
            .map(|(service, _)| service)
            .unwrap_or_else(|| name.to_string())
    }

    // ------------------------------------------------------------------
    // Registration and leases
    // ------------------------------------------------------------------

    /// Register (or renew) a node; returns its name
    ///
    /// Renewing a live node keeps its registered tags, weight, version and
    /// metadata.
    pub fn register(&self, key: &ServiceKey, info: &NodeInfo) -> Result<String> {
        let registration = self.registry.register(key, info)?;
        if let Some(old) = &registration.moved_from {
            self.forget(&registration.node);
            self.invalidate(old);
        }
        self.invalidate(&registration.service);
        Ok(registration.node)
    }

    /// Renew a node's lease; `false` for unknown nodes
    pub fn heartbeat(&self, node: &str) -> bool {
        match self.registry.heartbeat(node) {
            Some((service, reinstated)) => {
                if reinstated {
                    debug!("Node {} reinstated by heartbeat", node);
                    self.invalidate(&service);
                }
                true
            }
            None => false,
        }
    }

    /// Remove a node; `false` for unknown nodes
    pub fn deregister(&self, node: &str) -> bool {
        match self.registry.deregister(node) {
            Some(service) => {
                self.forget(node);
                self.invalidate(&service);
                true
            }
            None => false,
        }
    }

    fn forget(&self, node: &str) {
        self.strategies.forget_node(node);
        self.timers.lock().cancel(&node.to_string());
    }

    /// Run one lease sweep
    pub fn sweep(&self) -> SweepReport {
        self.leases.sweep(
            &self.registry,
            |service| self.invalidate(service),
            |service, node| {
                self.forget(node);
                self.invalidate(service);
            },
        )
    }

    pub fn in_self_preservation(&self) -> bool {
        self.leases.in_self_preservation()
    }

    /// Take a node out of (or back into) rotation without deregistering
    pub fn set_maintenance(&self, node: &str, maintenance: bool) -> bool {
        let Some(update) = self.registry.update_node(node, |slot| slot.maintenance = maintenance) else {
            return false;
        };
        if update.view_changed {
            info!(
                "Node {} {} maintenance",
                node,
                if maintenance { "entered" } else { "left" }
            );
            self.invalidate(&update.service);
        }
        true
    }

    pub fn acquire_connection(&self, node: &str) -> bool {
        self.registry
            .update_node(node, |slot| {
                slot.node.connections = slot.node.connections.saturating_add(1);
            })
            .is_some()
    }

    pub fn release_connection(&self, node: &str) -> bool {
        self.registry
            .update_node(node, |slot| {
                slot.node.connections = slot.node.connections.saturating_sub(1);
            })
            .is_some()
    }

    pub fn set_alias(&self, alias: impl Into<String>, target: impl Into<String>) -> Result<()> {
        let alias = alias.into();
        self.registry.set_alias(alias.clone(), target)?;
        self.invalidate(&alias);
        Ok(())
    }

    pub fn remove_alias(&self, alias: &str) -> bool {
        self.registry.remove_alias(alias)
    }

    // ------------------------------------------------------------------
    // Outcome feedback
    // ------------------------------------------------------------------

    /// Count a failed request; returns the resulting circuit state
    pub fn record_failure(&self, node: &str) -> Option<CircuitState> {
        let now = self.clock.now();
        let wall_ms = self.clock.wall_ms();
        let update = self.registry.update_node(node, |slot| {
            let transition = self.breaker.on_failure(node, &mut slot.circuit, now);
            slot.sync_circuit(Some(wall_ms));
            slot.score = self.scorer.score(&slot.stats, &slot.circuit);
            (transition, slot.circuit.state)
        })?;

        let (transition, state) = update.value;
        if let CircuitTransition::Opened { retry_at } = transition {
            self.timers.lock().schedule(node.to_string(), retry_at);
        }
        if update.view_changed {
            self.invalidate(&update.service);
        }
        self.strategies.learner().observe(node, None, false);
        Some(state)
    }

    /// Count a successful request; always closes the circuit
    pub fn record_success(&self, node: &str) -> Option<CircuitState> {
        let update = self.registry.update_node(node, |slot| {
            let transition = self.breaker.on_success(node, &mut slot.circuit);
            slot.sync_circuit(None);
            slot.score = self.scorer.score(&slot.stats, &slot.circuit);
            (transition, slot.circuit.state)
        })?;

        let (transition, state) = update.value;
        if transition.changed() {
            self.timers.lock().cancel(&node.to_string());
        }
        if update.view_changed {
            self.invalidate(&update.service);
        }
        Some(state)
    }

    /// Add a latency sample; `false` for unknown nodes or invalid samples
    pub fn record_response_time(&self, node: &str, latency_ms: f64) -> bool {
        if !latency_ms.is_finite() || latency_ms < 0.0 {
            debug!("Ignoring invalid response time {} for {}", latency_ms, node);
            return false;
        }
        let window = self.scorer.response_window();
        let recorded = self
            .registry
            .update_node(node, |slot| {
                slot.stats.record(latency_ms, window);
                slot.score = self.scorer.score(&slot.stats, &slot.circuit);
            })
            .is_some();
        if recorded {
            self.strategies.learner().observe(node, Some(latency_ms), true);
        }
        recorded
    }

    /// Promote open circuits whose retry deadline has passed
    pub fn pump_timers(&self) -> usize {
        let now = self.clock.now();
        let due = {
            let mut timers = self.timers.lock();
            match timers.next_deadline() {
                Some(deadline) if deadline <= now => timers.pop_due(now),
                _ => return 0,
            }
        };

        let mut promoted = 0;
        for node in due {
            let Some(update) = self
                .registry
                .update_node(&node, |slot| self.breaker.on_poll(&node, &mut slot.circuit, now))
            else {
                continue;
            };
            if update.value == CircuitTransition::HalfOpened {
                promoted += 1;
            }
            if update.view_changed {
                self.invalidate(&update.service);
            }
        }
        promoted
    }

    /// Recompute every node's health score
    pub fn rescore_all(&self) -> usize {
        let mut scored = 0;
        for handle in self.registry.handles() {
            let mut entry = handle.write();
            for slot in entry.slots_mut() {
                slot.score = self.scorer.score(&slot.stats, &slot.circuit);
                scored += 1;
            }
        }
        scored
    }

    // ------------------------------------------------------------------
    // Traffic policies
    // ------------------------------------------------------------------

    pub fn set_canary(&self, service: &str, percentage: f64, nodes: Vec<String>) -> Result<()> {
        let service = self.canonical(service);
        self.router.set_canary(&service, percentage, nodes)?;
        self.invalidate(&service);
        Ok(())
    }

    pub fn set_blue_green(
        &self,
        service: &str,
        blue: Vec<String>,
        green: Vec<String>,
        active: Deployment,
    ) -> Result<()> {
        let service = self.canonical(service);
        self.router.set_blue_green(&service, blue, green, active)?;
        self.invalidate(&service);
        Ok(())
    }

    pub fn switch_deployment(&self, service: &str, active: Deployment) -> bool {
        let service = self.canonical(service);
        let switched = self.router.switch_deployment(&service, active);
        self.invalidate(&service);
        switched
    }

    pub fn set_traffic_split(&self, service: &str, weights: BTreeMap<String, f64>) -> Result<()> {
        let service = self.canonical(service);
        self.router.set_traffic_split(&service, weights)?;
        self.invalidate(&service);
        Ok(())
    }

    pub fn clear_traffic_policy(&self, service: &str) -> bool {
        let service = self.canonical(service);
        let cleared = self.router.clear(&service);
        self.invalidate(&service);
        cleared
    }

    pub fn traffic_policy(&self, service: &str) -> Option<TrafficPolicy> {
        self.router.policy(&self.canonical(service))
    }

    // ------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------

    /// Select one eligible node for the request
    pub fn discover(&self, request: &DiscoveryRequest) -> Result<Node> {
        self.pump_timers();

        let strategy = request
            .strategy
            .unwrap_or_else(|| self.config.read().store.default_strategy);
        let Some((service, handle)) = self.registry.resolve(&request.service) else {
            return Err(RegistryError::not_found(&request.service, "service is not registered"));
        };

        let features = self.features();
        let routed = features.traffic_routing && self.router.has_policy(&service);
        self.cache.record_access(&service);
        let origin = match strategy {
            Strategy::GeoAware => self
                .strategies
                .geo_origin(request.location, request.client_key.as_deref()),
            _ => None,
        };
        let cacheable = strategy.is_cacheable()
            && !routed
            && self.cache.is_enabled()
            && (!strategy.keys_on_client() || request.client_key.is_some())
            && (strategy != Strategy::GeoAware || origin.is_some());
        let cache_key = cacheable.then(|| {
            CacheKey::new(
                strategy,
                request.client_key.as_deref(),
                &request.tags,
                request.version.as_deref(),
                request.environment.as_deref(),
            )
            .with_origin(origin)
        });

        let filter = request.filter();
        let entry = handle.read();

        if let Some(key) = &cache_key {
            if let Some(cached) = self.cache.get(&service, key) {
                if let Some(slot) = entry.slot(&cached).filter(|s| s.eligible() && filter.matches(&s.node)) {
                    return Ok(slot.node.clone());
                }
            }
        }

        let candidates = entry.candidates(&filter);
        if candidates.is_empty() {
            return Err(unavailable(&service, &entry, &filter));
        }

        let routing = if features.traffic_routing {
            self.router.route(&service, &candidates, entry.override_cursor())
        } else {
            Routing::Delegate
        };

        let ctx = SelectionContext::new(&service, entry.cursor())
            .with_client(request.client_key.as_deref())
            .with_location(request.location);

        let chosen: &NodeSlot = match routing {
            Routing::Override { index, kind } => {
                debug!("{:?} override for {} chose {}", kind, service, candidates[index].node.name);
                candidates[index]
            }
            Routing::Restrict { version } => {
                let narrowed: Vec<&NodeSlot> = candidates
                    .iter()
                    .copied()
                    .filter(|s| s.node.version.as_deref() == Some(version.as_str()))
                    .collect();
                let pool = if narrowed.is_empty() { &candidates } else { &narrowed };
                self.select(strategy, pool, &ctx)?
            }
            Routing::Delegate => {
                let ctx = if filter.is_empty() {
                    ctx.with_aux(entry.min_connections(), entry.min_response_time())
                } else {
                    ctx
                };
                self.select(strategy, &candidates, &ctx)?
            }
        };

        // Without coordinates on any candidate geo-aware drew at random
        let drawn_at_random = strategy == Strategy::GeoAware && chosen.node.location().is_none();
        if let Some(key) = cache_key.filter(|_| !drawn_at_random) {
            // Inserted under the read lock so no mutation can slip between
            // the selection and the insert
            self.cache.put(&service, key, chosen.node.name.clone());
        }
        Ok(chosen.node.clone())
    }

    fn select<'a>(
        &self,
        strategy: Strategy,
        pool: &[&'a NodeSlot],
        ctx: &SelectionContext<'_>,
    ) -> Result<&'a NodeSlot> {
        self.strategies
            .select(strategy, pool, ctx)
            .and_then(|index| pool.get(index).copied())
            .ok_or_else(|| RegistryError::not_found(ctx.service, "strategy produced no selection"))
    }

    /// Local discovery, falling back to federation peers when the local
    /// registry has nothing eligible
    pub async fn discover_federated(&self, request: &DiscoveryRequest) -> Result<Node> {
        match self.discover(request) {
            Ok(node) => Ok(node),
            Err(local @ (RegistryError::NotFound { .. } | RegistryError::CircuitOpen { .. })) => {
                if self.federation.is_empty() {
                    return Err(local);
                }
                match self.federation.discover(request).await {
                    Some((peer, node)) => {
                        debug!("Federated answer for {} from {}", request.service, peer);
                        Ok(node)
                    }
                    None => Err(local),
                }
            }
            Err(e) => Err(e),
        }
    }

    // ------------------------------------------------------------------
    // Snapshots and configuration
    // ------------------------------------------------------------------

    pub fn export(&self) -> Result<Vec<u8>> {
        self.export_as(SnapshotFormat::Json)
    }

    pub fn export_as(&self, format: SnapshotFormat) -> Result<Vec<u8>> {
        let captured = snapshot::capture(&self.registry, &self.router, &self.strategies);
        snapshot::encode(&captured, format)
    }

    /// Restore a snapshot produced by [`export`](Self::export)
    pub fn import(&self, bytes: &[u8]) -> Result<ImportReport> {
        let decoded = snapshot::decode(bytes)?;
        let report = snapshot::restore(
            decoded,
            &self.registry,
            &self.router,
            &self.strategies,
            self.scorer.response_window(),
        )?;
        {
            let mut timers = self.timers.lock();
            for (node, retry_at) in &report.retry_timers {
                timers.schedule(node.clone(), *retry_at);
            }
        }
        self.rescore_all();
        self.cache.clear();
        Ok(report)
    }

    /// Validate and apply a new configuration to every component
    pub fn reload_config(&self, config: RegistryConfig) -> Result<()> {
        config.validate()?;
        let features = config.features;
        self.registry
            .update_config(config.store.clone(), features.secondary_indices);
        self.leases.update_config(config.lease.clone());
        self.breaker.update_config(config.circuit.clone());
        self.scorer
            .update(config.health.clone(), features.health_scoring);
        self.strategies
            .update_config(&config.store, config.learning.clone(), config.health.trend_window);
        self.router.set_enabled(features.traffic_routing);
        self.cache.update_config(config.cache.clone());
        self.federation
            .set_timeout(config.federation.query_timeout);
        *self.config.write() = config;

        self.rescore_all();
        self.cache.clear();
        info!("Registry configuration reloaded");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn services(&self) -> Vec<String> {
        self.registry.service_names()
    }

    pub fn service_nodes(&self, service: &str) -> Vec<Node> {
        self.registry.service_nodes(service)
    }

    pub fn node(&self, name: &str) -> Option<Node> {
        self.registry.node(name)
    }

    pub fn nodes_with_tag(&self, tag: &str) -> Vec<String> {
        self.registry.nodes_with_tag(tag)
    }

    pub fn aliases(&self) -> Vec<(String, String)> {
        self.registry.aliases()
    }

    pub fn circuit_state(&self, node: &str) -> Option<CircuitState> {
        self.inspect(node, |slot| slot.circuit_state())
    }

    pub fn health_score(&self, node: &str) -> Option<f64> {
        self.inspect(node, |slot| slot.score)
    }

    pub fn average_response_time(&self, node: &str) -> Option<f64> {
        self.inspect(node, |slot| slot.stats.average())
    }

    fn inspect<R>(&self, node: &str, f: impl FnOnce(&NodeSlot) -> R) -> Option<R> {
        let service = self.registry.owner_of(node)?;
        let handle = self.registry.handle(&service)?;
        let entry = handle.read();
        entry.slot(node).map(f)
    }

    /// Registered nodes outside maintenance, for health probing
    pub fn probe_targets(&self) -> Vec<Node> {
        let mut nodes = Vec::new();
        for handle in self.registry.handles() {
            let entry = handle.read();
            nodes.extend(
                entry
                    .ordered_slots()
                    .into_iter()
                    .filter(|s| !s.maintenance)
                    .map(|s| s.node.clone()),
            );
        }
        nodes
    }

    pub fn learning_stats(&self) -> LearningStats {
        self.strategies.learner().stats()
    }

    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            services: self.registry.service_count(),
            nodes: self.registry.node_count(),
            self_preservation: self.leases.in_self_preservation(),
            pending_timers: self.timers.lock().len(),
            sweeps: self.leases.sweeps(),
            evictions: self.leases.evictions(),
            cache: self.cache.stats(),
            ..Default::default()
        };
        for handle in self.registry.handles() {
            let entry = handle.read();
            stats.available += entry.available_len();
            for slot in entry.slots() {
                match slot.circuit_state() {
                    CircuitState::Open => stats.open_circuits += 1,
                    CircuitState::HalfOpen => stats.half_open_circuits += 1,
                    CircuitState::Closed => {}
                }
                if slot.maintenance {
                    stats.maintenance += 1;
                }
            }
        }
        stats
    }

    /// Assert registry-wide consistency
    pub fn check_invariants(&self) {
        self.registry.check_invariants();
    }
}

/// Why a service with no eligible candidate is unavailable
fn unavailable(service: &str, entry: &ServiceEntry, filter: &NodeFilter) -> RegistryError {
    let open = entry
        .slots()
        .filter(|s| s.circuit.is_open() && s.node.healthy && !s.maintenance && filter.matches(&s.node))
        .count();
    if open > 0 {
        RegistryError::circuit_open(service, open)
    } else if entry.is_empty() {
        RegistryError::not_found(service, "service has no nodes")
    } else {
        RegistryError::not_found(service, "no eligible node matches the request")
    }
}
