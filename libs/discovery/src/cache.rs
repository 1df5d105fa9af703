//! Discovery Cache
//!
//! Memoizes `(service, strategy, client, origin, tags, version,
//! environment)` → node name. Entries are grouped per service so invalidating a service
//! is a single removal. TTLs adapt to how often a service is looked up:
//!
//! ```text
//! instant_hz = 1000 / ms_since_previous_lookup
//! ema_hz     = α·instant_hz + (1-α)·ema_hz
//! ttl        = min(base_ttl + ema_hz · ttl_per_hz, max_ttl)
//! ```
//!
//! Hot services keep answers longer; every mutation of a service drops
//! its entries synchronously, so a longer TTL never serves a removed or
//! ineligible node.

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::model::GeoPoint;
use crate::strategy::Strategy;

/// Everything besides the service that shapes a discovery answer
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub strategy: Strategy,
    pub client: Option<String>,
    /// Exact bits of the resolved client latitude and longitude
    pub origin: Option<(u64, u64)>,
    /// Sorted and deduplicated
    pub tags: Vec<String>,
    pub version: Option<String>,
    pub environment: Option<String>,
}

impl CacheKey {
    pub fn new(
        strategy: Strategy,
        client: Option<&str>,
        tags: &[String],
        version: Option<&str>,
        environment: Option<&str>,
    ) -> Self {
        let mut tags = tags.to_vec();
        tags.sort();
        tags.dedup();
        Self {
            strategy,
            client: client.map(str::to_string),
            origin: None,
            tags,
            version: version.map(str::to_string),
            environment: environment.map(str::to_string),
        }
    }

    /// Key geo-aware answers on the location they were computed for
    pub fn with_origin(mut self, origin: Option<GeoPoint>) -> Self {
        self.origin = origin.map(|p| (p.latitude.to_bits(), p.longitude.to_bits()));
        self
    }
}

#[derive(Debug, Clone)]
struct CachedSelection {
    node: String,
    inserted: Instant,
    ttl: Duration,
}

impl CachedSelection {
    fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted) < self.ttl
    }
}

#[derive(Debug, Clone, Default)]
struct AccessPattern {
    last: Option<Instant>,
    ema_hz: f64,
    lookups: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug)]
pub struct DiscoveryCache {
    groups: DashMap<String, HashMap<CacheKey, CachedSelection>>,
    patterns: DashMap<String, AccessPattern>,
    config: RwLock<CacheConfig>,
    entries: AtomicUsize,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl DiscoveryCache {
    pub fn new(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            groups: DashMap::new(),
            patterns: DashMap::new(),
            config: RwLock::new(config),
            entries: AtomicUsize::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            clock,
        }
    }

    pub fn update_config(&self, config: CacheConfig) {
        let disabled = !config.enabled;
        *self.config.write() = config;
        if disabled {
            self.clear();
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.read().enabled
    }

    /// Record a lookup for the service's access-frequency estimate
    pub fn record_access(&self, service: &str) {
        let now = self.clock.now();
        let alpha = self.config.read().ema_alpha;
        let mut pattern = self.patterns.entry(service.to_string()).or_default();
        if let Some(last) = pattern.last {
            let elapsed_ms = now.saturating_duration_since(last).as_secs_f64() * 1000.0;
            // Sub-millisecond bursts count as 1000 lookups/second
            let instant_hz = 1000.0 / elapsed_ms.max(1.0);
            pattern.ema_hz = alpha * instant_hz + (1.0 - alpha) * pattern.ema_hz;
        }
        pattern.last = Some(now);
        pattern.lookups += 1;
    }

    /// Current smoothed lookup frequency of a service
    pub fn access_frequency(&self, service: &str) -> f64 {
        self.patterns.get(service).map(|p| p.ema_hz).unwrap_or(0.0)
    }

    pub fn ttl_for(&self, service: &str) -> Duration {
        let config = self.config.read();
        let boost = config.ttl_per_hz.as_secs_f64() * self.access_frequency(service);
        let ttl = config.base_ttl.as_secs_f64() + boost;
        Duration::from_secs_f64(ttl.min(config.max_ttl.as_secs_f64()))
    }

    pub fn get(&self, service: &str, key: &CacheKey) -> Option<String> {
        if !self.is_enabled() {
            return None;
        }
        let now = self.clock.now();
        let mut expired = false;
        let found = self.groups.get(service).and_then(|group| {
            group.get(key).and_then(|entry| {
                if entry.is_fresh(now) {
                    Some(entry.node.clone())
                } else {
                    expired = true;
                    None
                }
            })
        });

        if expired {
            if let Some(mut group) = self.groups.get_mut(service) {
                if group.get(key).map_or(false, |e| !e.is_fresh(now)) && group.remove(key).is_some() {
                    self.entries.fetch_sub(1, Ordering::AcqRel);
                }
            }
        }

        match &found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    pub fn put(&self, service: &str, key: CacheKey, node: String) {
        if !self.is_enabled() {
            return;
        }
        let max_entries = self.config.read().max_entries;
        if self.entries.load(Ordering::Acquire) >= max_entries {
            self.purge_expired();
            if self.entries.load(Ordering::Acquire) >= max_entries {
                debug!("Discovery cache full, not caching {} for {}", node, service);
                return;
            }
        }

        let entry = CachedSelection {
            node,
            inserted: self.clock.now(),
            ttl: self.ttl_for(service),
        };
        // Count while the shard guard is held so a concurrent invalidate
        // never subtracts an entry before it was added
        let mut group = self.groups.entry(service.to_string()).or_default();
        if group.insert(key, entry).is_none() {
            self.entries.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Drop every entry of a service; returns how many were removed
    pub fn invalidate(&self, service: &str) -> usize {
        let removed = self.groups.remove(service).map_or(0, |(_, g)| g.len());
        if removed > 0 {
            self.entries.fetch_sub(removed, Ordering::AcqRel);
            self.invalidations.fetch_add(1, Ordering::Relaxed);
            debug!("Invalidated {} cached selections for {}", removed, service);
        }
        removed
    }

    /// Invalidate and also forget the service's access pattern
    pub fn forget(&self, service: &str) {
        self.invalidate(service);
        self.patterns.remove(service);
    }

    pub fn clear(&self) {
        let services: Vec<String> = self.groups.iter().map(|g| g.key().clone()).collect();
        for service in services {
            self.invalidate(&service);
        }
    }

    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut removed = 0;
        for mut group in self.groups.iter_mut() {
            let before = group.len();
            group.retain(|_, e| e.is_fresh(now));
            removed += before - group.len();
        }
        self.groups.retain(|_, g| !g.is_empty());
        if removed > 0 {
            self.entries.fetch_sub(removed, Ordering::AcqRel);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }
}
