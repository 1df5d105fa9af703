//! Lease Manager
//!
//! Nodes stay registered only while they heartbeat. A periodic sweep
//! moves nodes whose last heartbeat is older than the timeout through
//! `alive → expired → removed`:
//!
//! 1. Under the service lock, stale nodes are marked expired and leave
//!    the available view.
//! 2. Each expired node is then deregistered, unless a heartbeat renewed
//!    it in between, in which case it simply stays.
//!
//! ## Self-preservation
//!
//! Before evicting anything the sweep computes the cluster-wide renewal
//! ratio (nodes renewed within the renewal window / all nodes). If it
//! falls below the threshold, the likelier explanation is a partition
//! between the registry and its clients rather than mass failure, so
//! eviction is suspended until a later sweep sees the ratio recover.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, error, info, warn};

use crate::config::LeaseConfig;
use crate::registry::{LeaseCensus, Registry, ServiceHandle};

/// Outcome of one sweep
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SweepReport {
    pub total: usize,
    pub renewed: usize,
    pub stale: usize,
    pub renewal_ratio: f64,
    pub self_preservation: bool,
    /// `(service, node)` pairs removed by this sweep
    pub evicted: Vec<(String, String)>,
    /// Expired nodes renewed before removal
    pub reprieved: usize,
    /// Services whose processing failed and was skipped
    pub faults: usize,
}

#[derive(Debug)]
pub struct LeaseManager {
    config: RwLock<LeaseConfig>,
    preserving: AtomicBool,
    sweeps: AtomicU64,
    evictions: AtomicU64,
}

impl LeaseManager {
    pub fn new(config: LeaseConfig) -> Self {
        Self {
            config: RwLock::new(config),
            preserving: AtomicBool::new(false),
            sweeps: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> LeaseConfig {
        self.config.read().clone()
    }

    pub fn update_config(&self, config: LeaseConfig) {
        *self.config.write() = config;
    }

    pub fn in_self_preservation(&self) -> bool {
        self.preserving.load(Ordering::Acquire)
    }

    pub fn sweeps(&self) -> u64 {
        self.sweeps.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Evaluate self-preservation, then expire and evict stale nodes
    ///
    /// `on_change(service)` runs synchronously whenever a service's view
    /// changed; `on_evict(service, node)` after each removal.
    pub fn sweep(
        &self,
        registry: &Registry,
        mut on_change: impl FnMut(&str),
        mut on_evict: impl FnMut(&str, &str),
    ) -> SweepReport {
        let config = self.config();
        let now = registry.clock().now();
        self.sweeps.fetch_add(1, Ordering::Relaxed);

        let census = registry.lease_census(now, config.renewal_window, config.heartbeat_timeout);
        let ratio = renewal_ratio(&census);
        let preserve = config.self_preservation
            && census.total >= config.self_preservation_min_instances
            && ratio < config.renewal_threshold;

        let mut report = SweepReport {
            total: census.total,
            renewed: census.renewed,
            stale: census.stale,
            renewal_ratio: ratio,
            self_preservation: preserve,
            ..Default::default()
        };

        let was = self.preserving.swap(preserve, Ordering::AcqRel);
        match (was, preserve) {
            (false, true) => warn!(
                "Entering self-preservation: renewal ratio {:.2} below {:.2} ({} of {} nodes renewed)",
                ratio, config.renewal_threshold, census.renewed, census.total
            ),
            (true, false) => info!("Leaving self-preservation: renewal ratio {:.2}", ratio),
            _ => {}
        }
        if preserve {
            debug!("Eviction suspended, {} stale nodes retained", census.stale);
            return report;
        }
        if census.stale == 0 {
            return report;
        }

        for handle in registry.handles() {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                self.sweep_service(registry, &handle, &config, &mut on_change, &mut on_evict)
            }));
            match outcome {
                Ok((evicted, reprieved)) => {
                    report.evicted.extend(evicted);
                    report.reprieved += reprieved;
                }
                Err(_) => {
                    report.faults += 1;
                    error!("Lease sweep failed for service {}, skipped", handle.read().name());
                }
            }
        }

        self.evictions
            .fetch_add(report.evicted.len() as u64, Ordering::Relaxed);
        if !report.evicted.is_empty() {
            info!("Lease sweep evicted {} nodes", report.evicted.len());
        }
        report
    }

    fn sweep_service(
        &self,
        registry: &Registry,
        handle: &ServiceHandle,
        config: &LeaseConfig,
        on_change: &mut impl FnMut(&str),
        on_evict: &mut impl FnMut(&str, &str),
    ) -> (Vec<(String, String)>, usize) {
        let now = registry.clock().now();
        let timeout = config.heartbeat_timeout;
        let is_stale = |at: std::time::Instant| now.saturating_duration_since(at) > timeout;

        let (service, expired, view_changed) = {
            let mut entry = handle.write();
            let mut newly = Vec::new();
            let mut expired = Vec::new();
            for slot in entry.slots_mut() {
                if is_stale(slot.last_heartbeat) {
                    if !slot.expired {
                        slot.expired = true;
                        slot.node.healthy = false;
                        newly.push(slot.node.name.clone());
                    }
                    expired.push(slot.node.name.clone());
                }
            }
            let mut view_changed = false;
            for name in &newly {
                debug!("Lease expired for {} in {}", name, entry.name());
                view_changed |= entry.refresh(name);
            }
            if !newly.is_empty() {
                entry.recompute_aux();
            }
            (entry.name().to_string(), expired, view_changed)
        };
        if view_changed {
            on_change(&service);
        }

        let mut evicted = Vec::new();
        let mut reprieved = 0;
        for name in expired {
            let removed = registry.remove_where(&name, |slot| slot.expired && is_stale(slot.last_heartbeat));
            match removed {
                Some((owner, _)) => {
                    info!("Evicted {} from {} after missed heartbeats", name, owner);
                    on_evict(&owner, &name);
                    evicted.push((owner, name));
                }
                None => reprieved += 1,
            }
        }
        (evicted, reprieved)
    }
}

fn renewal_ratio(census: &LeaseCensus) -> f64 {
    if census.total == 0 {
        1.0
    } else {
        census.renewed as f64 / census.total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::{NodeInfo, ServiceKey};
    use crate::RegistryConfig;
    use std::sync::Arc;
    use std::time::Duration;

    fn setup(min_instances: usize) -> (Registry, LeaseManager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let config = RegistryConfig::default();
        let registry = Registry::new(config.store.clone(), true, clock.clone());
        let mut lease = config.lease.clone();
        lease.self_preservation_min_instances = min_instances;
        (registry, LeaseManager::new(lease), clock)
    }

    fn register(registry: &Registry, ports: std::ops::RangeInclusive<u16>) {
        for port in ports {
            registry
                .register(&ServiceKey::new("orders"), &NodeInfo::new("10.0.0.1", port))
                .unwrap();
        }
    }

    #[test]
    fn test_stale_node_is_evicted() {
        let (registry, leases, clock) = setup(10);
        register(&registry, 1..=2);
        clock.advance(Duration::from_secs(50));
        registry.heartbeat("10.0.0.1:2");
        clock.advance(Duration::from_secs(11));

        let mut changed = Vec::new();
        let mut evicted = Vec::new();
        let report = leases.sweep(&registry, |s| changed.push(s.to_string()), |_, n| evicted.push(n.to_string()));

        assert_eq!(report.evicted, vec![("orders".to_string(), "10.0.0.1:1".to_string())]);
        assert_eq!(evicted, vec!["10.0.0.1:1"]);
        assert_eq!(changed, vec!["orders"]);
        assert!(registry.node("10.0.0.1:1").is_none());
        assert!(registry.node("10.0.0.1:2").is_some());
        registry.check_invariants();
    }

    #[test]
    fn test_self_preservation_suspends_and_recovers() {
        let (registry, leases, clock) = setup(4);
        register(&registry, 1..=10);
        clock.advance(Duration::from_secs(61));
        // Only 2 of 10 renew: ratio 0.2
        registry.heartbeat("10.0.0.1:1");
        registry.heartbeat("10.0.0.1:2");

        let report = leases.sweep(&registry, |_| {}, |_, _| {});
        assert!(report.self_preservation);
        assert!(report.evicted.is_empty());
        assert!(leases.in_self_preservation());
        assert_eq!(registry.node_count(), 10);

        // Ratio recovers to 0.9: eviction resumes for the one still stale
        for port in 3..=9 {
            registry.heartbeat(&format!("10.0.0.1:{}", port));
        }
        let report = leases.sweep(&registry, |_| {}, |_, _| {});
        assert!(!report.self_preservation);
        assert!(!leases.in_self_preservation());
        assert_eq!(report.evicted.len(), 1);
        assert_eq!(registry.node_count(), 9);
    }

    #[test]
    fn test_small_cluster_never_preserves() {
        let (registry, leases, clock) = setup(10);
        register(&registry, 1..=3);
        clock.advance(Duration::from_secs(61));
        let report = leases.sweep(&registry, |_| {}, |_, _| {});
        assert!(!report.self_preservation);
        assert_eq!(report.evicted.len(), 3);
        assert_eq!(registry.service_count(), 0);
    }

    #[test]
    fn test_heartbeat_after_expiry_mark_reinstates() {
        let (registry, _, clock) = setup(10);
        register(&registry, 1..=1);
        assert_eq!(registry.available_count(), 1);
        clock.advance(Duration::from_secs(61));

        // Simulate the first sweep phase only
        let handle = registry.handle("orders").unwrap();
        {
            let mut entry = handle.write();
            let slot = entry.slot_mut("10.0.0.1:1").unwrap();
            slot.expired = true;
            slot.node.healthy = false;
            entry.refresh("10.0.0.1:1");
        }
        assert_eq!(registry.available_count(), 0);

        let (_, reinstated) = registry.heartbeat("10.0.0.1:1").unwrap();
        assert!(reinstated);
        assert_eq!(registry.available_count(), 1);
        assert!(registry
            .remove_where("10.0.0.1:1", |s| s.expired)
            .is_none());
    }
}
