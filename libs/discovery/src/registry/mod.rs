//! Registry Store
//!
//! Maps qualified service names to [`ServiceEntry`] values behind
//! per-service `RwLock`s, plus a node → service owner map and service
//! aliases. Discovery takes a service's read lock; every mutation takes
//! its write lock, so indices, view, lease and circuit state change in
//! the same critical section as the node itself.
//!
//! Lock order is service lock, then map shard. Map guards are never held
//! while acquiring a service lock.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub mod index;
pub mod service;

pub use index::{NodeFilter, ServiceIndex};
pub use service::{NodeSlot, ServiceEntry};

use crate::clock::Clock;
use crate::config::StoreConfig;
use crate::model::{Node, NodeInfo, ServiceKey};
use crate::{RegistryError, Result};

pub type ServiceHandle = Arc<RwLock<ServiceEntry>>;

/// Result of a successful registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub node: String,
    pub service: String,
    /// False when the node already existed and the call acted as a heartbeat
    pub created: bool,
    /// Service the node was moved out of, if it was registered elsewhere
    pub moved_from: Option<String>,
}

/// Result of applying a closure to one node
#[derive(Debug, Clone, PartialEq)]
pub struct NodeUpdate<R> {
    pub service: String,
    pub value: R,
    /// Node entered or left the available view
    pub view_changed: bool,
}

/// Heartbeat age census across all services
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeaseCensus {
    pub total: usize,
    pub renewed: usize,
    pub stale: usize,
}

#[derive(Debug)]
pub struct Registry {
    services: DashMap<String, ServiceHandle>,
    owners: DashMap<String, String>,
    aliases: DashMap<String, String>,
    config: RwLock<StoreConfig>,
    indexed: AtomicBool,
    clock: Arc<dyn Clock>,
}

impl Registry {
    pub fn new(config: StoreConfig, indexed: bool, clock: Arc<dyn Clock>) -> Self {
        Self {
            services: DashMap::new(),
            owners: DashMap::new(),
            aliases: DashMap::new(),
            config: RwLock::new(config),
            indexed: AtomicBool::new(indexed),
            clock,
        }
    }

    pub fn update_config(&self, config: StoreConfig, indexed: bool) {
        *self.config.write() = config;
        if self.indexed.swap(indexed, Ordering::AcqRel) != indexed {
            for handle in self.handles() {
                handle.write().set_indexed(indexed);
            }
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Register a node, or renew it if it is already registered there
    ///
    /// Renewal only refreshes the lease. Tags, weight, version and metadata
    /// of a live node keep their registered values; `created == false`
    /// tells the caller the description was not updated. Deregister first
    /// to change them.
    pub fn register(&self, key: &ServiceKey, info: &NodeInfo) -> Result<Registration> {
        key.validate()?;
        self.register_qualified(key.qualified(), info)
    }

    /// Register under an already qualified service name
    pub(crate) fn register_qualified(&self, service: String, info: &NodeInfo) -> Result<Registration> {
        let (max_nodes, max_weight) = {
            let config = self.config.read();
            (config.max_nodes_per_service, config.max_weight)
        };
        if service.trim().is_empty() {
            return Err(RegistryError::validation("service name cannot be empty", Some("service")));
        }
        info.validate(max_weight)?;
        let name = info.node_name();

        let previous = self.owners.get(&name).map(|s| s.value().clone());
        let moved_from = match previous {
            Some(old) if old != service => {
                info!("Node {} re-registering under {}, leaving {}", name, service, old);
                self.deregister(&name);
                Some(old)
            }
            _ => None,
        };

        loop {
            let handle = self
                .services
                .entry(service.clone())
                .or_insert_with(|| {
                    Arc::new(RwLock::new(ServiceEntry::new(
                        service.clone(),
                        self.indexed.load(Ordering::Acquire),
                    )))
                })
                .clone();

            let mut entry = handle.write();
            if entry.is_retired() {
                // Emptied by a concurrent deregister; pick up the fresh entry
                drop(entry);
                self.services
                    .remove_if(&service, |_, current| Arc::ptr_eq(current, &handle));
                continue;
            }

            let now = self.clock.now();
            if let Some(slot) = entry.slot_mut(&name) {
                slot.renew(now);
                entry.refresh(&name);
                debug!("Node {} already registered in {}, renewed", name, service);
                return Ok(Registration {
                    node: name,
                    service,
                    created: false,
                    moved_from,
                });
            }

            if entry.len() >= max_nodes {
                return Err(RegistryError::capacity_exceeded(service, max_nodes));
            }

            let node = Node::from_info(&service, info, discovery_config::defaults::registry::DEFAULT_WEIGHT);
            let seq = entry.next_seq();
            entry.insert(NodeSlot::new(node, seq, now, info.maintenance));
            self.owners.insert(name.clone(), service.clone());

            info!("Registered node {} in {}", name, service);
            return Ok(Registration {
                node: name,
                service,
                created: true,
                moved_from,
            });
        }
    }

    /// Remove a node; returns its service when something was removed
    pub fn deregister(&self, name: &str) -> Option<String> {
        self.remove_where(name, |_| true).map(|(service, _)| service)
    }

    /// Remove a node only if `predicate` holds under the service lock
    pub(crate) fn remove_where(
        &self,
        name: &str,
        predicate: impl FnOnce(&NodeSlot) -> bool,
    ) -> Option<(String, NodeSlot)> {
        let service = self.owners.get(name).map(|s| s.value().clone())?;
        let Some(handle) = self.handle(&service) else {
            self.owners.remove_if(name, |_, s| s == &service);
            return None;
        };

        let mut entry = handle.write();
        if !predicate(entry.slot(name)?) {
            return None;
        }
        let slot = entry.remove(name)?;
        self.owners.remove_if(name, |_, s| s == &service);

        if entry.is_empty() {
            entry.retire();
            self.services
                .remove_if(&service, |_, current| Arc::ptr_eq(current, &handle));
            debug!("Service {} dropped after its last node left", service);
        }
        info!("Deregistered node {} from {}", name, service);
        Some((service, slot))
    }

    /// Refresh a node's lease; returns its service and whether it was
    /// reinstated into the available view
    pub fn heartbeat(&self, name: &str) -> Option<(String, bool)> {
        let now = self.clock.now();
        self.update_node(name, |slot| slot.renew(now))
            .map(|update| (update.service, update.value))
    }

    /// Apply `f` to a node under its service's write lock, then reconcile
    /// the available view and the auxiliary indices
    pub fn update_node<R>(&self, name: &str, f: impl FnOnce(&mut NodeSlot) -> R) -> Option<NodeUpdate<R>> {
        let service = self.owners.get(name).map(|s| s.value().clone())?;
        let handle = self.handle(&service)?;
        let mut entry = handle.write();
        let value = f(entry.slot_mut(name)?);
        let view_changed = entry.refresh(name);
        entry.recompute_aux();
        Some(NodeUpdate {
            service,
            value,
            view_changed,
        })
    }

    pub fn handle(&self, service: &str) -> Option<ServiceHandle> {
        self.services.get(service).map(|h| h.value().clone())
    }

    /// Resolve a registered name or an alias to a service handle
    pub fn resolve(&self, name: &str) -> Option<(String, ServiceHandle)> {
        if let Some(handle) = self.handle(name) {
            return Some((name.to_string(), handle));
        }
        let target = self.aliases.get(name).map(|t| t.value().clone())?;
        self.handle(&target).map(|h| (target, h))
    }

    pub fn handles(&self) -> Vec<ServiceHandle> {
        self.services.iter().map(|e| e.value().clone()).collect()
    }

    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn owner_of(&self, node: &str) -> Option<String> {
        self.owners.get(node).map(|s| s.value().clone())
    }

    pub fn node(&self, name: &str) -> Option<Node> {
        let service = self.owner_of(name)?;
        let handle = self.handle(&service)?;
        let entry = handle.read();
        entry.slot(name).map(|s| s.node.clone())
    }

    /// Nodes of a service in registration order
    pub fn service_nodes(&self, service: &str) -> Vec<Node> {
        self.resolve(service)
            .map(|(_, handle)| {
                let entry = handle.read();
                entry.ordered_slots().into_iter().map(|s| s.node.clone()).collect()
            })
            .unwrap_or_default()
    }

    pub fn nodes_with_tag(&self, tag: &str) -> Vec<String> {
        let mut names = Vec::new();
        for handle in self.handles() {
            let entry = handle.read();
            if self.indexed.load(Ordering::Acquire) {
                names.extend(entry.index().with_tag(tag).map(str::to_string));
            } else {
                names.extend(
                    entry
                        .slots()
                        .filter(|s| s.node.tags.contains(tag))
                        .map(|s| s.node.name.clone()),
                );
            }
        }
        names.sort();
        names
    }

    pub fn node_count(&self) -> usize {
        self.owners.len()
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    pub fn available_count(&self) -> usize {
        self.handles().iter().map(|h| h.read().available_len()).sum()
    }

    pub fn set_alias(&self, alias: impl Into<String>, target: impl Into<String>) -> Result<()> {
        let alias = alias.into();
        let target = target.into();
        if alias.trim().is_empty() || target.trim().is_empty() {
            return Err(RegistryError::validation("alias and target cannot be empty", Some("alias")));
        }
        if alias == target {
            return Err(RegistryError::validation("alias cannot point at itself", Some("alias")));
        }
        self.aliases.insert(alias, target);
        Ok(())
    }

    pub fn remove_alias(&self, alias: &str) -> bool {
        self.aliases.remove(alias).is_some()
    }

    pub fn aliases(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = self
            .aliases
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        pairs.sort();
        pairs
    }

    /// Count nodes renewed within `window` of `now`
    pub fn lease_census(&self, now: Instant, window: Duration, timeout: Duration) -> LeaseCensus {
        let mut census = LeaseCensus::default();
        for handle in self.handles() {
            let entry = handle.read();
            for slot in entry.slots() {
                let age = now.saturating_duration_since(slot.last_heartbeat);
                census.total += 1;
                if age <= window {
                    census.renewed += 1;
                }
                if age > timeout {
                    census.stale += 1;
                }
            }
        }
        census
    }

    /// Verify every service's internal consistency
    pub fn check_invariants(&self) {
        for handle in self.handles() {
            let entry = handle.read();
            entry.check_invariants();
            for slot in entry.slots() {
                let owner = self.owner_of(&slot.node.name);
                assert_eq!(
                    owner.as_deref(),
                    Some(entry.name()),
                    "owner map disagrees for {}",
                    slot.node.name
                );
            }
        }
    }
}
