//! Per-service state
//!
//! A [`ServiceEntry`] owns everything about one service that must change
//! atomically with its nodes: the node slots (lease, circuit and response
//! statistics included), the available view, the secondary indices and
//! the auxiliary min-connections / min-response-time pointers. It is
//! always accessed under the service's `RwLock`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use super::index::{NodeFilter, ServiceIndex};
use crate::circuit::{CircuitRecord, CircuitState};
use crate::health::{ResponseStats, MAX_SCORE};
use crate::model::Node;

/// One registered node with its lease, circuit and health state
#[derive(Debug, Clone)]
pub struct NodeSlot {
    pub node: Node,
    /// Registration order within the service
    pub seq: u64,
    pub last_heartbeat: Instant,
    /// Lease lapsed; awaiting removal by the sweep
    pub expired: bool,
    pub maintenance: bool,
    pub circuit: CircuitRecord,
    pub stats: ResponseStats,
    pub score: f64,
}

impl NodeSlot {
    pub fn new(node: Node, seq: u64, now: Instant, maintenance: bool) -> Self {
        Self {
            node,
            seq,
            last_heartbeat: now,
            expired: false,
            maintenance,
            circuit: CircuitRecord::default(),
            stats: ResponseStats::default(),
            score: MAX_SCORE,
        }
    }

    /// healthy ∧ circuit not open ∧ not in maintenance
    pub fn eligible(&self) -> bool {
        self.node.healthy && !self.circuit.is_open() && !self.maintenance
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.circuit.state
    }

    /// Copy circuit counters onto the public node view
    pub fn sync_circuit(&mut self, wall_ms_at_failure: Option<u64>) {
        self.node.failure_count = self.circuit.failure_count;
        if let Some(ms) = wall_ms_at_failure {
            self.node.last_failure_ms = Some(ms);
        }
    }

    pub fn renew(&mut self, now: Instant) -> bool {
        self.last_heartbeat = now;
        let reinstated = self.expired;
        self.expired = false;
        self.node.healthy = true;
        reinstated
    }
}

#[derive(Debug)]
pub struct ServiceEntry {
    name: String,
    nodes: HashMap<String, NodeSlot>,
    /// Eligible node names in registration order
    available: Vec<String>,
    cursor: AtomicUsize,
    override_cursor: AtomicUsize,
    index: ServiceIndex,
    indexed: bool,
    min_connections: Option<String>,
    min_response_time: Option<String>,
    next_seq: u64,
    /// Set once the last node leaves; a retired entry accepts no inserts
    retired: bool,
}

impl ServiceEntry {
    pub fn new(name: impl Into<String>, indexed: bool) -> Self {
        Self {
            name: name.into(),
            nodes: HashMap::new(),
            available: Vec::new(),
            cursor: AtomicUsize::new(0),
            override_cursor: AtomicUsize::new(0),
            index: ServiceIndex::default(),
            indexed,
            min_connections: None,
            min_response_time: None,
            next_seq: 0,
            retired: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn is_retired(&self) -> bool {
        self.retired
    }

    pub(crate) fn retire(&mut self) {
        self.retired = true;
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn slot(&self, name: &str) -> Option<&NodeSlot> {
        self.nodes.get(name)
    }

    pub(crate) fn slot_mut(&mut self, name: &str) -> Option<&mut NodeSlot> {
        self.nodes.get_mut(name)
    }

    pub fn slots(&self) -> impl Iterator<Item = &NodeSlot> {
        self.nodes.values()
    }

    pub(crate) fn slots_mut(&mut self) -> impl Iterator<Item = &mut NodeSlot> {
        self.nodes.values_mut()
    }

    /// Slots ordered by registration
    pub fn ordered_slots(&self) -> Vec<&NodeSlot> {
        let mut slots: Vec<&NodeSlot> = self.nodes.values().collect();
        slots.sort_by_key(|s| s.seq);
        slots
    }

    pub fn available_len(&self) -> usize {
        self.available.len()
    }

    pub fn available_names(&self) -> &[String] {
        &self.available
    }

    /// Eligible slots in registration order
    pub fn available_slots(&self) -> impl Iterator<Item = &NodeSlot> {
        self.available.iter().map(move |name| {
            self.nodes
                .get(name)
                .unwrap_or_else(|| panic!("available view references unknown node {}", name))
        })
    }

    /// Eligible slots matching the filter, in registration order
    pub fn candidates(&self, filter: &NodeFilter) -> Vec<&NodeSlot> {
        if filter.is_empty() {
            return self.available_slots().collect();
        }
        if self.indexed {
            let hits = self.index.lookup(filter);
            self.available_slots()
                .filter(|s| hits.contains(s.node.name.as_str()))
                .collect()
        } else {
            self.available_slots()
                .filter(|s| filter.matches(&s.node))
                .collect()
        }
    }

    pub fn cursor(&self) -> &AtomicUsize {
        &self.cursor
    }

    pub fn override_cursor(&self) -> &AtomicUsize {
        &self.override_cursor
    }

    pub fn min_connections(&self) -> Option<&str> {
        self.min_connections.as_deref()
    }

    pub fn min_response_time(&self) -> Option<&str> {
        self.min_response_time.as_deref()
    }

    pub fn index(&self) -> &ServiceIndex {
        &self.index
    }

    pub(crate) fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Insert a new node and place it in the view if eligible
    pub(crate) fn insert(&mut self, slot: NodeSlot) {
        let name = slot.node.name.clone();
        if self.indexed {
            self.index.insert(&slot.node);
        }
        self.nodes.insert(name.clone(), slot);
        self.refresh(&name);
        self.recompute_aux();
    }

    pub(crate) fn remove(&mut self, name: &str) -> Option<NodeSlot> {
        let slot = self.nodes.remove(name)?;
        if self.indexed {
            self.index.remove(&slot.node);
        }
        self.available.retain(|n| n != name);
        self.recompute_aux();
        Some(slot)
    }

    /// Reconcile one node's membership in the available view
    ///
    /// Returns true when membership changed.
    pub(crate) fn refresh(&mut self, name: &str) -> bool {
        let Some(slot) = self.nodes.get(name) else {
            return false;
        };
        let eligible = slot.eligible();
        let seq = slot.seq;
        let nodes = &self.nodes;
        let position = self.available.binary_search_by_key(&seq, |n| {
            nodes
                .get(n)
                .map(|s| s.seq)
                .unwrap_or_else(|| panic!("available view references unknown node {}", n))
        });

        match (eligible, position) {
            (true, Err(at)) => {
                self.available.insert(at, name.to_string());
                true
            }
            (false, Ok(at)) => {
                self.available.remove(at);
                true
            }
            _ => false,
        }
    }

    /// Rebuild the indices after toggling them on or off
    pub(crate) fn set_indexed(&mut self, indexed: bool) {
        if self.indexed == indexed {
            return;
        }
        self.indexed = indexed;
        self.index = ServiceIndex::default();
        if indexed {
            for slot in self.nodes.values() {
                self.index.insert(&slot.node);
            }
        }
    }

    /// Recompute min-connections and min-response-time over the view
    pub(crate) fn recompute_aux(&mut self) {
        let mut min_conn: Option<(&str, u32)> = None;
        let mut min_rt: Option<(&str, f64)> = None;
        for name in &self.available {
            let Some(slot) = self.nodes.get(name) else {
                continue;
            };
            if min_conn.map_or(true, |(_, c)| slot.node.connections < c) {
                min_conn = Some((name, slot.node.connections));
            }
            let rt = slot.stats.average();
            if min_rt.map_or(true, |(_, r)| rt < r) {
                min_rt = Some((name, rt));
            }
        }
        self.min_connections = min_conn.map(|(n, _)| n.to_string());
        self.min_response_time = min_rt.map(|(n, _)| n.to_string());
    }

    /// Advance the round-robin cursor and return the previous position
    pub fn advance_cursor(cursor: &AtomicUsize) -> usize {
        cursor.fetch_add(1, Ordering::Relaxed)
    }

    /// Assert the view and indices agree with the node map
    pub fn check_invariants(&self) {
        let mut last_seq = None;
        for name in &self.available {
            let slot = self
                .nodes
                .get(name)
                .unwrap_or_else(|| panic!("available view references unknown node {}", name));
            assert!(slot.eligible(), "ineligible node {} in available view", name);
            assert!(
                last_seq.map_or(true, |s| s < slot.seq),
                "available view out of registration order at {}",
                name
            );
            last_seq = Some(slot.seq);
        }
        let eligible = self.nodes.values().filter(|s| s.eligible()).count();
        assert_eq!(eligible, self.available.len(), "eligible node missing from view");
        if self.indexed {
            for slot in self.nodes.values() {
                for tag in &slot.node.tags {
                    assert!(
                        self.index.with_tag(tag).any(|n| n == slot.node.name),
                        "tag index missing {}",
                        slot.node.name
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NodeInfo;

    fn slot(entry: &mut ServiceEntry, port: u16) -> NodeSlot {
        let node = Node::from_info("svc", &NodeInfo::new("10.0.0.1", port).with_tag("a"), 1);
        let seq = entry.next_seq();
        NodeSlot::new(node, seq, Instant::now(), false)
    }

    #[test]
    fn test_view_keeps_registration_order_on_reinsert() {
        let mut entry = ServiceEntry::new("svc", true);
        for port in 1..=3 {
            let s = slot(&mut entry, port);
            entry.insert(s);
        }
        assert_eq!(entry.available_names(), ["10.0.0.1:1", "10.0.0.1:2", "10.0.0.1:3"]);

        entry.slot_mut("10.0.0.1:1").unwrap().maintenance = true;
        assert!(entry.refresh("10.0.0.1:1"));
        assert_eq!(entry.available_names(), ["10.0.0.1:2", "10.0.0.1:3"]);

        entry.slot_mut("10.0.0.1:1").unwrap().maintenance = false;
        assert!(entry.refresh("10.0.0.1:1"));
        assert_eq!(entry.available_names()[0], "10.0.0.1:1");
        assert!(!entry.refresh("10.0.0.1:1"));
        entry.check_invariants();
    }

    #[test]
    fn test_aux_tracks_minimums() {
        let mut entry = ServiceEntry::new("svc", true);
        for port in 1..=3 {
            let s = slot(&mut entry, port);
            entry.insert(s);
        }
        entry.slot_mut("10.0.0.1:1").unwrap().node.connections = 5;
        entry.slot_mut("10.0.0.1:2").unwrap().stats.record(50.0, 10);
        entry.slot_mut("10.0.0.1:3").unwrap().stats.record(10.0, 10);
        entry.slot_mut("10.0.0.1:1").unwrap().stats.record(20.0, 10);
        entry.recompute_aux();

        assert_eq!(entry.min_connections(), Some("10.0.0.1:2"));
        assert_eq!(entry.min_response_time(), Some("10.0.0.1:3"));
    }

    #[test]
    fn test_remove_updates_view_and_index() {
        let mut entry = ServiceEntry::new("svc", true);
        let s = slot(&mut entry, 1);
        entry.insert(s);
        assert!(entry.remove("10.0.0.1:1").is_some());
        assert!(entry.remove("10.0.0.1:1").is_none());
        assert!(entry.is_empty());
        assert_eq!(entry.available_len(), 0);
        assert!(entry.index().is_empty());
        entry.check_invariants();
    }
}
