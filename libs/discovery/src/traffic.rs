//! Traffic Router
//!
//! Deployment overrides consulted before the strategy engine:
//!
//! 1. **Blue-green**: when configured, requests go round-robin to the
//!    eligible nodes of the active color.
//! 2. **Canary**: a `percentage`% coin sends the request round-robin to
//!    the eligible canary nodes.
//! 3. **Traffic split**: a weighted draw over versions narrows the
//!    candidates to one version before the strategy runs.
//!
//! Overrides only ever choose among eligible candidates; when none of
//! their nodes are eligible the request falls through to the next stage.

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::info;

use crate::registry::NodeSlot;
use crate::strategy::rotate;
use crate::{RegistryError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanaryConfig {
    /// Share of requests, 0-100
    pub percentage: f64,
    pub nodes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Deployment {
    Blue,
    Green,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlueGreenConfig {
    pub blue: Vec<String>,
    pub green: Vec<String>,
    pub active: Deployment,
}

impl BlueGreenConfig {
    pub fn active_nodes(&self) -> &[String] {
        match self.active {
            Deployment::Blue => &self.blue,
            Deployment::Green => &self.green,
        }
    }
}

/// Version → percentage; the unassigned remainder is left to the strategy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrafficSplit {
    pub weights: BTreeMap<String, f64>,
}

impl TrafficSplit {
    pub fn total(&self) -> f64 {
        self.weights.values().sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrafficPolicy {
    pub canary: Option<CanaryConfig>,
    pub blue_green: Option<BlueGreenConfig>,
    pub split: Option<TrafficSplit>,
}

impl TrafficPolicy {
    pub fn is_empty(&self) -> bool {
        self.canary.is_none() && self.blue_green.is_none() && self.split.is_none()
    }
}

/// Outcome of consulting the router
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routing {
    /// Use this candidate and skip the strategy
    Override { index: usize, kind: OverrideKind },
    /// Run the strategy only over nodes of this version
    Restrict { version: String },
    /// No override applies
    Delegate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideKind {
    BlueGreen,
    Canary,
}

#[derive(Debug)]
pub struct TrafficRouter {
    policies: DashMap<String, TrafficPolicy>,
    enabled: AtomicBool,
    rng: Mutex<StdRng>,
}

impl TrafficRouter {
    pub fn new(enabled: bool, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(1)),
            None => StdRng::from_entropy(),
        };
        Self {
            policies: DashMap::new(),
            enabled: AtomicBool::new(enabled),
            rng: Mutex::new(rng),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_canary(&self, service: &str, percentage: f64, nodes: Vec<String>) -> Result<()> {
        if !(0.0..=100.0).contains(&percentage) {
            return Err(RegistryError::validation(
                format!("canary percentage {} outside 0-100", percentage),
                Some("percentage"),
            ));
        }
        info!("Canary for {}: {}% to {} nodes", service, percentage, nodes.len());
        self.policies.entry(service.to_string()).or_default().canary =
            Some(CanaryConfig { percentage, nodes });
        Ok(())
    }

    pub fn set_blue_green(
        &self,
        service: &str,
        blue: Vec<String>,
        green: Vec<String>,
        active: Deployment,
    ) -> Result<()> {
        let blue_set: HashSet<&String> = blue.iter().collect();
        if green.iter().any(|n| blue_set.contains(n)) {
            return Err(RegistryError::validation(
                "a node cannot be both blue and green",
                Some("green"),
            ));
        }
        info!("Blue-green for {}: {:?} active", service, active);
        self.policies.entry(service.to_string()).or_default().blue_green =
            Some(BlueGreenConfig { blue, green, active });
        Ok(())
    }

    /// Flip the active color; false when no blue-green is configured
    pub fn switch_deployment(&self, service: &str, active: Deployment) -> bool {
        match self.policies.get_mut(service) {
            Some(mut policy) => match policy.blue_green.as_mut() {
                Some(bg) => {
                    bg.active = active;
                    info!("Blue-green for {} switched to {:?}", service, active);
                    true
                }
                None => false,
            },
            None => false,
        }
    }

    pub fn set_traffic_split(&self, service: &str, weights: BTreeMap<String, f64>) -> Result<()> {
        let split = TrafficSplit { weights };
        if split.weights.values().any(|w| !(0.0..=100.0).contains(w)) {
            return Err(RegistryError::validation(
                "split weights must be within 0-100",
                Some("distribution"),
            ));
        }
        if split.total() > 100.0 + f64::EPSILON {
            return Err(RegistryError::validation(
                format!("split weights sum to {} (max 100)", split.total()),
                Some("distribution"),
            ));
        }
        info!("Traffic split for {}: {:?}", service, split.weights);
        self.policies.entry(service.to_string()).or_default().split = Some(split);
        Ok(())
    }

    /// Remove every override for a service
    pub fn clear(&self, service: &str) -> bool {
        self.policies.remove(service).is_some()
    }

    pub fn clear_canary(&self, service: &str) {
        self.mutate(service, |p| p.canary = None);
    }

    pub fn clear_blue_green(&self, service: &str) {
        self.mutate(service, |p| p.blue_green = None);
    }

    pub fn clear_split(&self, service: &str) {
        self.mutate(service, |p| p.split = None);
    }

    fn mutate(&self, service: &str, f: impl FnOnce(&mut TrafficPolicy)) {
        let now_empty = match self.policies.get_mut(service) {
            Some(mut policy) => {
                f(&mut policy);
                policy.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.policies.remove_if(service, |_, p| p.is_empty());
        }
    }

    pub fn policy(&self, service: &str) -> Option<TrafficPolicy> {
        self.policies.get(service).map(|p| p.clone())
    }

    pub fn has_policy(&self, service: &str) -> bool {
        self.policies.contains_key(service)
    }

    pub(crate) fn policies(&self) -> Vec<(String, TrafficPolicy)> {
        self.policies
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub(crate) fn restore(&self, service: String, policy: TrafficPolicy) {
        if !policy.is_empty() {
            self.policies.insert(service, policy);
        }
    }

    /// Decide how a request for `service` is routed over eligible
    /// `candidates`, using `cursor` for override rotation
    pub fn route(&self, service: &str, candidates: &[&NodeSlot], cursor: &AtomicUsize) -> Routing {
        if !self.is_enabled() || candidates.is_empty() {
            return Routing::Delegate;
        }
        let Some(policy) = self.policies.get(service).map(|p| p.clone()) else {
            return Routing::Delegate;
        };

        if let Some(bg) = &policy.blue_green {
            if let Some(index) = pick_member(candidates, bg.active_nodes(), cursor) {
                return Routing::Override {
                    index,
                    kind: OverrideKind::BlueGreen,
                };
            }
        }

        if let Some(canary) = &policy.canary {
            let coin = self.rng.lock().gen::<f64>() * 100.0;
            if coin < canary.percentage {
                if let Some(index) = pick_member(candidates, &canary.nodes, cursor) {
                    return Routing::Override {
                        index,
                        kind: OverrideKind::Canary,
                    };
                }
            }
        }

        if let Some(split) = &policy.split {
            let draw = self.rng.lock().gen::<f64>() * 100.0;
            let mut cumulative = 0.0;
            for (version, weight) in &split.weights {
                cumulative += weight;
                if draw < cumulative {
                    return Routing::Restrict {
                        version: version.clone(),
                    };
                }
            }
        }

        Routing::Delegate
    }
}

/// Round-robin over the candidates that belong to `members`
fn pick_member(candidates: &[&NodeSlot], members: &[String], cursor: &AtomicUsize) -> Option<usize> {
    let members: HashSet<&str> = members.iter().map(String::as_str).collect();
    let eligible: Vec<usize> = candidates
        .iter()
        .enumerate()
        .filter(|(_, s)| members.contains(s.node.name.as_str()))
        .map(|(i, _)| i)
        .collect();
    if eligible.is_empty() {
        None
    } else {
        Some(eligible[rotate(cursor, eligible.len())])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::test_support::{refs, slot};

    fn names(ports: &[u16]) -> Vec<String> {
        ports.iter().map(|p| format!("10.0.0.1:{}", p)).collect()
    }

    #[test]
    fn test_blue_green_routes_to_active_color() {
        let router = TrafficRouter::new(true, Some(1));
        let slots: Vec<NodeSlot> = (1..=4).map(slot).collect();
        router
            .set_blue_green("svc", names(&[1, 2]), names(&[3, 4]), Deployment::Green)
            .unwrap();
        let cursor = AtomicUsize::new(0);

        let picks: Vec<Routing> = (0..4).map(|_| router.route("svc", &refs(&slots), &cursor)).collect();
        let indices: Vec<usize> = picks
            .iter()
            .map(|r| match r {
                Routing::Override { index, kind: OverrideKind::BlueGreen } => *index,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(indices, vec![2, 3, 2, 3]);

        assert!(router.switch_deployment("svc", Deployment::Blue));
        assert!(matches!(
            router.route("svc", &refs(&slots), &cursor),
            Routing::Override { index: 0 | 1, .. }
        ));
    }

    #[test]
    fn test_blue_green_falls_through_when_color_ineligible() {
        let router = TrafficRouter::new(true, Some(1));
        let slots: Vec<NodeSlot> = (1..=2).map(slot).collect();
        router
            .set_blue_green("svc", names(&[1, 2]), names(&[9]), Deployment::Green)
            .unwrap();
        let cursor = AtomicUsize::new(0);
        assert_eq!(router.route("svc", &refs(&slots), &cursor), Routing::Delegate);
    }

    #[test]
    fn test_canary_share() {
        let router = TrafficRouter::new(true, Some(11));
        let slots: Vec<NodeSlot> = (1..=5).map(slot).collect();
        router.set_canary("svc", 20.0, names(&[5])).unwrap();
        let cursor = AtomicUsize::new(0);

        let trials = 20_000;
        let canary = (0..trials)
            .filter(|_| {
                matches!(
                    router.route("svc", &refs(&slots), &cursor),
                    Routing::Override { index: 4, kind: OverrideKind::Canary }
                )
            })
            .count();
        let share = canary as f64 / trials as f64;
        assert!((share - 0.20).abs() < 0.02, "canary share {}", share);
    }

    #[test]
    fn test_split_restricts_version() {
        let router = TrafficRouter::new(true, Some(2));
        let slots: Vec<NodeSlot> = (1..=2).map(slot).collect();
        let mut weights = BTreeMap::new();
        weights.insert("v2".to_string(), 100.0);
        router.set_traffic_split("svc", weights).unwrap();
        let cursor = AtomicUsize::new(0);
        assert_eq!(
            router.route("svc", &refs(&slots), &cursor),
            Routing::Restrict { version: "v2".into() }
        );
    }

    #[test]
    fn test_validation_and_disable() {
        let router = TrafficRouter::new(false, None);
        assert!(router.set_canary("svc", 120.0, vec![]).is_err());
        let mut weights = BTreeMap::new();
        weights.insert("v1".to_string(), 60.0);
        weights.insert("v2".to_string(), 50.0);
        assert!(router.set_traffic_split("svc", weights).is_err());
        assert!(router
            .set_blue_green("svc", names(&[1]), names(&[1]), Deployment::Blue)
            .is_err());

        router.set_canary("svc", 100.0, names(&[1])).unwrap();
        let slots: Vec<NodeSlot> = (1..=2).map(slot).collect();
        let cursor = AtomicUsize::new(0);
        assert_eq!(router.route("svc", &refs(&slots), &cursor), Routing::Delegate);

        router.clear_canary("svc");
        assert!(!router.has_policy("svc"));
    }
}
