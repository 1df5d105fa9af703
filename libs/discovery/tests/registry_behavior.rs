//! End-to-end registry behavior through the public engine API

use std::sync::Arc;
use std::time::Duration;

use std::collections::HashSet;

use discovery::{
    CircuitState, DiscoveryEngine, DiscoveryRequest, GeoPoint, ManualClock, NodeInfo,
    RegistryConfig, RegistryError, ServiceKey, Strategy,
};

fn engine_with(config: RegistryConfig) -> (DiscoveryEngine, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new());
    let engine = DiscoveryEngine::with_clock(config, clock.clone()).unwrap();
    (engine, clock)
}

fn seeded() -> RegistryConfig {
    let mut config = RegistryConfig::default();
    config.store.rng_seed = Some(42);
    config
}

fn register_ports(engine: &DiscoveryEngine, service: &str, ports: impl IntoIterator<Item = u16>) -> Vec<String> {
    ports
        .into_iter()
        .map(|port| {
            engine
                .register(&ServiceKey::new(service), &NodeInfo::new("10.1.0.1", port))
                .unwrap()
        })
        .collect()
}

#[test_log::test]
fn round_robin_visits_each_node_once_per_cycle() {
    let (engine, _) = engine_with(seeded());
    let names = register_ports(&engine, "catalog", 1..=5);
    let request = DiscoveryRequest::new("catalog").with_strategy(Strategy::RoundRobin);

    let first: Vec<String> = (0..5).map(|_| engine.discover(&request).unwrap().name).collect();
    let start = names.iter().position(|n| *n == first[0]).unwrap();
    let expected: Vec<String> = (0..5).map(|i| names[(start + i) % 5].clone()).collect();
    assert_eq!(first, expected);

    // The next cycle repeats the same order
    let second: Vec<String> = (0..5).map(|_| engine.discover(&request).unwrap().name).collect();
    assert_eq!(first, second);
}

#[test]
fn consistent_hash_is_stable_for_a_fixed_key() {
    let (engine, _) = engine_with(seeded());
    register_ports(&engine, "catalog", 1..=8);
    let request = DiscoveryRequest::new("catalog")
        .with_strategy(Strategy::ConsistentHash)
        .with_client("user-1234");

    let first = engine.discover(&request).unwrap().name;
    for _ in 0..1000 {
        assert_eq!(engine.discover(&request).unwrap().name, first);
    }
}

#[test]
fn weighted_random_converges_to_weights() {
    let (engine, _) = engine_with(seeded());
    let key = ServiceKey::new("catalog");
    engine
        .register(&key, &NodeInfo::new("10.1.0.1", 1).with_weight(1))
        .unwrap();
    let heavy = engine
        .register(&key, &NodeInfo::new("10.1.0.1", 2).with_weight(3))
        .unwrap();

    let request = DiscoveryRequest::new("catalog").with_strategy(Strategy::WeightedRandom);
    let draws = 100_000;
    let hits = (0..draws)
        .filter(|_| engine.discover(&request).unwrap().name == heavy)
        .count();
    let share = hits as f64 / draws as f64;
    assert!((share - 0.75).abs() < 0.02, "heavy share {}", share);
}

#[test_log::test]
fn circuit_opens_half_opens_reopens_and_closes() {
    let (engine, clock) = engine_with(seeded());
    let names = register_ports(&engine, "payments", [1, 2]);
    let (flaky, steady) = (&names[0], &names[1]);
    let request = DiscoveryRequest::new("payments").with_strategy(Strategy::RoundRobin);

    for i in 0..5 {
        let state = engine.record_failure(flaky).unwrap();
        let expected = if i < 4 { CircuitState::Closed } else { CircuitState::Open };
        assert_eq!(state, expected);
    }
    for _ in 0..10 {
        assert_eq!(&engine.discover(&request).unwrap().name, steady);
    }

    // Base delay is 60s: not yet
    clock.advance(Duration::from_secs(59));
    for _ in 0..4 {
        assert_eq!(&engine.discover(&request).unwrap().name, steady);
    }

    // Half-open: reachable again
    clock.advance(Duration::from_secs(2));
    let seen: Vec<String> = (0..2).map(|_| engine.discover(&request).unwrap().name).collect();
    assert!(seen.contains(flaky));
    assert_eq!(engine.circuit_state(flaky), Some(CircuitState::HalfOpen));

    // One failure reopens with a doubled delay
    assert_eq!(engine.record_failure(flaky), Some(CircuitState::Open));
    clock.advance(Duration::from_secs(61));
    for _ in 0..4 {
        assert_eq!(&engine.discover(&request).unwrap().name, steady);
    }
    clock.advance(Duration::from_secs(60));
    engine.discover(&request).unwrap();
    assert_eq!(engine.circuit_state(flaky), Some(CircuitState::HalfOpen));

    // One success closes with a zero counter
    assert_eq!(engine.record_success(flaky), Some(CircuitState::Closed));
    assert_eq!(engine.node(flaky).unwrap().failure_count, 0);
    engine.check_invariants();
}

#[test]
fn success_closes_an_open_circuit_immediately() {
    let (engine, _) = engine_with(seeded());
    let names = register_ports(&engine, "payments", [1]);
    for _ in 0..5 {
        engine.record_failure(&names[0]);
    }
    assert!(matches!(
        engine.discover(&DiscoveryRequest::new("payments")),
        Err(RegistryError::CircuitOpen { .. })
    ));
    assert_eq!(engine.record_success(&names[0]), Some(CircuitState::Closed));
    assert_eq!(engine.discover(&DiscoveryRequest::new("payments")).unwrap().name, names[0]);
    assert_eq!(engine.stats().pending_timers, 0);
}

#[test_log::test]
fn lease_expiry_and_reregistration() {
    let (engine, clock) = engine_with(seeded());
    let names = register_ports(&engine, "search", [1, 2]);
    let request = DiscoveryRequest::new("search");

    clock.advance(Duration::from_secs(30));
    assert!(engine.heartbeat(&names[1]));
    clock.advance(Duration::from_secs(31));

    // Not yet swept: still discoverable
    let before: Vec<String> = (0..2).map(|_| engine.discover(&request).unwrap().name).collect();
    assert!(before.contains(&names[0]));

    let report = engine.sweep();
    assert_eq!(report.evicted.len(), 1);
    for _ in 0..4 {
        assert_eq!(engine.discover(&request).unwrap().name, names[1]);
    }

    engine
        .register(&ServiceKey::new("search"), &NodeInfo::new("10.1.0.1", 1))
        .unwrap();
    let after: Vec<String> = (0..2).map(|_| engine.discover(&request).unwrap().name).collect();
    assert!(after.contains(&names[0]));
}

#[test]
fn registering_a_second_node_invalidates_cached_selection() {
    let (engine, _) = engine_with(seeded());
    register_ports(&engine, "profile", [1]);
    let request = DiscoveryRequest::new("profile").with_strategy(Strategy::LeastResponseTime);

    assert_eq!(engine.discover(&request).unwrap().name, "10.1.0.1:1");
    engine.record_response_time("10.1.0.1:1", 250.0);
    assert_eq!(engine.discover(&request).unwrap().name, "10.1.0.1:1");
    assert!(engine.stats().cache.hits >= 1);

    register_ports(&engine, "profile", [2]);
    // The fresh node has no samples and wins least-response-time
    assert_eq!(engine.discover(&request).unwrap().name, "10.1.0.1:2");
}

#[test]
fn geo_aware_answers_follow_the_client_location() {
    let (engine, _) = engine_with(seeded());
    let key = ServiceKey::new("maps");
    let london = engine
        .register(&key, &NodeInfo::new("10.0.0.1", 1).with_location(51.5074, -0.1278))
        .unwrap();
    let tokyo = engine
        .register(&key, &NodeInfo::new("10.0.0.2", 1).with_location(35.6762, 139.6503))
        .unwrap();

    let near = |lat, lon| {
        DiscoveryRequest::new("maps")
            .with_strategy(Strategy::GeoAware)
            .with_location(GeoPoint::new(lat, lon))
    };
    assert_eq!(engine.discover(&near(51.5, -0.1)).unwrap().name, london);
    assert_eq!(engine.discover(&near(35.7, 139.7)).unwrap().name, tokyo);
    assert_eq!(engine.discover(&near(51.5, -0.1)).unwrap().name, london);
    assert!(engine.stats().cache.hits >= 1);
}

#[test]
fn geo_aware_without_coordinates_keeps_drawing() {
    let (engine, _) = engine_with(seeded());
    register_ports(&engine, "maps", 1..=3);
    let request = DiscoveryRequest::new("maps")
        .with_strategy(Strategy::GeoAware)
        .with_location(GeoPoint::new(48.8, 2.3));

    let seen: HashSet<String> = (0..30).map(|_| engine.discover(&request).unwrap().name).collect();
    assert!(seen.len() > 1);
    assert_eq!(engine.stats().cache.hits, 0);
}

#[test]
fn hash_strategies_rotate_without_a_client_key() {
    let (engine, _) = engine_with(seeded());
    register_ports(&engine, "catalog", 1..=3);

    for strategy in [
        Strategy::ConsistentHash,
        Strategy::IpHash,
        Strategy::RendezvousHash,
        Strategy::Sticky,
    ] {
        let anonymous = DiscoveryRequest::new("catalog").with_strategy(strategy);
        let seen: HashSet<String> = (0..30).map(|_| engine.discover(&anonymous).unwrap().name).collect();
        assert_eq!(seen.len(), 3, "{} pinned anonymous clients", strategy);

        let keyed = anonymous.clone().with_client("user-7");
        let first = engine.discover(&keyed).unwrap().name;
        for _ in 0..10 {
            assert_eq!(engine.discover(&keyed).unwrap().name, first);
        }
    }
}

#[test]
fn self_preservation_holds_nodes_until_renewals_recover() {
    let mut config = seeded();
    config.lease.self_preservation_min_instances = 5;
    let (engine, clock) = engine_with(config);
    let names = register_ports(&engine, "inventory", 1..=10);

    clock.advance(Duration::from_secs(90));
    for name in &names[..3] {
        engine.heartbeat(name);
    }
    let report = engine.sweep();
    assert!(report.self_preservation);
    assert!(report.evicted.is_empty());
    assert!(engine.in_self_preservation());
    assert_eq!(engine.stats().nodes, 10);

    for name in &names[..9] {
        engine.heartbeat(name);
    }
    let report = engine.sweep();
    assert!(!report.self_preservation);
    assert_eq!(report.evicted, vec![("inventory".to_string(), names[9].clone())]);
    assert!(!engine.stats().self_preservation);
}

#[test]
fn heartbeat_and_deregister_are_idempotent() {
    let (engine, _) = engine_with(seeded());
    let names = register_ports(&engine, "mail", [1, 2]);

    assert!(!engine.heartbeat("10.9.9.9:1"));
    assert!(!engine.deregister("10.9.9.9:1"));

    assert!(engine.deregister(&names[0]));
    assert!(!engine.deregister(&names[0]));
    assert!(!engine.heartbeat(&names[0]));

    assert_eq!(engine.service_nodes("mail").len(), 1);
    assert_eq!(engine.discover(&DiscoveryRequest::new("mail")).unwrap().name, names[1]);
    engine.check_invariants();

    // Re-registering a live node acts as a heartbeat
    let again = engine
        .register(&ServiceKey::new("mail"), &NodeInfo::new("10.1.0.1", 2))
        .unwrap();
    assert_eq!(again, names[1]);
    assert_eq!(engine.stats().nodes, 1);
}

#[test]
fn validation_and_capacity_errors() {
    let mut config = seeded();
    config.store.max_nodes_per_service = 2;
    let (engine, _) = engine_with(config);

    let err = engine
        .register(&ServiceKey::new(""), &NodeInfo::new("10.1.0.1", 1))
        .unwrap_err();
    assert!(matches!(err, RegistryError::Validation { .. }));
    let err = engine
        .register(&ServiceKey::new("mail"), &NodeInfo::new("", 1))
        .unwrap_err();
    assert!(matches!(err, RegistryError::Validation { .. }));
    let err = engine
        .register(&ServiceKey::new("mail"), &NodeInfo::new("10.1.0.1", 1).with_weight(1_000))
        .unwrap_err();
    assert!(matches!(err, RegistryError::Validation { .. }));

    register_ports(&engine, "mail", [1, 2]);
    let err = engine
        .register(&ServiceKey::new("mail"), &NodeInfo::new("10.1.0.1", 3))
        .unwrap_err();
    assert!(matches!(err, RegistryError::CapacityExceeded { limit: 2, .. }));
    assert!(!err.is_retryable());
}

#[test]
fn node_moves_between_services() {
    let (engine, _) = engine_with(seeded());
    let key_a = ServiceKey::new("billing").with_region("eu");
    let key_b = ServiceKey::new("billing").with_region("us");
    let info = NodeInfo::new("10.1.0.1", 1);

    engine.register(&key_a, &info).unwrap();
    engine.register(&key_b, &info).unwrap();
    assert!(engine.service_nodes("eu:billing").is_empty());
    assert_eq!(engine.service_nodes("us:billing").len(), 1);
    assert_eq!(engine.services(), vec!["us:billing".to_string()]);
    engine.check_invariants();
}

#[test]
fn lightning_config_disables_optional_features() {
    let (engine, _) = engine_with(RegistryConfig::lightning());
    let names = register_ports(&engine, "edge", [1, 2]);
    engine
        .set_canary("edge", 100.0, vec![names[1].clone()])
        .unwrap();
    engine.record_response_time(&names[0], 900.0);

    // Routing disabled: the canary policy is stored but not applied
    let request = DiscoveryRequest::new("edge").with_strategy(Strategy::RoundRobin);
    let seen: Vec<String> = (0..2).map(|_| engine.discover(&request).unwrap().name).collect();
    assert!(seen.contains(&names[0]));
    // Scoring disabled: every node keeps the maximum score
    assert_eq!(engine.health_score(&names[0]), Some(100.0));
    // Tag filters still work without indices
    assert!(engine
        .discover(&DiscoveryRequest::new("edge").with_tag("missing"))
        .is_err());
}
