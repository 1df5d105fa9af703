//! Service Discovery Engine
//!
//! An in-process service registry: nodes register under qualified service
//! names, keep their lease alive with heartbeats, and are handed out to
//! callers by one of many load-balancing strategies.
//!
//! ## Components
//!
//! - **Registry**: per-service locked node store with tag/version/environment
//!   indices and an ordered view of eligible nodes
//! - **Leases**: heartbeat expiry with self-preservation during partitions
//! - **Circuit breaker**: per-node failure counting with exponential backoff
//!   and half-open probing
//! - **Health**: response-time windows and 0-100 health scores
//! - **Strategies**: round-robin, weighted, hashing, geographic, metric-driven
//!   and Q-learning selection
//! - **Traffic router**: canary, blue-green and version splits
//! - **Cache**: per-service discovery cache with access-adaptive TTLs
//! - **Snapshots, federation, probes, runtime loops**
//!
//! ## Usage
//!
//! ```rust
//! use discovery::{DiscoveryEngine, DiscoveryRequest, NodeInfo, RegistryConfig, ServiceKey, Strategy};
//!
//! let engine = DiscoveryEngine::new(RegistryConfig::default()).unwrap();
//! let key = ServiceKey::new("orders").with_namespace("prod");
//! engine.register(&key, &NodeInfo::new("10.0.0.1", 8080)).unwrap();
//! engine.register(&key, &NodeInfo::new("10.0.0.2", 8080)).unwrap();
//!
//! let request = DiscoveryRequest::new("prod:orders").with_strategy(Strategy::RoundRobin);
//! let node = engine.discover(&request).unwrap();
//! assert_eq!(node.name, "10.0.0.1:8080");
//! ```

pub mod cache;
pub mod circuit;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod federation;
pub mod health;
pub mod lease;
pub mod model;
pub mod probe;
pub mod registry;
pub mod runtime;
pub mod scheduler;
pub mod snapshot;
pub mod strategy;
pub mod traffic;

// Re-export commonly used types
pub use cache::{CacheKey, CacheStats, DiscoveryCache};
pub use circuit::{CircuitBreaker, CircuitState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    CacheConfig, CircuitConfig, FeatureFlags, FederationConfig, HealthConfig, LeaseConfig,
    LearningConfig, RegistryConfig, StoreConfig,
};
pub use engine::{DiscoveryEngine, DiscoveryRequest, RegistryStats};
pub use error::{RegistryError, Result};
pub use federation::{EnginePeer, Federation, PeerRegistry};
pub use lease::SweepReport;
pub use model::{GeoPoint, Node, NodeInfo, ServiceKey};
pub use probe::{HealthProbe, HealthProbeRunner, ProbeOutcome, ProbeReport, TcpConnectProbe};
pub use runtime::{RegistryRuntime, RuntimeHandle, SnapshotSchedule};
pub use snapshot::{ImportReport, RegistrySnapshot, SnapshotFormat};
pub use strategy::geo::{GeoResolver, StaticGeoResolver};
pub use strategy::learning::LearningStats;
pub use strategy::Strategy;
pub use traffic::{Deployment, TrafficPolicy};
