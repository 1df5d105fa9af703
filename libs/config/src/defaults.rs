//! Registry defaults
//!
//! Default configuration values and constants shared by the discovery
//! engine and the registry daemon, kept in one place so the two never
//! disagree about a timeout.

/// Registry store defaults
pub mod registry {
    /// Maximum nodes a single service may hold
    pub const MAX_NODES_PER_SERVICE: usize = 1000;

    /// Upper bound for a node's declared weight
    pub const MAX_WEIGHT: u32 = 100;

    /// Weight assumed when a registration does not declare one
    pub const DEFAULT_WEIGHT: u32 = 1;

    /// Strategy used when a request names none (or an unknown one)
    pub const DEFAULT_STRATEGY: &str = "round-robin";

    /// Segment delimiter for fully-qualified service names
    pub const NAME_DELIMITER: char = ':';

    /// Value of a scope segment that is left out of qualified names
    pub const DEFAULT_SEGMENT: &str = "default";

    /// Virtual nodes per physical node on the consistent-hash ring
    pub const HASH_RING_REPLICAS: usize = 64;
}

/// Lease and self-preservation defaults
pub mod lease {
    /// Heartbeat age after which a node expires (milliseconds)
    pub const HEARTBEAT_TIMEOUT_MS: u64 = 60_000;

    /// Interval between expiry sweeps (milliseconds)
    pub const SWEEP_INTERVAL_MS: u64 = 10_000;

    /// Renewal ratio below which eviction is suspended
    pub const RENEWAL_THRESHOLD: f64 = 0.85;

    /// Window in which a heartbeat counts as a renewal (milliseconds)
    pub const RENEWAL_WINDOW_MS: u64 = 60_000;

    /// Cluster size below which self-preservation is never entered
    pub const SELF_PRESERVATION_MIN_INSTANCES: usize = 10;
}

/// Circuit breaker defaults
pub mod circuit {
    /// Consecutive failures before the circuit opens
    pub const FAILURE_THRESHOLD: u32 = 5;

    /// First open-state backoff (milliseconds)
    pub const BASE_DELAY_MS: u64 = 60_000;

    /// Backoff ceiling (milliseconds)
    pub const MAX_DELAY_MS: u64 = 300_000;

    /// Backoff growth per re-open
    pub const BACKOFF_MULTIPLIER: f64 = 2.0;

    /// How often the runtime drains due retry timers (milliseconds)
    pub const TIMER_POLL_INTERVAL_MS: u64 = 1_000;
}

/// Health scoring and probe defaults
pub mod health {
    /// Response-time samples kept per node
    pub const RESPONSE_WINDOW: usize = 100;

    /// Samples used by the predictive trend
    pub const TREND_WINDOW: usize = 10;

    /// Periodic rescoring interval (milliseconds)
    pub const RESCORE_INTERVAL_MS: u64 = 30_000;

    /// Active probe interval (milliseconds)
    pub const PROBE_INTERVAL_MS: u64 = 15_000;

    /// Per-probe timeout (milliseconds)
    pub const PROBE_TIMEOUT_MS: u64 = 2_000;

    /// Probes in flight at once
    pub const PROBE_CONCURRENCY: usize = 32;
}

/// Discovery cache defaults
pub mod cache {
    pub const BASE_TTL_MS: u64 = 15_000;
    pub const MAX_TTL_MS: u64 = 300_000;
    pub const EMA_ALPHA: f64 = 0.1;

    /// TTL added per request/second of smoothed access frequency
    pub const TTL_PER_HZ_MS: u64 = 10_000;

    pub const MAX_ENTRIES: usize = 50_000;
}

/// Q-learning defaults for the ai-driven strategy
pub mod learning {
    pub const ALPHA: f64 = 0.1;
    pub const EPSILON: f64 = 0.1;

    /// Selections older than this no longer receive rewards (milliseconds)
    pub const PENDING_TTL_MS: u64 = 60_000;
}

/// Federation defaults
pub mod federation {
    /// Per-peer query timeout (milliseconds)
    pub const QUERY_TIMEOUT_MS: u64 = 500;
}

/// Snapshot defaults
pub mod snapshot {
    pub const FORMAT: &str = "json";

    /// Periodic snapshot interval for the daemon (milliseconds)
    pub const INTERVAL_MS: u64 = 60_000;
}
