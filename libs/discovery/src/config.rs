//! Engine Configuration
//!
//! Strongly-typed configuration for every engine component. Built from
//! [`RegistrySettings`] (the file/env layer) or from presets, validated
//! before use, and swappable at runtime through
//! [`DiscoveryEngine::reload_config`](crate::engine::DiscoveryEngine::reload_config).

use discovery_config::RegistrySettings;
use std::time::Duration;

use crate::strategy::Strategy;
use crate::{RegistryError, Result};

/// Complete engine configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryConfig {
    pub store: StoreConfig,
    pub lease: LeaseConfig,
    pub circuit: CircuitConfig,
    pub health: HealthConfig,
    pub cache: CacheConfig,
    pub learning: LearningConfig,
    pub features: FeatureFlags,
    pub federation: FederationConfig,
}

/// Registry store limits and strategy defaults
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    pub max_nodes_per_service: usize,
    pub max_weight: u32,
    pub default_strategy: Strategy,
    pub hash_ring_replicas: usize,
    /// Seed for the selection RNG; entropy-seeded when `None`
    pub rng_seed: Option<u64>,
}

/// Lease expiry and self-preservation
#[derive(Debug, Clone, PartialEq)]
pub struct LeaseConfig {
    pub heartbeat_timeout: Duration,
    pub sweep_interval: Duration,
    pub renewal_threshold: f64,
    pub renewal_window: Duration,
    pub self_preservation: bool,
    pub self_preservation_min_instances: usize,
}

/// Circuit breaker thresholds and backoff
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub timer_poll_interval: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HealthConfig {
    pub response_window: usize,
    pub trend_window: usize,
    pub rescore_interval: Duration,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub probe_concurrency: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    pub enabled: bool,
    pub base_ttl: Duration,
    pub max_ttl: Duration,
    pub ema_alpha: f64,
    pub ttl_per_hz: Duration,
    pub max_entries: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LearningConfig {
    pub alpha: f64,
    pub epsilon: f64,
    pub pending_ttl: Duration,
}

/// Optional subsystems
///
/// With all three off the engine runs the lean fast path: no health
/// scores, no traffic overrides, and tag/version filters are evaluated
/// by scanning instead of through indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureFlags {
    pub health_scoring: bool,
    pub traffic_routing: bool,
    pub secondary_indices: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FederationConfig {
    pub query_timeout: Duration,
}

impl CircuitConfig {
    /// Open-state delay for the given episode (1-based), capped at `max_delay`
    pub fn backoff_delay(&self, episode: u32) -> Duration {
        let exponent = episode.saturating_sub(1).min(63) as i32;
        let base_ms = self.base_delay.as_millis() as f64;
        let delay_ms = base_ms * self.backoff_multiplier.powi(exponent);
        let capped = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::from(&RegistrySettings::default())
    }
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            health_scoring: true,
            traffic_routing: true,
            secondary_indices: true,
        }
    }
}

impl From<&RegistrySettings> for RegistryConfig {
    fn from(s: &RegistrySettings) -> Self {
        let ms = Duration::from_millis;
        Self {
            store: StoreConfig {
                max_nodes_per_service: s.registry.max_nodes_per_service,
                max_weight: s.registry.max_weight,
                default_strategy: Strategy::resolve(&s.registry.default_strategy),
                hash_ring_replicas: s.registry.hash_ring_replicas,
                rng_seed: s.registry.rng_seed,
            },
            lease: LeaseConfig {
                heartbeat_timeout: ms(s.lease.heartbeat_timeout_ms),
                sweep_interval: ms(s.lease.sweep_interval_ms),
                renewal_threshold: s.lease.renewal_threshold,
                renewal_window: ms(s.lease.renewal_window_ms),
                self_preservation: s.lease.self_preservation,
                self_preservation_min_instances: s.lease.self_preservation_min_instances,
            },
            circuit: CircuitConfig {
                failure_threshold: s.circuit.failure_threshold,
                base_delay: ms(s.circuit.base_delay_ms),
                max_delay: ms(s.circuit.max_delay_ms),
                backoff_multiplier: s.circuit.backoff_multiplier,
                timer_poll_interval: ms(s.circuit.timer_poll_interval_ms),
            },
            health: HealthConfig {
                response_window: s.health.response_window,
                trend_window: s.health.trend_window,
                rescore_interval: ms(s.health.rescore_interval_ms),
                probe_interval: ms(s.health.probe_interval_ms),
                probe_timeout: ms(s.health.probe_timeout_ms),
                probe_concurrency: s.health.probe_concurrency,
            },
            cache: CacheConfig {
                enabled: s.cache.enabled,
                base_ttl: ms(s.cache.base_ttl_ms),
                max_ttl: ms(s.cache.max_ttl_ms),
                ema_alpha: s.cache.ema_alpha,
                ttl_per_hz: ms(s.cache.ttl_per_hz_ms),
                max_entries: s.cache.max_entries,
            },
            learning: LearningConfig {
                alpha: s.learning.alpha,
                epsilon: s.learning.epsilon,
                pending_ttl: ms(s.learning.pending_ttl_ms),
            },
            features: FeatureFlags {
                health_scoring: s.features.health_scoring,
                traffic_routing: s.features.traffic_routing,
                secondary_indices: s.features.secondary_indices,
            },
            federation: FederationConfig {
                query_timeout: ms(s.federation.query_timeout_ms),
            },
        }
    }
}

impl RegistryConfig {
    /// Lean profile: health scoring, traffic routing and secondary
    /// indices disabled
    pub fn lightning() -> Self {
        let mut config = Self::default();
        config.features = FeatureFlags {
            health_scoring: false,
            traffic_routing: false,
            secondary_indices: false,
        };
        config
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.store.max_nodes_per_service == 0 {
            return Err(RegistryError::configuration(
                "max_nodes_per_service cannot be zero",
                Some("registry.max_nodes_per_service"),
            ));
        }

        if self.store.max_weight == 0 {
            return Err(RegistryError::configuration(
                "max_weight cannot be zero",
                Some("registry.max_weight"),
            ));
        }

        if self.store.hash_ring_replicas == 0 {
            return Err(RegistryError::configuration(
                "hash_ring_replicas cannot be zero",
                Some("registry.hash_ring_replicas"),
            ));
        }

        if self.lease.heartbeat_timeout.is_zero() {
            return Err(RegistryError::configuration(
                "heartbeat_timeout cannot be zero",
                Some("lease.heartbeat_timeout_ms"),
            ));
        }

        if self.lease.sweep_interval.is_zero() {
            return Err(RegistryError::configuration(
                "sweep_interval cannot be zero",
                Some("lease.sweep_interval_ms"),
            ));
        }

        if !(0.0..=1.0).contains(&self.lease.renewal_threshold) {
            return Err(RegistryError::configuration(
                format!(
                    "renewal_threshold must be within [0, 1], got {}",
                    self.lease.renewal_threshold
                ),
                Some("lease.renewal_threshold"),
            ));
        }

        if self.circuit.failure_threshold == 0 {
            return Err(RegistryError::configuration(
                "failure_threshold cannot be zero",
                Some("circuit.failure_threshold"),
            ));
        }

        if self.circuit.max_delay < self.circuit.base_delay {
            return Err(RegistryError::configuration(
                "max_delay must not be shorter than base_delay",
                Some("circuit.max_delay_ms"),
            ));
        }

        if self.circuit.backoff_multiplier < 1.0 {
            return Err(RegistryError::configuration(
                "backoff_multiplier must be at least 1.0",
                Some("circuit.backoff_multiplier"),
            ));
        }

        if self.health.response_window == 0 || self.health.trend_window < 2 {
            return Err(RegistryError::configuration(
                "response_window must be non-zero and trend_window at least 2",
                Some("health.trend_window"),
            ));
        }

        if self.health.probe_concurrency == 0 {
            return Err(RegistryError::configuration(
                "probe_concurrency cannot be zero",
                Some("health.probe_concurrency"),
            ));
        }

        if self.cache.max_ttl < self.cache.base_ttl {
            return Err(RegistryError::configuration(
                "cache max_ttl must not be shorter than base_ttl",
                Some("cache.max_ttl_ms"),
            ));
        }

        if !(0.0..=1.0).contains(&self.cache.ema_alpha) || self.cache.ema_alpha == 0.0 {
            return Err(RegistryError::configuration(
                "ema_alpha must be within (0, 1]",
                Some("cache.ema_alpha"),
            ));
        }

        for (value, field) in [
            (self.learning.alpha, "learning.alpha"),
            (self.learning.epsilon, "learning.epsilon"),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(RegistryError::configuration(
                    format!("{} must be within [0, 1], got {}", field, value),
                    Some(field),
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = RegistryConfig::default();
        config.validate().unwrap();
        assert_eq!(config.store.default_strategy, Strategy::RoundRobin);
        assert_eq!(config.circuit.failure_threshold, 5);
        assert_eq!(config.lease.renewal_threshold, 0.85);
    }

    #[test]
    fn test_lightning_disables_optional_subsystems() {
        let config = RegistryConfig::lightning();
        config.validate().unwrap();
        assert!(!config.features.health_scoring);
        assert!(!config.features.traffic_routing);
        assert!(!config.features.secondary_indices);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let circuit = CircuitConfig {
            failure_threshold: 5,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(100),
            backoff_multiplier: 2.0,
            timer_poll_interval: Duration::from_secs(1),
        };
        assert_eq!(circuit.backoff_delay(1), Duration::from_secs(30));
        assert_eq!(circuit.backoff_delay(2), Duration::from_secs(60));
        assert_eq!(circuit.backoff_delay(3), Duration::from_secs(100));
        assert_eq!(circuit.backoff_delay(40), Duration::from_secs(100));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut config = RegistryConfig::default();
        config.lease.renewal_threshold = 1.5;
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Configuration { field: Some(ref f), .. } if f == "lease.renewal_threshold"
        ));

        let mut config = RegistryConfig::default();
        config.circuit.max_delay = Duration::from_millis(1);
        assert!(config.validate().is_err());

        let mut config = RegistryConfig::default();
        config.learning.epsilon = -0.1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_default_strategy_falls_back() {
        let mut settings = RegistrySettings::default();
        settings.registry.default_strategy = "quantum-annealing".to_string();
        let config = RegistryConfig::from(&settings);
        assert_eq!(config.store.default_strategy, Strategy::RoundRobin);
    }
}
