//! Registry Settings Module
//!
//! Provides configuration loading for the discovery registry.
//! Supports loading from TOML files with environment-specific overrides
//! and `DISCOVERY__SECTION__FIELD` environment variables.

use anyhow::{Context, Result};
use config_crate::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::defaults;

/// Main registry configuration structure
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct RegistrySettings {
    pub registry: StoreSettings,
    pub lease: LeaseSettings,
    pub circuit: CircuitSettings,
    pub health: HealthSettings,
    pub cache: CacheSettings,
    pub learning: LearningSettings,
    pub features: FeatureSettings,
    pub federation: FederationSettings,
    pub snapshot: SnapshotSettings,
}

/// Registry store settings
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct StoreSettings {
    pub max_nodes_per_service: usize,
    pub max_weight: u32,
    pub default_strategy: String,
    pub hash_ring_replicas: usize,
    /// Fixed seed for the selection RNG; random when absent
    pub rng_seed: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct LeaseSettings {
    pub heartbeat_timeout_ms: u64,
    pub sweep_interval_ms: u64,
    pub renewal_threshold: f64,
    pub renewal_window_ms: u64,
    pub self_preservation: bool,
    pub self_preservation_min_instances: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct CircuitSettings {
    pub failure_threshold: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub timer_poll_interval_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct HealthSettings {
    pub response_window: usize,
    pub trend_window: usize,
    pub rescore_interval_ms: u64,
    pub probe_interval_ms: u64,
    pub probe_timeout_ms: u64,
    pub probe_concurrency: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    pub base_ttl_ms: u64,
    pub max_ttl_ms: u64,
    pub ema_alpha: f64,
    pub ttl_per_hz_ms: u64,
    pub max_entries: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct LearningSettings {
    pub alpha: f64,
    pub epsilon: f64,
    pub pending_ttl_ms: u64,
}

/// Feature flags
///
/// Turning the first three off gives the lean "fast path" profile.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct FeatureSettings {
    pub health_scoring: bool,
    pub traffic_routing: bool,
    pub secondary_indices: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct FederationSettings {
    pub query_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct SnapshotSettings {
    /// Snapshot file; shell variables are expanded
    pub path: Option<String>,
    /// "json" or "binary"
    pub format: String,
    pub interval_ms: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            max_nodes_per_service: defaults::registry::MAX_NODES_PER_SERVICE,
            max_weight: defaults::registry::MAX_WEIGHT,
            default_strategy: defaults::registry::DEFAULT_STRATEGY.to_string(),
            hash_ring_replicas: defaults::registry::HASH_RING_REPLICAS,
            rng_seed: None,
        }
    }
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: defaults::lease::HEARTBEAT_TIMEOUT_MS,
            sweep_interval_ms: defaults::lease::SWEEP_INTERVAL_MS,
            renewal_threshold: defaults::lease::RENEWAL_THRESHOLD,
            renewal_window_ms: defaults::lease::RENEWAL_WINDOW_MS,
            self_preservation: true,
            self_preservation_min_instances: defaults::lease::SELF_PRESERVATION_MIN_INSTANCES,
        }
    }
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            failure_threshold: defaults::circuit::FAILURE_THRESHOLD,
            base_delay_ms: defaults::circuit::BASE_DELAY_MS,
            max_delay_ms: defaults::circuit::MAX_DELAY_MS,
            backoff_multiplier: defaults::circuit::BACKOFF_MULTIPLIER,
            timer_poll_interval_ms: defaults::circuit::TIMER_POLL_INTERVAL_MS,
        }
    }
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            response_window: defaults::health::RESPONSE_WINDOW,
            trend_window: defaults::health::TREND_WINDOW,
            rescore_interval_ms: defaults::health::RESCORE_INTERVAL_MS,
            probe_interval_ms: defaults::health::PROBE_INTERVAL_MS,
            probe_timeout_ms: defaults::health::PROBE_TIMEOUT_MS,
            probe_concurrency: defaults::health::PROBE_CONCURRENCY,
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            base_ttl_ms: defaults::cache::BASE_TTL_MS,
            max_ttl_ms: defaults::cache::MAX_TTL_MS,
            ema_alpha: defaults::cache::EMA_ALPHA,
            ttl_per_hz_ms: defaults::cache::TTL_PER_HZ_MS,
            max_entries: defaults::cache::MAX_ENTRIES,
        }
    }
}

impl Default for LearningSettings {
    fn default() -> Self {
        Self {
            alpha: defaults::learning::ALPHA,
            epsilon: defaults::learning::EPSILON,
            pending_ttl_ms: defaults::learning::PENDING_TTL_MS,
        }
    }
}

impl Default for FeatureSettings {
    fn default() -> Self {
        Self {
            health_scoring: true,
            traffic_routing: true,
            secondary_indices: true,
        }
    }
}

impl Default for FederationSettings {
    fn default() -> Self {
        Self {
            query_timeout_ms: defaults::federation::QUERY_TIMEOUT_MS,
        }
    }
}

impl Default for SnapshotSettings {
    fn default() -> Self {
        Self {
            path: None,
            format: defaults::snapshot::FORMAT.to_string(),
            interval_ms: defaults::snapshot::INTERVAL_MS,
        }
    }
}

impl RegistrySettings {
    /// Load configuration from files with environment overrides
    ///
    /// The base file is only required when a path is given explicitly;
    /// otherwise `config/registry.toml` is used if present and defaults
    /// fill everything else.
    pub fn load(base_path: Option<&Path>, environment: Option<&str>) -> Result<Self> {
        let base = base_path.unwrap_or(Path::new("config/registry.toml"));

        let mut builder = Config::builder()
            .add_source(File::from(base).required(base_path.is_some()));

        if let Some(env) = environment {
            let env_dir = base.parent().unwrap_or(Path::new("config"));
            let env_file = env_dir.join("environments").join(format!("{}.toml", env));

            if env_file.exists() {
                info!("Loading environment config: {:?}", env_file);
                builder = builder.add_source(File::from(env_file));
            } else {
                warn!("Environment config not found: {:?}", env_file);
            }
        }

        // Field names contain underscores, so sections are split on "__"
        builder = builder.add_source(
            Environment::with_prefix("DISCOVERY")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Expand environment variables in path-like values
    pub fn expand_env_vars(&mut self) -> Result<()> {
        if let Some(path) = &self.snapshot.path {
            let expanded = shellexpand::full(path).context("Failed to expand snapshot path")?;
            self.snapshot.path = Some(expanded.to_string());
        }
        Ok(())
    }

    /// Resolved snapshot file, if one is configured
    pub fn snapshot_path(&self) -> Option<PathBuf> {
        self.snapshot.path.as_ref().map(PathBuf::from)
    }

    /// Render as TOML, e.g. to seed a new config file
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to render configuration as TOML")
    }
}

/// Convenience function to load configuration with defaults
pub fn load_settings(path: Option<&Path>, environment: Option<&str>) -> Result<RegistrySettings> {
    let mut settings = RegistrySettings::load(path, environment)?;
    settings.expand_env_vars()?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_load_partial_file_keeps_defaults() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("registry.toml");

        let config_content = r#"
[lease]
heartbeat_timeout_ms = 30000

[circuit]
failure_threshold = 3

[features]
traffic_routing = false
"#;

        fs::write(&config_path, config_content).unwrap();

        let settings = RegistrySettings::load(Some(&config_path), None).unwrap();

        assert_eq!(settings.lease.heartbeat_timeout_ms, 30_000);
        assert_eq!(settings.circuit.failure_threshold, 3);
        assert!(!settings.features.traffic_routing);
        assert!(settings.features.health_scoring);
        assert_eq!(settings.cache.base_ttl_ms, defaults::cache::BASE_TTL_MS);
        assert_eq!(settings.registry.default_strategy, "round-robin");
    }

    #[test]
    fn test_environment_file_overrides_base() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("registry.toml");
        fs::write(&config_path, "[cache]\nbase_ttl_ms = 1000\n").unwrap();

        let env_dir = dir.path().join("environments");
        fs::create_dir(&env_dir).unwrap();
        fs::write(env_dir.join("staging.toml"), "[cache]\nbase_ttl_ms = 2000\n").unwrap();

        let settings = RegistrySettings::load(Some(&config_path), Some("staging")).unwrap();
        assert_eq!(settings.cache.base_ttl_ms, 2000);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(RegistrySettings::load(Some(&missing), None).is_err());
    }

    #[test]
    fn test_toml_rendering_parses_back() {
        let settings = RegistrySettings::default();
        let rendered = settings.to_toml_string().unwrap();
        let parsed: RegistrySettings = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed, settings);
    }
}
