//! # Discovery Registry Configuration
//!
//! This crate provides configuration management and default constants
//! for the discovery engine and the registry daemon.
//!
//! ## Features
//!
//! - **Defaults**: timeouts, thresholds and limits in one module
//! - **Settings**: TOML file + environment file + `DISCOVERY__*` overrides
//!
//! ## Usage
//!
//! ```rust,no_run
//! use discovery_config::{defaults, load_settings};
//!
//! let settings = load_settings(None, Some("production")).unwrap();
//! assert!(settings.lease.heartbeat_timeout_ms > 0);
//! let threshold = defaults::circuit::FAILURE_THRESHOLD;
//! # let _ = threshold;
//! ```

pub mod defaults;
pub mod settings;

// Re-export commonly used types
pub use settings::{
    load_settings, CacheSettings, CircuitSettings, FeatureSettings, FederationSettings,
    HealthSettings, LeaseSettings, LearningSettings, RegistrySettings, SnapshotSettings,
    StoreSettings,
};
