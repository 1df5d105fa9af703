//! Node and Service Model
//!
//! Value types shared by every component. [`NodeInfo`] is what a caller
//! registers, [`Node`] is what the registry stores and hands back from
//! discovery, and [`ServiceKey`] builds fully-qualified service names.

use discovery_config::defaults::registry::{DEFAULT_SEGMENT, NAME_DELIMITER};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::{RegistryError, Result};

/// Metadata key for a node's latitude
pub const META_LATITUDE: &str = "lat";
/// Metadata key for a node's longitude
pub const META_LONGITUDE: &str = "lon";
/// Metadata key for a node's cost tier (lower is cheaper)
pub const META_COST_TIER: &str = "cost_tier";

/// Scope segments that together identify one service
///
/// Segments equal to `"default"` are omitted from the qualified name;
/// the service segment is always present.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceKey {
    pub tenant: String,
    pub namespace: String,
    pub datacenter: String,
    pub region: String,
    pub zone: String,
    pub service: String,
    pub version: Option<String>,
}

impl ServiceKey {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            tenant: DEFAULT_SEGMENT.to_string(),
            namespace: DEFAULT_SEGMENT.to_string(),
            datacenter: DEFAULT_SEGMENT.to_string(),
            region: DEFAULT_SEGMENT.to_string(),
            zone: DEFAULT_SEGMENT.to_string(),
            service: service.into(),
            version: None,
        }
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = tenant.into();
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_datacenter(mut self, datacenter: impl Into<String>) -> Self {
        self.datacenter = datacenter.into();
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    pub fn with_zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = zone.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Fully-qualified name, e.g. `acme:payments:eu-west:checkout:v2`
    pub fn qualified(&self) -> String {
        let scopes = [
            &self.tenant,
            &self.namespace,
            &self.datacenter,
            &self.region,
            &self.zone,
        ];
        let mut segments: Vec<&str> = scopes
            .into_iter()
            .filter(|s| s.as_str() != DEFAULT_SEGMENT)
            .map(String::as_str)
            .collect();
        segments.push(&self.service);
        if let Some(version) = &self.version {
            segments.push(version);
        }
        segments.join(NAME_DELIMITER.to_string().as_str())
    }

    pub fn validate(&self) -> Result<()> {
        if self.service.trim().is_empty() {
            return Err(RegistryError::validation(
                "service name cannot be empty",
                Some("service"),
            ));
        }
        let segments = [
            ("tenant", self.tenant.as_str()),
            ("namespace", self.namespace.as_str()),
            ("datacenter", self.datacenter.as_str()),
            ("region", self.region.as_str()),
            ("zone", self.zone.as_str()),
            ("service", self.service.as_str()),
            ("version", self.version.as_deref().unwrap_or("")),
        ];
        for (field, value) in segments {
            if value.contains(NAME_DELIMITER) {
                return Err(RegistryError::validation(
                    format!("{} segment '{}' contains '{}'", field, value, NAME_DELIMITER),
                    Some(field),
                ));
            }
        }
        Ok(())
    }
}

impl From<&str> for ServiceKey {
    fn from(service: &str) -> Self {
        Self::new(service)
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.qualified())
    }
}

/// Registration input for one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub host: String,
    pub port: u16,
    pub weight: Option<u32>,
    pub tags: Vec<String>,
    pub version: Option<String>,
    pub environment: Option<String>,
    pub metadata: BTreeMap<String, String>,
    /// Register without entering the available view
    pub maintenance: bool,
}

impl NodeInfo {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            weight: None,
            tags: Vec::new(),
            version: None,
            environment: None,
            metadata: BTreeMap::new(),
            maintenance: false,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_location(self, latitude: f64, longitude: f64) -> Self {
        self.with_metadata(META_LATITUDE, latitude.to_string())
            .with_metadata(META_LONGITUDE, longitude.to_string())
    }

    pub fn in_maintenance(mut self) -> Self {
        self.maintenance = true;
        self
    }

    /// Node identity, `host:port`
    pub fn node_name(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check registration input against the weight ceiling
    pub fn validate(&self, max_weight: u32) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(RegistryError::validation("host cannot be empty", Some("host")));
        }
        if self.port == 0 {
            return Err(RegistryError::validation("port cannot be zero", Some("port")));
        }
        if let Some(weight) = self.weight {
            if weight == 0 || weight > max_weight {
                return Err(RegistryError::validation(
                    format!("weight {} outside 1..={}", weight, max_weight),
                    Some("weight"),
                ));
            }
        }
        if self.tags.iter().any(|t| t.trim().is_empty()) {
            return Err(RegistryError::validation("tags cannot be empty", Some("tags")));
        }
        Ok(())
    }
}

/// Geographic coordinates in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

/// A registered node as the registry sees it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    /// Qualified name of the owning service
    pub service: String,
    pub address: String,
    pub port: u16,
    pub weight: u32,
    pub tags: BTreeSet<String>,
    pub version: Option<String>,
    pub environment: Option<String>,
    pub metadata: BTreeMap<String, String>,
    /// In-flight requests reported through connection tracking
    pub connections: u32,
    pub healthy: bool,
    pub failure_count: u32,
    /// Wall-clock milliseconds of the most recent failure
    pub last_failure_ms: Option<u64>,
}

impl Node {
    pub(crate) fn from_info(service: &str, info: &NodeInfo, default_weight: u32) -> Self {
        Self {
            name: info.node_name(),
            service: service.to_string(),
            address: info.host.clone(),
            port: info.port,
            weight: info.weight.unwrap_or(default_weight),
            tags: info.tags.iter().cloned().collect(),
            version: info.version.clone(),
            environment: info.environment.clone(),
            metadata: info.metadata.clone(),
            connections: 0,
            healthy: true,
            failure_count: 0,
            last_failure_ms: None,
        }
    }

    /// Registration input that would recreate this node
    pub fn to_info(&self, maintenance: bool) -> NodeInfo {
        NodeInfo {
            host: self.address.clone(),
            port: self.port,
            weight: Some(self.weight),
            tags: self.tags.iter().cloned().collect(),
            version: self.version.clone(),
            environment: self.environment.clone(),
            metadata: self.metadata.clone(),
            maintenance,
        }
    }

    pub fn has_all_tags(&self, tags: &[String]) -> bool {
        tags.iter().all(|t| self.tags.contains(t))
    }

    /// Coordinates from metadata, if both parse
    pub fn location(&self) -> Option<GeoPoint> {
        let lat = self.metadata.get(META_LATITUDE)?.parse().ok()?;
        let lon = self.metadata.get(META_LONGITUDE)?.parse().ok()?;
        Some(GeoPoint::new(lat, lon))
    }

    pub fn cost_tier(&self) -> Option<f64> {
        self.metadata.get(META_COST_TIER)?.parse().ok()
    }
}
