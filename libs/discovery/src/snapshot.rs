//! Registry Snapshots
//!
//! `export()` captures everything needed to rebuild the registry after a
//! restart: nodes with their lease age, circuit and response history,
//! traffic policies, aliases, sticky assignments and learned Q-values.
//! Instants are stored relative to the capture time so a snapshot can be
//! restored by another process.
//!
//! ## Wire format
//!
//! ```text
//! ┌───────┬─────────┬────────┬──────────┬──────────┬────────┬──────────────┬─────────┐
//! │ magic │ version │ format │ reserved │ checksum │ length │ taken_at_ms  │ payload │
//! │ DSNP  │   u8    │   u8   │   u16    │ u32 crc  │  u32   │     u64      │  bytes  │
//! └───────┴─────────┴────────┴──────────┴──────────┴────────┴──────────────┴─────────┘
//! ```
//!
//! Integers are little-endian. The checksum is CRC32 over the payload,
//! which is JSON or bincode depending on the format byte.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Cursor, ErrorKind, Read, Write};
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::circuit::{CircuitRecord, CircuitState};
use crate::model::NodeInfo;
use crate::registry::Registry;
use crate::strategy::StrategyEngine;
use crate::traffic::{TrafficPolicy, TrafficRouter};
use crate::{RegistryError, Result};

pub const SNAPSHOT_MAGIC: [u8; 4] = *b"DSNP";
pub const SNAPSHOT_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 24;

/// Payload encoding
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotFormat {
    Json = 0,
    Binary = 1,
}

impl SnapshotFormat {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(SnapshotFormat::Json),
            1 => Some(SnapshotFormat::Binary),
            _ => None,
        }
    }
}

impl Default for SnapshotFormat {
    fn default() -> Self {
        SnapshotFormat::Json
    }
}

impl fmt::Display for SnapshotFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotFormat::Json => f.write_str("json"),
            SnapshotFormat::Binary => f.write_str("binary"),
        }
    }
}

impl FromStr for SnapshotFormat {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(SnapshotFormat::Json),
            "binary" | "bincode" => Ok(SnapshotFormat::Binary),
            other => Err(RegistryError::configuration(
                format!("unknown snapshot format '{}'", other),
                Some("snapshot.format"),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub episode: u32,
    /// Milliseconds until an open circuit may be retried
    pub retry_in_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub info: NodeInfo,
    pub heartbeat_age_ms: u64,
    pub connections: u32,
    pub last_failure_ms: Option<u64>,
    pub circuit: CircuitSnapshot,
    pub response_samples: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSnapshot {
    pub name: String,
    /// Registration order
    pub nodes: Vec<NodeSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub version: u8,
    pub taken_at_ms: u64,
    pub services: Vec<ServiceSnapshot>,
    pub aliases: Vec<(String, String)>,
    pub traffic: Vec<(String, TrafficPolicy)>,
    /// `(service, client, node)`
    pub sticky: Vec<(String, String, String)>,
    /// `(state, node, value)`
    pub q_values: Vec<(String, String, f64)>,
}

impl RegistrySnapshot {
    pub fn node_count(&self) -> usize {
        self.services.iter().map(|s| s.nodes.len()).sum()
    }
}

/// What an import restored
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportReport {
    pub services: usize,
    pub nodes: usize,
    /// Nodes rejected by validation or capacity
    pub skipped: usize,
    pub taken_at_ms: u64,
    /// Open circuits that need a retry timer
    pub retry_timers: Vec<(String, Instant)>,
}

/// Capture registry state; each service is read under its own lock
pub(crate) fn capture(
    registry: &Registry,
    router: &TrafficRouter,
    strategies: &StrategyEngine,
) -> RegistrySnapshot {
    let now = registry.clock().now();
    let mut services = Vec::new();
    for handle in registry.handles() {
        let entry = handle.read();
        let nodes = entry
            .ordered_slots()
            .into_iter()
            .map(|slot| NodeSnapshot {
                info: slot.node.to_info(slot.maintenance),
                heartbeat_age_ms: millis(now.saturating_duration_since(slot.last_heartbeat)),
                connections: slot.node.connections,
                last_failure_ms: slot.node.last_failure_ms,
                circuit: CircuitSnapshot {
                    state: slot.circuit.state,
                    failure_count: slot.circuit.failure_count,
                    episode: slot.circuit.episode,
                    retry_in_ms: slot.circuit.remaining(now).map(millis),
                },
                response_samples: slot.stats.samples().collect(),
            })
            .collect();
        services.push(ServiceSnapshot {
            name: entry.name().to_string(),
            nodes,
        });
    }
    services.sort_by(|a, b| a.name.cmp(&b.name));

    let mut traffic = router.policies();
    traffic.sort_by(|a, b| a.0.cmp(&b.0));
    let mut sticky = strategies.sticky_snapshot();
    sticky.sort();
    let mut q_values = strategies.learner().entries();
    q_values.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));

    RegistrySnapshot {
        version: SNAPSHOT_VERSION,
        taken_at_ms: registry.clock().wall_ms(),
        services,
        aliases: registry.aliases(),
        traffic,
        sticky,
        q_values,
    }
}

/// Apply a snapshot on top of the current state
///
/// Nodes already registered keep their tags, weight, version and metadata;
/// their lease, circuit, connections and response history are replaced by
/// the snapshot's view.
pub(crate) fn restore(
    snapshot: RegistrySnapshot,
    registry: &Registry,
    router: &TrafficRouter,
    strategies: &StrategyEngine,
    response_window: usize,
) -> Result<ImportReport> {
    if snapshot.version != SNAPSHOT_VERSION {
        return Err(RegistryError::snapshot(format!(
            "unsupported snapshot version {}",
            snapshot.version
        )));
    }

    let now = registry.clock().now();
    let mut report = ImportReport {
        taken_at_ms: snapshot.taken_at_ms,
        ..Default::default()
    };

    for service in snapshot.services {
        let mut restored = 0;
        for node in service.nodes {
            let registration = match registry.register_qualified(service.name.clone(), &node.info) {
                Ok(r) => r,
                Err(e) => {
                    warn!("Skipping {} from snapshot: {}", node.info.node_name(), e);
                    report.skipped += 1;
                    continue;
                }
            };

            let retry_at = node.circuit.retry_in_ms.map(|ms| now + Duration::from_millis(ms));
            let heartbeat_at = now
                .checked_sub(Duration::from_millis(node.heartbeat_age_ms))
                .unwrap_or(now);
            registry.update_node(&registration.node, |slot| {
                slot.last_heartbeat = heartbeat_at;
                slot.maintenance = node.info.maintenance;
                slot.node.connections = node.connections;
                slot.node.last_failure_ms = node.last_failure_ms;
                slot.circuit = CircuitRecord {
                    state: node.circuit.state,
                    failure_count: node.circuit.failure_count,
                    last_failure: None,
                    next_retry: retry_at,
                    episode: node.circuit.episode,
                };
                slot.sync_circuit(None);
                slot.stats = Default::default();
                for ms in &node.response_samples {
                    slot.stats.record(*ms, response_window);
                }
            });

            if node.circuit.state == CircuitState::Open {
                report
                    .retry_timers
                    .push((registration.node.clone(), retry_at.unwrap_or(now)));
            }
            restored += 1;
        }
        if restored > 0 {
            report.services += 1;
            report.nodes += restored;
        }
    }

    for (alias, target) in snapshot.aliases {
        if let Err(e) = registry.set_alias(alias, target) {
            warn!("Skipping alias from snapshot: {}", e);
        }
    }
    for (service, policy) in snapshot.traffic {
        router.restore(service, policy);
    }
    for (service, client, node) in snapshot.sticky {
        strategies.restore_sticky(service, client, node);
    }
    for (state, node, value) in snapshot.q_values {
        strategies.learner().restore(state, node, value);
    }

    info!(
        "Restored {} nodes across {} services from snapshot ({} skipped)",
        report.nodes, report.services, report.skipped
    );
    Ok(report)
}

/// Frame a snapshot with the header
pub fn encode(snapshot: &RegistrySnapshot, format: SnapshotFormat) -> Result<Vec<u8>> {
    let payload = match format {
        SnapshotFormat::Json => serde_json::to_vec(snapshot)?,
        SnapshotFormat::Binary => bincode::serialize(snapshot)?,
    };
    let length = u32::try_from(payload.len())
        .map_err(|_| RegistryError::snapshot(format!("payload of {} bytes too large", payload.len())))?;

    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.write_all(&SNAPSHOT_MAGIC)?;
    out.write_u8(SNAPSHOT_VERSION)?;
    out.write_u8(format as u8)?;
    out.write_u16::<LittleEndian>(0)?;
    out.write_u32::<LittleEndian>(crc32fast::hash(&payload))?;
    out.write_u32::<LittleEndian>(length)?;
    out.write_u64::<LittleEndian>(snapshot.taken_at_ms)?;
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Verify the header and checksum, then decode the payload
pub fn decode(bytes: &[u8]) -> Result<RegistrySnapshot> {
    if bytes.len() < HEADER_LEN {
        return Err(RegistryError::snapshot(format!(
            "snapshot too small: {} bytes",
            bytes.len()
        )));
    }

    let mut header = Cursor::new(&bytes[..HEADER_LEN]);
    let mut magic = [0u8; 4];
    header.read_exact(&mut magic)?;
    if magic != SNAPSHOT_MAGIC {
        return Err(RegistryError::snapshot("not a registry snapshot"));
    }
    let version = header.read_u8()?;
    if version != SNAPSHOT_VERSION {
        return Err(RegistryError::snapshot(format!(
            "unsupported snapshot version {}",
            version
        )));
    }
    let format_byte = header.read_u8()?;
    let format = SnapshotFormat::from_u8(format_byte)
        .ok_or_else(|| RegistryError::snapshot(format!("unknown snapshot format {}", format_byte)))?;
    let _reserved = header.read_u16::<LittleEndian>()?;
    let checksum = header.read_u32::<LittleEndian>()?;
    let length = header.read_u32::<LittleEndian>()? as usize;
    let _taken_at_ms = header.read_u64::<LittleEndian>()?;

    let payload = &bytes[HEADER_LEN..];
    if payload.len() != length {
        return Err(RegistryError::snapshot(format!(
            "snapshot size mismatch: expected {}, got {}",
            length,
            payload.len()
        )));
    }
    let calculated = crc32fast::hash(payload);
    if calculated != checksum {
        return Err(RegistryError::snapshot(format!(
            "snapshot checksum mismatch: expected {:#x}, got {:#x}",
            checksum, calculated
        )));
    }

    let snapshot = match format {
        SnapshotFormat::Json => serde_json::from_slice(payload)?,
        SnapshotFormat::Binary => bincode::deserialize(payload)?,
    };
    debug!("Decoded {} snapshot of {} bytes", format, bytes.len());
    Ok(snapshot)
}

/// Write a snapshot file through a temporary sibling and rename
pub fn save(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    debug!("Saved snapshot to {}", path.display());
    Ok(())
}

/// Read a snapshot file; a missing file is not an error
pub fn load(path: &Path) -> Result<Option<Vec<u8>>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RegistrySnapshot {
        RegistrySnapshot {
            version: SNAPSHOT_VERSION,
            taken_at_ms: 1_700_000_000_000,
            services: vec![ServiceSnapshot {
                name: "prod:orders".into(),
                nodes: vec![NodeSnapshot {
                    info: NodeInfo::new("10.0.0.1", 8080).with_tag("primary"),
                    heartbeat_age_ms: 1_500,
                    connections: 2,
                    last_failure_ms: None,
                    circuit: CircuitSnapshot {
                        state: CircuitState::Open,
                        failure_count: 5,
                        episode: 1,
                        retry_in_ms: Some(30_000),
                    },
                    response_samples: vec![12.0, 18.5],
                }],
            }],
            aliases: vec![("orders".into(), "prod:orders".into())],
            traffic: Vec::new(),
            sticky: vec![("prod:orders".into(), "client-1".into(), "10.0.0.1:8080".into())],
            q_values: vec![("client-1".into(), "10.0.0.1:8080".into(), 42.0)],
        }
    }

    #[test]
    fn test_both_formats_decode_to_the_same_snapshot() {
        for format in [SnapshotFormat::Json, SnapshotFormat::Binary] {
            let bytes = encode(&sample(), format).unwrap();
            assert_eq!(&bytes[..4], b"DSNP");
            assert_eq!(bytes[5], format as u8);
            assert_eq!(decode(&bytes).unwrap(), sample());
        }
    }

    #[test]
    fn test_corruption_is_detected() {
        let mut bytes = encode(&sample(), SnapshotFormat::Json).unwrap();
        let last = bytes.len() - 2;
        bytes[last] ^= 0xff;
        let err = decode(&bytes).unwrap_err();
        assert!(err.to_string().contains("checksum"), "{}", err);
    }

    #[test]
    fn test_truncation_and_bad_magic() {
        let bytes = encode(&sample(), SnapshotFormat::Binary).unwrap();
        assert!(decode(&bytes[..10]).is_err());
        assert!(decode(&bytes[..bytes.len() - 1]).is_err());

        let mut wrong = bytes.clone();
        wrong[0] = b'X';
        assert!(decode(&wrong).is_err());
    }

    #[test]
    fn test_format_names() {
        assert_eq!("json".parse::<SnapshotFormat>().unwrap(), SnapshotFormat::Json);
        assert_eq!("BINCODE".parse::<SnapshotFormat>().unwrap(), SnapshotFormat::Binary);
        assert!("yaml".parse::<SnapshotFormat>().is_err());
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("registry.snap");
        assert!(load(&path).unwrap().is_none());

        let bytes = encode(&sample(), SnapshotFormat::Json).unwrap();
        save(&path, &bytes).unwrap();
        assert_eq!(load(&path).unwrap().unwrap(), bytes);
        assert!(!path.with_extension("tmp").exists());
    }
}
