//! Active health probes
//!
//! A [`HealthProbeRunner`] takes a snapshot of the registered nodes,
//! probes them with bounded concurrency and a per-probe timeout, and
//! feeds each outcome back through `record_success` / `record_failure`.
//! No registry lock is held while a probe is in flight.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::config::HealthConfig;
use crate::engine::DiscoveryEngine;
use crate::model::Node;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProbeOutcome {
    Healthy { latency: Duration },
    Unhealthy,
}

impl ProbeOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeOutcome::Healthy { .. })
    }
}

#[async_trait]
pub trait HealthProbe: Send + Sync + fmt::Debug {
    async fn probe(&self, node: &Node) -> ProbeOutcome;
}

/// Healthy when a TCP connection to `address:port` can be opened
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnectProbe;

#[async_trait]
impl HealthProbe for TcpConnectProbe {
    async fn probe(&self, node: &Node) -> ProbeOutcome {
        let start = Instant::now();
        match TcpStream::connect((node.address.as_str(), node.port)).await {
            Ok(_) => ProbeOutcome::Healthy {
                latency: start.elapsed(),
            },
            Err(e) => {
                trace!("TCP probe of {} failed: {}", node.name, e);
                ProbeOutcome::Unhealthy
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeReport {
    pub probed: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub timed_out: usize,
}

#[derive(Debug, Clone)]
pub struct HealthProbeRunner {
    probe: Arc<dyn HealthProbe>,
    timeout: Duration,
    concurrency: usize,
}

impl HealthProbeRunner {
    pub fn new(probe: Arc<dyn HealthProbe>, config: &HealthConfig) -> Self {
        Self {
            probe,
            timeout: config.probe_timeout,
            concurrency: config.probe_concurrency.max(1),
        }
    }

    /// Probe every node outside maintenance once
    pub async fn run_once(&self, engine: &DiscoveryEngine) -> ProbeReport {
        let targets = engine.probe_targets();
        let timeout = self.timeout;

        let results: Vec<(String, Option<ProbeOutcome>)> = stream::iter(targets)
            .map(|node| {
                let probe = Arc::clone(&self.probe);
                async move {
                    let outcome = tokio::time::timeout(timeout, probe.probe(&node)).await.ok();
                    (node.name, outcome)
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut report = ProbeReport {
            probed: results.len(),
            ..Default::default()
        };
        for (name, outcome) in results {
            match outcome {
                Some(ProbeOutcome::Healthy { .. }) => {
                    report.healthy += 1;
                    engine.record_success(&name);
                }
                Some(ProbeOutcome::Unhealthy) => {
                    report.unhealthy += 1;
                    engine.record_failure(&name);
                }
                None => {
                    report.timed_out += 1;
                    engine.record_failure(&name);
                }
            }
        }
        debug!(
            "Probed {} nodes: {} healthy, {} unhealthy, {} timed out",
            report.probed, report.healthy, report.unhealthy, report.timed_out
        );
        report
    }
}
