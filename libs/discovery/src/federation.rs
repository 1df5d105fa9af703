//! Federated Discovery
//!
//! When the local registry has no eligible node for a request, peers
//! (other datacenters or regions) are asked in registration order. Each
//! query is bounded by the federation timeout; a slow or failing peer is
//! logged and skipped.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::engine::{DiscoveryEngine, DiscoveryRequest};
use crate::model::Node;
use crate::{RegistryError, Result};

/// A remote registry that can answer discovery requests
#[async_trait]
pub trait PeerRegistry: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// `Ok(None)` when the peer has no eligible node either
    async fn discover(&self, request: &DiscoveryRequest) -> Result<Option<Node>>;
}

/// Peer backed by another engine in the same process
#[derive(Debug, Clone)]
pub struct EnginePeer {
    name: String,
    engine: Arc<DiscoveryEngine>,
}

impl EnginePeer {
    pub fn new(name: impl Into<String>, engine: Arc<DiscoveryEngine>) -> Self {
        Self {
            name: name.into(),
            engine,
        }
    }
}

#[async_trait]
impl PeerRegistry for EnginePeer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn discover(&self, request: &DiscoveryRequest) -> Result<Option<Node>> {
        // Local lookup only, so peers that list each other never recurse
        match self.engine.discover(request) {
            Ok(node) => Ok(Some(node)),
            Err(RegistryError::NotFound { .. }) | Err(RegistryError::CircuitOpen { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[derive(Debug)]
pub struct Federation {
    peers: RwLock<Vec<Arc<dyn PeerRegistry>>>,
    timeout: RwLock<Duration>,
}

impl Federation {
    pub fn new(timeout: Duration) -> Self {
        Self {
            peers: RwLock::new(Vec::new()),
            timeout: RwLock::new(timeout),
        }
    }

    /// Add a peer, replacing any peer with the same name
    pub fn add_peer(&self, peer: Arc<dyn PeerRegistry>) {
        let mut peers = self.peers.write();
        peers.retain(|p| p.name() != peer.name());
        peers.push(peer);
    }

    pub fn remove_peer(&self, name: &str) -> bool {
        let mut peers = self.peers.write();
        let before = peers.len();
        peers.retain(|p| p.name() != name);
        peers.len() != before
    }

    pub fn peer_names(&self) -> Vec<String> {
        self.peers.read().iter().map(|p| p.name().to_string()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    pub fn set_timeout(&self, timeout: Duration) {
        *self.timeout.write() = timeout;
    }

    /// Ask peers in order; returns the first answer and the peer that gave it
    pub async fn discover(&self, request: &DiscoveryRequest) -> Option<(String, Node)> {
        let peers: Vec<Arc<dyn PeerRegistry>> = self.peers.read().clone();
        let timeout = *self.timeout.read();

        for peer in peers {
            match tokio::time::timeout(timeout, peer.discover(request)).await {
                Ok(Ok(Some(node))) => {
                    debug!("Peer {} answered for {} with {}", peer.name(), request.service, node.name);
                    return Some((peer.name().to_string(), node));
                }
                Ok(Ok(None)) => {
                    debug!("Peer {} has no eligible node for {}", peer.name(), request.service);
                }
                Ok(Err(e)) => {
                    let error = RegistryError::federation(peer.name(), e.to_string());
                    warn!("{}", error);
                }
                Err(_) => {
                    let error = RegistryError::timeout(
                        format!("federated discovery via {}", peer.name()),
                        timeout.as_millis() as u64,
                    );
                    warn!("{}", error);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NodeInfo;

    #[derive(Debug)]
    struct FixedPeer {
        name: String,
        answer: Option<Node>,
        delay: Duration,
        fail: bool,
    }

    #[async_trait]
    impl PeerRegistry for FixedPeer {
        fn name(&self) -> &str {
            &self.name
        }

        async fn discover(&self, _request: &DiscoveryRequest) -> Result<Option<Node>> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(RegistryError::not_found("remote", "peer failure"));
            }
            Ok(self.answer.clone())
        }
    }

    fn remote_node(port: u16) -> Node {
        Node::from_info("orders", &NodeInfo::new("192.168.1.1", port), 1)
    }

    fn peer(name: &str, answer: Option<Node>, delay_ms: u64, fail: bool) -> Arc<dyn PeerRegistry> {
        Arc::new(FixedPeer {
            name: name.into(),
            answer,
            delay: Duration::from_millis(delay_ms),
            fail,
        })
    }

    #[tokio::test]
    async fn test_first_answering_peer_wins() {
        let federation = Federation::new(Duration::from_millis(200));
        federation.add_peer(peer("broken", None, 0, true));
        federation.add_peer(peer("empty", None, 0, false));
        federation.add_peer(peer("us-west", Some(remote_node(1)), 0, false));
        federation.add_peer(peer("eu-west", Some(remote_node(2)), 0, false));

        let (from, node) = federation.discover(&DiscoveryRequest::new("orders")).await.unwrap();
        assert_eq!(from, "us-west");
        assert_eq!(node.name, "192.168.1.1:1");
    }

    #[tokio::test]
    async fn test_slow_peer_is_skipped() {
        let federation = Federation::new(Duration::from_millis(20));
        federation.add_peer(peer("slow", Some(remote_node(1)), 500, false));
        federation.add_peer(peer("fast", Some(remote_node(2)), 0, false));

        let (from, _) = federation.discover(&DiscoveryRequest::new("orders")).await.unwrap();
        assert_eq!(from, "fast");
    }

    #[tokio::test]
    async fn test_peer_replacement_and_removal() {
        let federation = Federation::new(Duration::from_millis(50));
        assert!(federation.discover(&DiscoveryRequest::new("orders")).await.is_none());

        federation.add_peer(peer("dc2", None, 0, false));
        federation.add_peer(peer("dc2", Some(remote_node(3)), 0, false));
        assert_eq!(federation.peer_names(), vec!["dc2"]);
        assert!(federation.discover(&DiscoveryRequest::new("orders")).await.is_some());

        assert!(federation.remove_peer("dc2"));
        assert!(!federation.remove_peer("dc2"));
        assert!(federation.is_empty());
    }
}
