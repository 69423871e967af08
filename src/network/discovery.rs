//! Peer discovery from bootstrap lists and pluggable resolvers.
//!
//! A pass seeds from the bootstrap list when the registry is empty (or from the
//! registered peers otherwise), asks every resolver about every seed, and
//! registers new candidates that pass the filter and abuse gate. Resolver
//! failures are recorded and skipped. Falling short of the quorum is a soft
//! failure that still hands back the usable peer list.

use crate::constants::discovery::DEFAULT_QUORUM;
use crate::network::ddos::DdosMitigator;
use crate::peer_manager::{Peer, PeerManager, PeerState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type ResolverError = Box<dyn std::error::Error + Send + Sync>;

/// Predicate applied to every resolver candidate
pub type PeerFilter = Arc<dyn Fn(&Peer) -> bool + Send + Sync>;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Quorum not satisfied: have {have} peers, want {want}")]
    QuorumNotSatisfied {
        have: usize,
        want: usize,
        /// Peers known when the pass ended; still usable
        peers: Vec<Peer>,
    },
    #[error("Discovery cancelled")]
    Cancelled,
}

impl DiscoveryError {
    /// Peer list carried by a soft quorum failure
    pub fn partial_peers(&self) -> Option<&[Peer]> {
        match self {
            DiscoveryError::QuorumNotSatisfied { peers, .. } => Some(peers),
            DiscoveryError::Cancelled => None,
        }
    }
}

/// Source of candidate peers (DNS, REST, gossip)
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn discover(
        &self,
        seed: &Peer,
        cancel: &CancellationToken,
    ) -> Result<Vec<Peer>, ResolverError>;

    fn name(&self) -> &str {
        "resolver"
    }
}

/// Outcome of the last completed pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscoveryMetrics {
    pub discovered: usize,
    pub last_run: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub bootstrap_used: bool,
}

pub struct DiscoveryService {
    peers: Arc<PeerManager>,
    bootstrap: Vec<Peer>,
    resolvers: Vec<Arc<dyn Resolver>>,
    filter: Option<PeerFilter>,
    mitigator: Option<Arc<DdosMitigator>>,
    quorum: usize,
    metrics: RwLock<DiscoveryMetrics>,
}

impl DiscoveryService {
    pub fn new(peers: Arc<PeerManager>, bootstrap: Vec<Peer>) -> Self {
        Self {
            peers,
            bootstrap,
            resolvers: Vec::new(),
            filter: None,
            mitigator: None,
            quorum: DEFAULT_QUORUM,
            metrics: RwLock::new(DiscoveryMetrics::default()),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolvers.push(resolver);
        self
    }

    /// Candidates rejected by `filter` are never registered.
    pub fn with_filter(mut self, filter: PeerFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Candidates whose address is currently blocked are skipped.
    pub fn with_mitigator(mut self, mitigator: Arc<DdosMitigator>) -> Self {
        self.mitigator = Some(mitigator);
        self
    }

    /// Minimum registered peers for a pass to succeed; values below 1 become 1.
    pub fn configure_quorum(&mut self, quorum: usize) {
        self.quorum = quorum.max(1);
    }

    pub fn with_quorum(mut self, quorum: usize) -> Self {
        self.configure_quorum(quorum);
        self
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }

    pub fn metrics(&self) -> DiscoveryMetrics {
        self.metrics.read().clone()
    }

    /// Runs one discovery pass and returns every registered peer.
    pub async fn discover(&self, cancel: &CancellationToken) -> Result<Vec<Peer>, DiscoveryError> {
        if cancel.is_cancelled() {
            return Err(DiscoveryError::Cancelled);
        }

        let mut bootstrap_used = false;
        let seeds = if self.peers.peer_count() == 0 {
            bootstrap_used = true;
            debug!("Registry empty, seeding from {} bootstrap peers", self.bootstrap.len());
            self.bootstrap
                .iter()
                .cloned()
                .map(|peer| self.peers.add_peer(peer))
                .collect::<Vec<_>>()
        } else {
            self.peers.list_peers()
        };

        let mut seen: HashSet<String> = HashSet::new();
        let mut discovered = 0usize;
        let mut last_error: Option<String> = None;

        for resolver in &self.resolvers {
            for seed in &seeds {
                if cancel.is_cancelled() {
                    debug!("Discovery pass cancelled");
                    return Err(DiscoveryError::Cancelled);
                }

                let candidates = match resolver.discover(seed, cancel).await {
                    Ok(candidates) => candidates,
                    Err(e) => {
                        warn!(
                            "⚠️  Resolver {} failed for seed {}: {}",
                            resolver.name(),
                            seed.id,
                            e
                        );
                        last_error = Some(e.to_string());
                        continue;
                    }
                };

                for candidate in candidates {
                    if self.admit(&candidate, &mut seen) {
                        self.peers.add_peer(candidate);
                        discovered += 1;
                    }
                }
            }
        }

        *self.metrics.write() = DiscoveryMetrics {
            discovered,
            last_run: Some(Utc::now()),
            last_error,
            bootstrap_used,
        };

        let peers = self.peers.list_peers();
        info!(
            "🔍 Discovery pass: {} new, {} known (quorum {})",
            discovered,
            peers.len(),
            self.quorum
        );

        if peers.len() < self.quorum {
            warn!("⚠️  Discovery quorum not met: {}/{}", peers.len(), self.quorum);
            return Err(DiscoveryError::QuorumNotSatisfied {
                have: peers.len(),
                want: self.quorum,
                peers,
            });
        }
        Ok(peers)
    }

    /// Peers worth an outbound dial: known address, no session key yet, and
    /// not held back by quarantine. With a mitigator attached a quarantined
    /// peer becomes dialable again once its address block expires; without
    /// one it stays excluded.
    pub fn dial_targets(&self, peers: Vec<Peer>, now: Instant) -> Vec<Peer> {
        peers
            .into_iter()
            .filter(|peer| {
                // A session key means the peer reached us inbound
                let inbound = !peer.noise_key.is_empty() || !peer.tls_fingerprint.is_empty();
                if inbound || peer.address.is_empty() {
                    return false;
                }
                let blocked = match &self.mitigator {
                    Some(mitigator) => mitigator.is_blocked(&peer.address, now),
                    None => peer.state == PeerState::Quarantined,
                };
                if blocked {
                    debug!("Not dialing quarantined peer {} ({})", peer.id, peer.address);
                }
                !blocked
            })
            .collect()
    }

    fn admit(&self, candidate: &Peer, seen: &mut HashSet<String>) -> bool {
        if let Some(filter) = &self.filter {
            if !filter(candidate) {
                return false;
            }
        }

        // Id-less candidates get a fresh id on insert, so match them by address
        let (key, known) = if candidate.id.is_empty() {
            (&candidate.address, self.peers.contains_address(&candidate.address))
        } else {
            (&candidate.id, self.peers.contains(&candidate.id))
        };
        if known || seen.contains(key) {
            return false;
        }

        if let Some(mitigator) = &self.mitigator {
            if mitigator.is_blocked(&candidate.address, Instant::now()) {
                debug!("Skipping blocked candidate {}", candidate.address);
                return false;
            }
        }

        seen.insert(key.clone());
        true
    }
}
