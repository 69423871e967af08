//! Discovery, peer registry and abuse mitigation working together.

use async_trait::async_trait;
use peerlink::network::ddos::DdosMitigator;
use peerlink::network::discovery::{DiscoveryError, DiscoveryService, Resolver, ResolverError};
use peerlink::peer_manager::{Peer, PeerEventKind, PeerManager, PeerState};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Returns the same candidates for every seed
struct FixedResolver {
    candidates: Vec<Peer>,
    calls: AtomicUsize,
}

impl FixedResolver {
    fn new(candidates: Vec<Peer>) -> Arc<Self> {
        Arc::new(Self {
            candidates,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Resolver for FixedResolver {
    async fn discover(
        &self,
        _seed: &Peer,
        _cancel: &CancellationToken,
    ) -> Result<Vec<Peer>, ResolverError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.candidates.clone())
    }
}

/// Cancels the pass from inside the first resolver call
struct CancellingResolver {
    token: CancellationToken,
}

#[async_trait]
impl Resolver for CancellingResolver {
    async fn discover(
        &self,
        _seed: &Peer,
        _cancel: &CancellationToken,
    ) -> Result<Vec<Peer>, ResolverError> {
        self.token.cancel();
        Ok(vec![Peer::new("late", "10.9.9.9:7600")])
    }
}

#[tokio::test]
async fn test_two_bootstrap_peers_without_resolvers() {
    let pm = Arc::new(PeerManager::new());
    let svc = DiscoveryService::new(
        pm.clone(),
        vec![Peer::new("boot-1", "10.0.0.1:7600"), Peer::new("boot-2", "10.0.0.2:7600")],
    );

    let peers = svc.discover(&CancellationToken::new()).await.unwrap();
    let ids: Vec<&str> = peers.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(ids, vec!["boot-1", "boot-2"]);
    assert!(svc.metrics().bootstrap_used);
    assert!(peers.iter().all(|p| p.state == PeerState::Connected));
}

#[tokio::test]
async fn test_validator_filter_meets_quorum_of_two() {
    let pm = Arc::new(PeerManager::new());
    let resolver = FixedResolver::new(vec![
        Peer::new("p2", "10.0.0.2:7600").with_capability("validator", true),
        Peer::new("p3", "10.0.0.3:7600"),
    ]);
    let svc = DiscoveryService::new(pm.clone(), vec![Peer::new("p1", "10.0.0.1:7600")])
        .with_resolver(resolver.clone())
        .with_filter(Arc::new(|peer: &Peer| peer.has_capability("validator")))
        .with_quorum(2);

    let peers = svc.discover(&CancellationToken::new()).await.unwrap();
    let ids: Vec<&str> = peers.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(ids, vec!["p1", "p2"]);
    assert_eq!(svc.metrics().discovered, 1);
    assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_quorum_error_still_registers_peers() {
    let pm = Arc::new(PeerManager::new());
    let svc = DiscoveryService::new(pm.clone(), vec![Peer::new("p1", "10.0.0.1:7600")])
        .with_resolver(FixedResolver::new(vec![Peer::new("p2", "10.0.0.2:7600")]))
        .with_quorum(5);

    match svc.discover(&CancellationToken::new()).await {
        Err(DiscoveryError::QuorumNotSatisfied { have, want, peers }) => {
            assert_eq!(have, 2);
            assert_eq!(want, 5);
            assert_eq!(peers.len(), 2);
        }
        other => panic!("expected quorum error, got {:?}", other),
    }
    assert_eq!(pm.peer_count(), 2);
}

#[tokio::test]
async fn test_quarantined_peer_address_skipped_by_discovery() {
    let mitigator = Arc::new(DdosMitigator::default());
    let pm = Arc::new(PeerManager::new().with_quarantine(mitigator.clone()));

    // Five dial failures: faulted after the fourth, quarantined with a mitigator
    pm.add_peer(Peer::new("flaky", "10.0.0.66:7600"));
    let mut last = None;
    for _ in 0..5 {
        last = pm.mark_failure("flaky", "dial refused");
    }
    assert_eq!(last.unwrap().state, PeerState::Quarantined);
    assert!(mitigator.is_blocked("10.0.0.66:7600", Instant::now()));

    // Forgotten, then offered again by a resolver under a new id
    pm.remove_peer("flaky", "evicted");
    pm.add_peer(Peer::new("seed", "10.0.0.1:7600"));
    let svc = DiscoveryService::new(pm.clone(), vec![])
        .with_resolver(FixedResolver::new(vec![Peer::new("flaky-2", "10.0.0.66:7600")]))
        .with_mitigator(mitigator);

    svc.discover(&CancellationToken::new()).await.unwrap();
    assert!(!pm.contains("flaky-2"));
    assert_eq!(svc.metrics().discovered, 0);
}

#[tokio::test]
async fn test_discovery_events_reach_subscribers() {
    let pm = Arc::new(PeerManager::new());
    let (mut events, _sub) = pm.subscribe(16);
    let svc = DiscoveryService::new(pm.clone(), vec![Peer::new("p1", "10.0.0.1:7600")])
        .with_resolver(FixedResolver::new(vec![Peer::new("p2", "10.0.0.2:7600")]));

    svc.discover(&CancellationToken::new()).await.unwrap();

    let first = events.recv().await.unwrap();
    let second = events.recv().await.unwrap();
    assert_eq!((first.kind, first.peer.id.as_str()), (PeerEventKind::Added, "p1"));
    assert_eq!((second.kind, second.peer.id.as_str()), (PeerEventKind::Added, "p2"));
}

#[tokio::test]
async fn test_cancel_mid_pass_aborts_before_next_seed() {
    let pm = Arc::new(PeerManager::new());
    let token = CancellationToken::new();
    let svc = DiscoveryService::new(
        pm.clone(),
        vec![Peer::new("p1", "10.0.0.1:7600"), Peer::new("p2", "10.0.0.2:7600")],
    )
    .with_resolver(Arc::new(CancellingResolver { token: token.clone() }));

    assert!(matches!(svc.discover(&token).await, Err(DiscoveryError::Cancelled)));
    assert!(svc.metrics().last_run.is_none());
}
