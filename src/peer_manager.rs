//! Peer registry with lifecycle tracking and a push-based event stream.
//!
//! The registry is the authoritative directory of known peers. Mutations emit
//! [`PeerEvent`]s to every subscriber through a bounded queue; a full queue
//! drops the event for that subscriber instead of stalling the caller, and the
//! drop is counted in [`PeerManager::dropped_events`].

use crate::constants::peers::{FAULT_THRESHOLD, GENERATED_ID_BYTES, QUARANTINE_COOLDOWN};
use crate::network::ddos::DdosMitigator;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PeerState {
    #[default]
    Unknown,
    Connected,
    Faulted,
    Quarantined,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    pub id: String,
    pub address: String,
    #[serde(default, with = "hex_bytes")]
    pub pub_key: Vec<u8>,
    #[serde(default, with = "hex_bytes")]
    pub noise_key: Vec<u8>,
    #[serde(default)]
    pub tls_fingerprint: String,
    #[serde(default)]
    pub capabilities: BTreeMap<String, bool>,
    #[serde(default)]
    pub latency: Duration,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub state: PeerState,
    #[serde(default)]
    pub failure_count: u32,
}

impl Peer {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            ..Default::default()
        }
    }

    pub fn with_capability(mut self, name: impl Into<String>, enabled: bool) -> Self {
        self.capabilities.insert(name.into(), enabled);
        self
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.get(name).copied().unwrap_or(false)
    }

    /// Carries transient fields over from `existing` where this record leaves them empty.
    fn merge_transient(&mut self, existing: &Peer) {
        if self.failure_count == 0 {
            self.failure_count = existing.failure_count;
        }
        if self.latency.is_zero() {
            self.latency = existing.latency;
        }
        if self.capabilities.is_empty() {
            self.capabilities = existing.capabilities.clone();
        }
        if self.metadata.is_empty() {
            self.metadata = existing.metadata.clone();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerEventKind {
    Added,
    Updated,
    Removed,
    Quarantined,
}

/// Registry mutation notice; immutable once emitted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerEvent {
    pub kind: PeerEventKind,
    pub peer: Peer,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Full copy of the registry for dashboards
#[derive(Debug, Clone, Serialize)]
pub struct PeerTableSnapshot {
    pub taken_at: DateTime<Utc>,
    pub peers: Vec<Peer>,
    pub dropped_events: u64,
}

type SubscriberMap = HashMap<u64, mpsc::Sender<PeerEvent>>;

/// Handle returned by [`PeerManager::subscribe`]; cancelling closes the stream.
pub struct Subscription {
    id: u64,
    subscribers: Weak<RwLock<SubscriberMap>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel(self) {
        // Dropping the sender closes the receiver once queued events drain
        if let Some(subscribers) = self.subscribers.upgrade() {
            subscribers.write().remove(&self.id);
        }
    }
}

pub struct PeerManager {
    peers: RwLock<HashMap<String, Peer>>,
    subscribers: Arc<RwLock<SubscriberMap>>,
    next_subscriber: AtomicU64,
    dropped_events: AtomicU64,
    quarantine: RwLock<Option<Arc<DdosMitigator>>>,
    quarantine_cooldown: Duration,
}

impl PeerManager {
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            next_subscriber: AtomicU64::new(1),
            dropped_events: AtomicU64::new(0),
            quarantine: RwLock::new(None),
            quarantine_cooldown: QUARANTINE_COOLDOWN,
        }
    }

    /// Attaches the mitigator consulted when a faulted peer must be quarantined.
    pub fn set_quarantine_policy(&self, mitigator: Arc<DdosMitigator>) {
        *self.quarantine.write() = Some(mitigator);
    }

    pub fn with_quarantine(self, mitigator: Arc<DdosMitigator>) -> Self {
        self.set_quarantine_policy(mitigator);
        self
    }

    /// Registers `peer` as connected, keeping transient fields from an earlier record.
    pub fn add_peer(&self, mut peer: Peer) -> Peer {
        if peer.id.is_empty() {
            peer.id = generate_peer_id();
        }
        peer.state = PeerState::Connected;
        peer.last_seen = Some(Utc::now());

        let stored = {
            let mut peers = self.peers.write();
            if let Some(existing) = peers.get(&peer.id) {
                peer.merge_transient(existing);
            }
            peers.insert(peer.id.clone(), peer.clone());
            peer
        };

        info!("✓ Peer {} added ({})", stored.id, stored.address);
        self.emit(PeerEventKind::Added, &stored, None);
        stored
    }

    /// Overwrites a known peer. Failure count is preserved and an unset state
    /// keeps the previous one. Unknown ids are ignored.
    pub fn update_peer(&self, mut peer: Peer, reason: &str) -> Option<Peer> {
        let stored = {
            let mut peers = self.peers.write();
            let existing = peers.get(&peer.id)?;
            peer.failure_count = existing.failure_count;
            if peer.state == PeerState::Unknown {
                peer.state = existing.state;
            }
            peers.insert(peer.id.clone(), peer.clone());
            peer
        };

        debug!("Peer {} updated: {}", stored.id, reason);
        self.emit(PeerEventKind::Updated, &stored, non_empty(reason));
        Some(stored)
    }

    pub fn remove_peer(&self, id: &str, reason: &str) -> Option<Peer> {
        let removed = self.peers.write().remove(id)?;
        info!("Peer {} removed: {}", id, reason);
        self.emit(PeerEventKind::Removed, &removed, non_empty(reason));
        Some(removed)
    }

    /// Counts a failure against `id`. Past the fault threshold the peer is
    /// Faulted, and with a quarantine policy attached its address is blocked
    /// and the peer Quarantined. A Quarantined event is emitted for every call
    /// on a known peer.
    pub fn mark_failure(&self, id: &str, reason: &str) -> Option<Peer> {
        let quarantine = self.quarantine.read().clone();

        let stored = {
            let mut peers = self.peers.write();
            let peer = peers.get_mut(id)?;
            peer.failure_count += 1;
            if peer.failure_count > FAULT_THRESHOLD {
                peer.state = PeerState::Faulted;
                if let Some(mitigator) = &quarantine {
                    mitigator.block(&peer.address, self.quarantine_cooldown, Instant::now());
                    peer.state = PeerState::Quarantined;
                }
            }
            peer.clone()
        };

        warn!(
            "⚠️  Peer {} failure #{} ({:?}): {}",
            stored.id, stored.failure_count, stored.state, reason
        );
        self.emit(PeerEventKind::Quarantined, &stored, non_empty(reason));
        Some(stored)
    }

    pub fn get_peer(&self, id: &str) -> Option<Peer> {
        self.peers.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.peers.read().contains_key(id)
    }

    /// Whether any registered peer listens on `address`.
    pub fn contains_address(&self, address: &str) -> bool {
        self.peers.read().values().any(|p| p.address == address)
    }

    /// All peers sorted by id.
    pub fn list_peers(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.peers.read().values().cloned().collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    pub fn snapshot(&self) -> PeerTableSnapshot {
        PeerTableSnapshot {
            taken_at: Utc::now(),
            peers: self.list_peers(),
            dropped_events: self.dropped_events(),
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    /// Opens an event stream holding at most `buffer_size` undelivered events.
    pub fn subscribe(&self, buffer_size: usize) -> (mpsc::Receiver<PeerEvent>, Subscription) {
        let (tx, rx) = mpsc::channel(buffer_size.max(1));
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().insert(id, tx);
        (
            rx,
            Subscription {
                id,
                subscribers: Arc::downgrade(&self.subscribers),
            },
        )
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    fn emit(&self, kind: PeerEventKind, peer: &Peer, reason: Option<String>) {
        let event = PeerEvent {
            kind,
            peer: peer.clone(),
            timestamp: Utc::now(),
            reason,
        };

        let mut closed = Vec::new();
        {
            let subscribers = self.subscribers.read();
            for (id, tx) in subscribers.iter() {
                match tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        self.dropped_events.fetch_add(1, Ordering::Relaxed);
                        debug!("Subscriber {} queue full, dropped {:?} event", id, kind);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
                }
            }
        }

        if !closed.is_empty() {
            let mut subscribers = self.subscribers.write();
            for id in closed {
                subscribers.remove(&id);
            }
        }
    }
}

impl Default for PeerManager {
    fn default() -> Self {
        Self::new()
    }
}

fn non_empty(reason: &str) -> Option<String> {
    (!reason.is_empty()).then(|| reason.to_string())
}

fn generate_peer_id() -> String {
    let mut bytes = [0u8; GENERATED_ID_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::ddos::DdosConfig;

    fn peer(id: &str) -> Peer {
        Peer::new(id, format!("10.0.0.{}:9000", id.len()))
    }

    #[test]
    fn test_add_generates_id_and_connects() {
        let pm = PeerManager::new();
        let stored = pm.add_peer(Peer::new("", "10.1.1.1:9000"));
        assert_eq!(stored.id.len(), GENERATED_ID_BYTES * 2);
        assert_eq!(stored.state, PeerState::Connected);
        assert!(stored.last_seen.is_some());
        assert!(pm.contains(&stored.id));
    }

    #[test]
    fn test_readd_preserves_transient_fields() {
        let pm = PeerManager::new();
        let mut first = peer("p1").with_capability("validator", true);
        first.latency = Duration::from_millis(40);
        first.metadata.insert("version".into(), "1.2".into());
        pm.add_peer(first);
        pm.mark_failure("p1", "timeout");

        let merged = pm.add_peer(peer("p1"));
        assert_eq!(merged.failure_count, 1);
        assert_eq!(merged.latency, Duration::from_millis(40));
        assert!(merged.has_capability("validator"));
        assert_eq!(merged.metadata.get("version").map(String::as_str), Some("1.2"));

        // Explicit values on the new record win
        let replaced = pm.add_peer(peer("p1").with_capability("archive", true));
        assert!(!replaced.has_capability("validator"));
        assert!(replaced.has_capability("archive"));
    }

    #[test]
    fn test_update_preserves_failures_and_state() {
        let pm = PeerManager::new();
        pm.add_peer(peer("p1"));
        pm.mark_failure("p1", "");

        let mut changed = peer("p1");
        changed.region = "eu-west".into();
        changed.failure_count = 42;
        let updated = pm.update_peer(changed, "region moved").unwrap();
        assert_eq!(updated.failure_count, 1);
        assert_eq!(updated.state, PeerState::Connected);
        assert_eq!(updated.region, "eu-west");

        assert!(pm.update_peer(peer("ghost"), "").is_none());
    }

    #[test]
    fn test_mark_failure_faults_then_quarantines() {
        let pm = PeerManager::new();
        let stored = pm.add_peer(peer("p1"));

        for _ in 0..3 {
            assert_eq!(pm.mark_failure("p1", "dial").unwrap().state, PeerState::Connected);
        }
        assert_eq!(pm.mark_failure("p1", "dial").unwrap().state, PeerState::Faulted);

        let mitigator = Arc::new(DdosMitigator::new(DdosConfig::default()));
        pm.set_quarantine_policy(mitigator.clone());
        let quarantined = pm.mark_failure("p1", "dial").unwrap();
        assert_eq!(quarantined.state, PeerState::Quarantined);
        assert_eq!(quarantined.failure_count, 5);
        assert!(mitigator.is_blocked(&stored.address, Instant::now()));

        assert!(pm.mark_failure("unknown", "dial").is_none());
    }

    #[test]
    fn test_contains_address() {
        let pm = PeerManager::new();
        let stored = pm.add_peer(Peer::new("", "10.0.0.9:7600"));
        assert!(pm.contains_address("10.0.0.9:7600"));
        assert!(!pm.contains_address("10.0.0.9:7601"));

        pm.remove_peer(&stored.id, "gone");
        assert!(!pm.contains_address("10.0.0.9:7600"));
    }

    #[test]
    fn test_list_sorted_and_independent() {
        let pm = PeerManager::new();
        pm.add_peer(peer("c"));
        pm.add_peer(peer("a"));
        pm.add_peer(peer("b"));

        let mut listed = pm.list_peers();
        let ids: Vec<&str> = listed.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        listed[0].metadata.insert("tampered".into(), "yes".into());
        assert!(pm.get_peer("a").unwrap().metadata.is_empty());

        let snap = pm.snapshot();
        assert_eq!(snap.peers.len(), 3);
    }

    #[test]
    fn test_peer_json_uses_hex_keys() {
        let mut p = peer("p1");
        p.pub_key = vec![0xde, 0xad];
        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(json["pub_key"], "dead");
        assert_eq!(json["state"], serde_json::to_value(PeerState::default()).unwrap());

        let back: Peer = serde_json::from_value(json).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn test_remove_absent_emits_nothing() {
        let pm = PeerManager::new();
        let (mut rx, _sub) = pm.subscribe(4);
        assert!(pm.remove_peer("nope", "gone").is_none());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_events_reach_every_subscriber() {
        let pm = PeerManager::new();
        let (mut rx1, _s1) = pm.subscribe(8);
        let (mut rx2, _s2) = pm.subscribe(8);

        pm.add_peer(peer("p1"));
        pm.remove_peer("p1", "shutdown");

        for rx in [&mut rx1, &mut rx2] {
            let added = rx.recv().await.unwrap();
            assert_eq!(added.kind, PeerEventKind::Added);
            assert_eq!(added.peer.id, "p1");
            let removed = rx.recv().await.unwrap();
            assert_eq!(removed.kind, PeerEventKind::Removed);
            assert_eq!(removed.reason.as_deref(), Some("shutdown"));
        }
    }

    #[test]
    fn test_full_queue_drops_instead_of_blocking() {
        let pm = PeerManager::new();
        let (mut rx, _sub) = pm.subscribe(1);

        pm.add_peer(peer("p1"));
        pm.add_peer(peer("p2"));
        pm.add_peer(peer("p3"));

        assert_eq!(pm.dropped_events(), 2);
        assert_eq!(rx.try_recv().unwrap().peer.id, "p1");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_cancel_closes_stream() {
        let pm = PeerManager::new();
        let (mut rx, sub) = pm.subscribe(4);
        assert_eq!(pm.subscriber_count(), 1);
        sub.cancel();
        assert_eq!(pm.subscriber_count(), 0);

        pm.add_peer(peer("p1"));
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_dropped_receiver_is_pruned() {
        let pm = PeerManager::new();
        let (rx, _sub) = pm.subscribe(4);
        drop(rx);
        pm.add_peer(peer("p1"));
        assert_eq!(pm.subscriber_count(), 0);
    }
}
