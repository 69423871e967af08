//! Adaptive per-identity abuse mitigation.
//!
//! Every identity (usually a peer address) keeps a trimmed list of recent
//! request times and an exponentially smoothed overflow score. An identity
//! is blocked when its windowed request count exceeds
//! `max_requests + burst_allowance`, or when the smoothed score exceeds
//! `burst_allowance`. Blocks can also be applied manually for abuse detected
//! elsewhere (cascading dial failures, bad handshakes).
//!
//! There is no background sweeper: expired blocks and stale timestamps are
//! dropped the next time the identity is touched.

use crate::constants::ddos::{
    DEFAULT_BLOCK_DURATION, DEFAULT_BURST_ALLOWANCE, DEFAULT_MAX_REQUESTS, DEFAULT_SCORE_WEIGHT,
    DEFAULT_WINDOW,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Tunables for [`DdosMitigator`]
#[derive(Debug, Clone)]
pub struct DdosConfig {
    pub window: Duration,
    pub max_requests: usize,
    pub burst_allowance: usize,
    pub block_duration: Duration,
    /// Weight of the previous score, in `[0, 1)`
    pub score_weight: f64,
}

impl Default for DdosConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            max_requests: DEFAULT_MAX_REQUESTS,
            burst_allowance: DEFAULT_BURST_ALLOWANCE,
            block_duration: DEFAULT_BLOCK_DURATION,
            score_weight: DEFAULT_SCORE_WEIGHT,
        }
    }
}

#[derive(Debug, Default)]
struct ClientState {
    requests: VecDeque<Instant>,
    score: f64,
    blocked_until: Option<Instant>,
    last_seen: Option<Instant>,
}

impl ClientState {
    fn trim(&mut self, now: Instant, window: Duration) {
        while let Some(front) = self.requests.front() {
            if now.saturating_duration_since(*front) > window {
                self.requests.pop_front();
            } else {
                break;
            }
        }
    }

    /// Clears an expired block; returns whether the identity is still blocked.
    fn refresh_block(&mut self, now: Instant) -> bool {
        match self.blocked_until {
            Some(until) if now < until => true,
            Some(_) => {
                self.blocked_until = None;
                false
            }
            None => false,
        }
    }
}

/// Point-in-time view of one identity, as rendered by dashboards
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSnapshot {
    pub identity: String,
    pub score: f64,
    pub recent_requests: usize,
    pub blocked: bool,
    pub blocked_until: Option<Instant>,
    pub last_seen: Option<Instant>,
}

/// Per-identity request scoring and quarantine
pub struct DdosMitigator {
    config: DdosConfig,
    clients: Mutex<HashMap<String, ClientState>>,
}

impl DdosMitigator {
    pub fn new(mut config: DdosConfig) -> Self {
        if !(0.0..1.0).contains(&config.score_weight) {
            warn!(
                "⚠️  Invalid DDoS score weight {}, using {}",
                config.score_weight, DEFAULT_SCORE_WEIGHT
            );
            config.score_weight = DEFAULT_SCORE_WEIGHT;
        }
        Self {
            config,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &DdosConfig {
        &self.config
    }

    /// Records a request from `identity` at `now` and decides whether to serve it.
    pub fn allow(&self, identity: &str, now: Instant) -> bool {
        if identity.is_empty() {
            return false;
        }

        let mut clients = self.clients.lock();
        let state = clients.entry(identity.to_string()).or_default();
        state.last_seen = Some(now);

        if state.refresh_block(now) {
            return false;
        }

        state.trim(now, self.config.window);
        state.requests.push_back(now);

        let count = state.requests.len();
        let overflow = count.saturating_sub(self.config.max_requests) as f64;
        let weight = self.config.score_weight;
        state.score = weight * state.score + (1.0 - weight) * overflow;

        let hard_limit = self.config.max_requests + self.config.burst_allowance;
        if count > hard_limit || state.score > self.config.burst_allowance as f64 {
            state.blocked_until = Some(now + self.config.block_duration);
            warn!(
                "🚫 Blocking {} for {:?} ({} requests in window, score {:.2})",
                identity, self.config.block_duration, count, state.score
            );
            return false;
        }

        true
    }

    /// Blocks `identity` for `duration` starting at `now`. A longer block already
    /// in place is kept.
    pub fn block(&self, identity: &str, duration: Duration, now: Instant) {
        if identity.is_empty() {
            return;
        }

        let mut clients = self.clients.lock();
        let state = clients.entry(identity.to_string()).or_default();
        state.refresh_block(now);
        state.trim(now, self.config.window);
        state.last_seen = Some(now);

        let until = now + duration;
        if state.blocked_until.map_or(true, |current| current < until) {
            state.blocked_until = Some(until);
        }
        debug!("Manual block on {} for {:?}", identity, duration);
    }

    pub fn is_blocked(&self, identity: &str, now: Instant) -> bool {
        let mut clients = self.clients.lock();
        clients
            .get_mut(identity)
            .map(|state| state.refresh_block(now))
            .unwrap_or(false)
    }

    /// Live smoothed score, `0.0` for identities never seen.
    pub fn score(&self, identity: &str) -> f64 {
        self.clients
            .lock()
            .get(identity)
            .map(|state| state.score)
            .unwrap_or(0.0)
    }

    /// All tracked identities, highest score first, ties broken by identity.
    pub fn snapshot(&self, now: Instant) -> Vec<ClientSnapshot> {
        let clients = self.clients.lock();
        let window = self.config.window;

        let mut out: Vec<ClientSnapshot> = clients
            .iter()
            .map(|(identity, state)| {
                let recent_requests = state
                    .requests
                    .iter()
                    .filter(|t| now.saturating_duration_since(**t) <= window)
                    .count();
                let blocked = state.blocked_until.map_or(false, |until| now < until);
                ClientSnapshot {
                    identity: identity.clone(),
                    score: state.score,
                    recent_requests,
                    blocked,
                    blocked_until: state.blocked_until.filter(|_| blocked),
                    last_seen: state.last_seen,
                }
            })
            .collect();
        drop(clients);

        out.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.identity.cmp(&b.identity))
        });
        out
    }

    pub fn tracked(&self) -> usize {
        self.clients.lock().len()
    }
}

impl Default for DdosMitigator {
    fn default() -> Self {
        Self::new(DdosConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> DdosConfig {
        DdosConfig {
            window: Duration::from_secs(10),
            max_requests: 5,
            burst_allowance: 2,
            block_duration: Duration::from_secs(30),
            score_weight: 0.85,
        }
    }

    #[test]
    fn test_burst_over_limit_blocks() {
        let cfg = small_config();
        let limit = cfg.max_requests + cfg.burst_allowance;
        let mitigator = DdosMitigator::new(cfg);
        let start = Instant::now();

        for i in 0..limit {
            let now = start + Duration::from_millis(i as u64);
            assert!(mitigator.allow("10.0.0.1", now), "request {} should pass", i);
        }
        let last = start + Duration::from_millis(limit as u64);
        assert!(!mitigator.allow("10.0.0.1", last));
        assert!(mitigator.is_blocked("10.0.0.1", last));

        // Still blocked just before expiry, free afterwards
        assert!(mitigator.is_blocked("10.0.0.1", last + Duration::from_secs(29)));
        assert!(!mitigator.is_blocked("10.0.0.1", last + Duration::from_secs(31)));
    }

    #[test]
    fn test_blocked_identity_rejected_without_recording() {
        let mitigator = DdosMitigator::new(small_config());
        let now = Instant::now();
        mitigator.block("peer-a", Duration::from_secs(5), now);
        assert!(!mitigator.allow("peer-a", now + Duration::from_secs(1)));
        assert_eq!(mitigator.snapshot(now)[0].recent_requests, 0);
        assert!(mitigator.allow("peer-a", now + Duration::from_secs(6)));
    }

    #[test]
    fn test_window_trims_old_requests() {
        let mitigator = DdosMitigator::new(small_config());
        let start = Instant::now();
        for i in 0..5 {
            assert!(mitigator.allow("a", start + Duration::from_millis(i)));
        }
        // Well past the window: the old burst no longer counts
        let later = start + Duration::from_secs(20);
        for i in 0..5 {
            assert!(mitigator.allow("a", later + Duration::from_millis(i)));
        }
        assert_eq!(mitigator.score("a"), 0.0);
    }

    #[test]
    fn test_score_decays_exponentially() {
        let mitigator = DdosMitigator::new(small_config());
        let start = Instant::now();
        for i in 0..6 {
            mitigator.allow("a", start + Duration::from_millis(i));
        }
        // One request over the limit: 0.85 * 0 + 0.15 * 1
        assert!((mitigator.score("a") - 0.15).abs() < 1e-9);

        // Window expired, overflow is zero again, score shrinks by the weight
        mitigator.allow("a", start + Duration::from_secs(30));
        assert!((mitigator.score("a") - 0.15 * 0.85).abs() < 1e-9);
    }

    #[test]
    fn test_score_threshold_blocks_with_zero_burst() {
        let mitigator = DdosMitigator::new(DdosConfig {
            burst_allowance: 0,
            ..small_config()
        });
        let start = Instant::now();
        for i in 0..5 {
            assert!(mitigator.allow("a", start + Duration::from_millis(i)));
        }
        assert!(!mitigator.allow("a", start + Duration::from_millis(5)));
    }

    #[test]
    fn test_manual_block_keeps_longer_block() {
        let mitigator = DdosMitigator::new(small_config());
        let now = Instant::now();
        mitigator.block("a", Duration::from_secs(60), now);
        mitigator.block("a", Duration::from_secs(1), now);
        assert!(mitigator.is_blocked("a", now + Duration::from_secs(30)));
    }

    #[test]
    fn test_snapshot_ordering() {
        let mitigator = DdosMitigator::new(small_config());
        let start = Instant::now();
        for i in 0..7 {
            mitigator.allow("hot", start + Duration::from_millis(i));
        }
        mitigator.allow("b-quiet", start);
        mitigator.allow("a-quiet", start);

        let snap = mitigator.snapshot(start + Duration::from_millis(10));
        let order: Vec<&str> = snap.iter().map(|s| s.identity.as_str()).collect();
        assert_eq!(order, vec!["hot", "a-quiet", "b-quiet"]);
        assert_eq!(snap[0].recent_requests, 7);
    }

    #[test]
    fn test_empty_identity_rejected() {
        let mitigator = DdosMitigator::default();
        assert!(!mitigator.allow("", Instant::now()));
        assert_eq!(mitigator.tracked(), 0);
    }

    #[test]
    fn test_invalid_weight_falls_back() {
        let mitigator = DdosMitigator::new(DdosConfig {
            score_weight: 1.5,
            ..small_config()
        });
        assert_eq!(mitigator.config().score_weight, DEFAULT_SCORE_WEIGHT);
    }
}
