//! Global constants for the peerlink networking core
//!
//! Centralizes protocol identifiers, thresholds and default tunables so the
//! wire formats and abuse policies live in one place.

/// Peer registry constants
pub mod peers {
    use std::time::Duration;

    /// A peer becomes Faulted once its failure count exceeds this value
    pub const FAULT_THRESHOLD: u32 = 3;

    /// How long a faulted peer's address stays blocked when quarantined
    pub const QUARANTINE_COOLDOWN: Duration = Duration::from_secs(300); // 5 minutes

    /// Default per-subscriber event queue depth
    pub const DEFAULT_EVENT_BUFFER: usize = 64;

    /// Random bytes used for generated peer IDs (hex encoded → 32 chars)
    pub const GENERATED_ID_BYTES: usize = 16;
}

/// Discovery constants
pub mod discovery {
    /// Minimum peers required when no quorum is configured
    pub const DEFAULT_QUORUM: usize = 1;

    /// Interval between discovery passes in the daemon
    pub const DEFAULT_DISCOVERY_INTERVAL_SECS: u64 = 120;
}

/// Transport and channel crypto constants
pub mod transport {
    use std::time::Duration;

    /// Noise protocol name: XX pattern, Curve25519, ChaCha20-Poly1305, BLAKE2b
    pub const NOISE_PARAMS: &str = "Noise_XX_25519_ChaChaPoly_BLAKE2b";

    /// Prologue bound into every Noise handshake hash
    pub const NOISE_PROLOGUE: &[u8] = b"peerlink/noise/v1";

    /// Length prefix of every Noise frame (uint16 big-endian)
    pub const FRAME_HEADER_LEN: usize = 2;

    /// Largest Noise message (header excluded)
    pub const MAX_NOISE_MESSAGE: usize = 65_535;

    /// Poly1305 tag length
    pub const AEAD_TAG_LEN: usize = 16;

    /// Largest plaintext that fits one Noise frame
    pub const MAX_FRAME_PLAINTEXT: usize = MAX_NOISE_MESSAGE - AEAD_TAG_LEN;

    /// Completed inbound handshakes buffered ahead of `accept`
    pub const ACCEPT_QUEUE: usize = 64;

    /// Connect + handshake budget when the caller gives none
    pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

    /// PFS envelope format version
    pub const PFS_VERSION: u8 = 1;

    /// HKDF info string for PFS envelope keys
    pub const PFS_CONTEXT: &[u8] = b"peerlink/pfs/xchacha20poly1305/v1";

    /// X25519 public key length
    pub const X25519_KEY_LEN: usize = 32;

    /// XChaCha20 nonce length
    pub const XNONCE_LEN: usize = 24;

    /// version(1) || ephemeral(32) || nonce(24)
    pub const PFS_HEADER_LEN: usize = 1 + X25519_KEY_LEN + XNONCE_LEN;
}

/// Key management constants
pub mod keys {
    use std::time::Duration;

    /// Symmetric key length for every purpose
    pub const SYMMETRIC_KEY_LEN: usize = 32;

    /// Actor recorded when callers do not name one
    pub const DEFAULT_ACTOR: &str = "system";

    /// Actor recorded for scheduled rotations
    pub const ROTATOR_ACTOR: &str = "key-rotator";

    /// Default rotation interval in the daemon
    pub const DEFAULT_ROTATION_INTERVAL: Duration = Duration::from_secs(6 * 3600); // 6 hours
}

/// Abuse mitigation defaults
pub mod ddos {
    use std::time::Duration;

    /// Sliding window for request counting
    pub const DEFAULT_WINDOW: Duration = Duration::from_secs(10);

    /// Requests allowed per window before the score starts growing
    pub const DEFAULT_MAX_REQUESTS: usize = 100;

    /// Extra headroom above MAX_REQUESTS before a hard block
    pub const DEFAULT_BURST_ALLOWANCE: usize = 20;

    /// Block length once an identity trips the limiter
    pub const DEFAULT_BLOCK_DURATION: Duration = Duration::from_secs(60);

    /// Exponential smoothing weight of the previous score
    pub const DEFAULT_SCORE_WEIGHT: f64 = 0.85;
}
