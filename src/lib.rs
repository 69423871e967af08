//! Secure peer-to-peer networking core: peer registry, discovery, Noise and
//! mutual-TLS transports, forward-secret envelopes, key management and
//! adaptive abuse mitigation.

pub mod config;
pub mod constants;
pub mod crypto;
pub mod error;
pub mod network;
pub mod peer_manager;
pub mod shutdown;

pub use crypto::key_manager::{KeyManager, KeyPurpose};
pub use crypto::key_rotator::{KeyRotator, RotationHandler, RotationKeys};
pub use network::ddos::{DdosConfig, DdosMitigator};
pub use network::discovery::{DiscoveryService, Resolver};
pub use network::noise::NoiseTransport;
pub use network::pfs::PfsChannel;
pub use network::tls::TlsTransport;
pub use network::transport::Transport;
pub use peer_manager::{Peer, PeerEvent, PeerEventKind, PeerManager, PeerState};
