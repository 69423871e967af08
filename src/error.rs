use crate::config::ConfigError;
use crate::crypto::key_manager::KeyError;
use crate::crypto::key_rotator::RotationError;
use crate::network::discovery::DiscoveryError;
use crate::network::pfs::PfsError;
use crate::network::tls::TlsError;
use crate::network::transport::TransportError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    #[error("Rotation error: {0}")]
    Rotation(#[from] RotationError),

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    #[error("PFS error: {0}")]
    Pfs(#[from] PfsError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("Initialization error: {0}")]
    Initialization(String),
}
