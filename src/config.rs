//! Configuration for the peerlink daemon.
//!
//! Loaded from TOML. Every field has a default, so an empty file (or no file
//! at all) yields a runnable single-node setup.

use crate::constants::{ddos, discovery, keys, peers, transport};
use crate::network::ddos::DdosConfig;
use crate::peer_manager::Peer;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Platform data directory for peerlink
pub fn get_data_dir() -> PathBuf {
    if cfg!(windows) {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("peerlink")
    } else {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".peerlink")
    }
}

pub fn default_config_path() -> PathBuf {
    get_data_dir().join("peerlink.toml")
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub network: NetworkConfig,
    pub ddos: DdosSection,
    pub rotation: RotationConfig,
    pub tls: TlsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `"pretty"` or `"json"`
    pub format: String,
    /// `"stdout"` or `"file"`
    pub output: String,
    pub file_path: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            output: "stdout".to_string(),
            file_path: "peerlinkd.log".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapPeer {
    pub id: String,
    pub address: String,
}

impl From<&BootstrapPeer> for Peer {
    fn from(entry: &BootstrapPeer) -> Self {
        Peer::new(entry.id.clone(), entry.address.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub listen_address: String,
    /// `"noise"` or `"tls"`
    pub transport: String,
    pub bootstrap_peers: Vec<BootstrapPeer>,
    pub quorum: usize,
    pub handshake_timeout_secs: u64,
    pub event_buffer: usize,
    pub discovery_interval_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:7600".to_string(),
            transport: "noise".to_string(),
            bootstrap_peers: Vec::new(),
            quorum: discovery::DEFAULT_QUORUM,
            handshake_timeout_secs: transport::DEFAULT_HANDSHAKE_TIMEOUT.as_secs(),
            event_buffer: peers::DEFAULT_EVENT_BUFFER,
            discovery_interval_secs: discovery::DEFAULT_DISCOVERY_INTERVAL_SECS,
        }
    }
}

impl NetworkConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn bootstrap(&self) -> Vec<Peer> {
        self.bootstrap_peers.iter().map(Peer::from).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DdosSection {
    pub window_ms: u64,
    pub max_requests: usize,
    pub burst_allowance: usize,
    pub block_secs: u64,
    pub score_weight: f64,
}

impl Default for DdosSection {
    fn default() -> Self {
        Self {
            window_ms: ddos::DEFAULT_WINDOW.as_millis() as u64,
            max_requests: ddos::DEFAULT_MAX_REQUESTS,
            burst_allowance: ddos::DEFAULT_BURST_ALLOWANCE,
            block_secs: ddos::DEFAULT_BLOCK_DURATION.as_secs(),
            score_weight: ddos::DEFAULT_SCORE_WEIGHT,
        }
    }
}

impl DdosSection {
    pub fn to_mitigator_config(&self) -> DdosConfig {
        DdosConfig {
            window: Duration::from_millis(self.window_ms),
            max_requests: self.max_requests,
            burst_allowance: self.burst_allowance,
            block_duration: Duration::from_secs(self.block_secs),
            score_weight: self.score_weight,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    pub interval_secs: u64,
    pub actor: String,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            interval_secs: keys::DEFAULT_ROTATION_INTERVAL.as_secs(),
            actor: keys::ROTATOR_ACTOR.to_string(),
        }
    }
}

/// PEM paths for the TLS transport; unset paths fall back to a dev CA.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub ca_path: Option<PathBuf>,
    pub server_name: Option<String>,
    /// Hex SHA-256 SPKI fingerprints; empty disables pinning
    pub pinned_fingerprints: Vec<String>,
}

impl TlsConfig {
    /// All three PEM paths, when configured together.
    pub fn pem_paths(&self) -> Option<(&Path, &Path, &Path)> {
        match (&self.cert_path, &self.key_path, &self.ca_path) {
            (Some(cert), Some(key), Some(ca)) => {
                Some((cert.as_path(), key.as_path(), ca.as_path()))
            }
            _ => None,
        }
    }
}

impl Config {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Missing file → defaults. A file that exists must parse and validate.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("📝 No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load_from_file(path)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.network.transport.as_str() {
            "noise" | "tls" => {}
            other => return Err(ConfigError::Invalid(format!("unknown transport '{}'", other))),
        }
        if self.network.handshake_timeout_secs == 0 {
            return Err(ConfigError::Invalid("network.handshake_timeout_secs must be > 0".into()));
        }
        if self.network.event_buffer == 0 {
            return Err(ConfigError::Invalid("network.event_buffer must be > 0".into()));
        }
        if self.network.discovery_interval_secs == 0 {
            return Err(ConfigError::Invalid("network.discovery_interval_secs must be > 0".into()));
        }
        if self.ddos.window_ms == 0 {
            return Err(ConfigError::Invalid("ddos.window_ms must be > 0".into()));
        }
        if self.ddos.block_secs == 0 {
            return Err(ConfigError::Invalid("ddos.block_secs must be > 0".into()));
        }
        if !(0.0..1.0).contains(&self.ddos.score_weight) {
            return Err(ConfigError::Invalid(format!(
                "ddos.score_weight {} outside [0, 1)",
                self.ddos.score_weight
            )));
        }
        if self.rotation.interval_secs == 0 {
            return Err(ConfigError::Invalid("rotation.interval_secs must be > 0".into()));
        }
        for fp in &self.tls.pinned_fingerprints {
            if fp.len() != 64 || hex::decode(fp).is_err() {
                return Err(ConfigError::Invalid(format!("bad pinned fingerprint '{}'", fp)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_file_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"").unwrap();
        let config = Config::load_from_file(file.path()).unwrap();
        assert_eq!(config.network.transport, "noise");
        assert_eq!(config.network.quorum, 1);
        assert_eq!(config.ddos.score_weight, 0.85);
        assert_eq!(config.rotation.actor, "key-rotator");
    }

    #[test]
    fn test_parse_full_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[logging]
level = "debug"
format = "json"

[network]
listen_address = "127.0.0.1:9100"
transport = "tls"
quorum = 2
bootstrap_peers = [
    {{ id = "seed-1", address = "10.0.0.1:9100" }},
    {{ id = "seed-2", address = "10.0.0.2:9100" }},
]

[ddos]
window_ms = 5000
max_requests = 50

[tls]
server_name = "localhost"
"#
        )
        .unwrap();

        let config = Config::load_from_file(file.path()).unwrap();
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.network.transport, "tls");
        assert_eq!(config.network.bootstrap().len(), 2);
        assert_eq!(config.network.bootstrap()[1].id, "seed-2");
        let ddos = config.ddos.to_mitigator_config();
        assert_eq!(ddos.window, Duration::from_secs(5));
        assert_eq!(ddos.max_requests, 50);
        assert_eq!(ddos.burst_allowance, 20);
        assert_eq!(config.tls.server_name.as_deref(), Some("localhost"));
        assert!(config.tls.pem_paths().is_none());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.network.transport = "quic".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.ddos.score_weight = 1.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.rotation.interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.tls.pinned_fingerprints = vec!["zz".to_string()];
        assert!(config.validate().is_err());

        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.network.listen_address, "0.0.0.0:7600");
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("peerlink.toml");
        let mut config = Config::default();
        config.network.bootstrap_peers.push(BootstrapPeer {
            id: "seed".to_string(),
            address: "10.0.0.1:7600".to_string(),
        });
        config.save_to_file(&path).unwrap();

        let loaded = Config::load_from_file(&path).unwrap();
        assert_eq!(loaded.network.bootstrap_peers, config.network.bootstrap_peers);
    }

    #[test]
    fn test_parse_error_surfaces() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"[network\nquorum = ").unwrap();
        assert!(matches!(
            Config::load_from_file(file.path()),
            Err(ConfigError::Parse(_))
        ));
    }
}
