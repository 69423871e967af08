//! Mutually authenticated TLS 1.3 transport.
//!
//! Servers require a client certificate chained to the configured CA pool and
//! clients verify the server against the same pool. Records are plain TLS with
//! no extra framing. Peers are identified by the SHA-256 of their leaf's
//! SubjectPublicKeyInfo, so an identity and any pin on it survive certificate
//! renewal with the same key. Optional pinning runs right after the handshake.

use crate::network::transport::{
    connect_tcp, BoxedConn, BoxedListener, HandshakingListener, SecureConn, Transport,
    TransportError,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use sha2::{Digest, Sha256};
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};
use tracing::{debug, info, warn};
use x509_parser::prelude::{FromDer, X509Certificate};

#[derive(Error, Debug)]
pub enum TlsError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("Certificate generation failed: {0}")]
    Pki(#[from] rcgen::Error),
    #[error("Client verifier: {0}")]
    Verifier(String),
    #[error("No certificate found in {0}")]
    MissingCertificate(String),
    #[error("Invalid private key")]
    InvalidPrivateKey,
    #[error("Invalid fingerprint: {0}")]
    InvalidFingerprint(String),
    #[error("Malformed certificate: {0}")]
    Certificate(String),
}

/// Certificate chain, private key and CA pool for one node
pub struct TlsIdentity {
    pub certs: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
    pub ca_certs: Vec<CertificateDer<'static>>,
}

impl Clone for TlsIdentity {
    fn clone(&self) -> Self {
        Self {
            certs: self.certs.clone(),
            key: self.key.clone_key(),
            ca_certs: self.ca_certs.clone(),
        }
    }
}

impl TlsIdentity {
    /// Load chain, key and CA bundle from PEM files
    pub fn from_pem_files(
        cert_path: &Path,
        key_path: &Path,
        ca_path: &Path,
    ) -> Result<Self, TlsError> {
        let certs = read_certs(cert_path)?;
        let ca_certs = read_certs(ca_path)?;

        let mut key_reader = io::BufReader::new(std::fs::File::open(key_path)?);
        let key = rustls_pemfile::private_key(&mut key_reader)?
            .ok_or(TlsError::InvalidPrivateKey)?;

        Ok(Self {
            certs,
            key,
            ca_certs,
        })
    }

    /// SPKI fingerprint of the leaf certificate
    pub fn fingerprint(&self) -> Option<[u8; 32]> {
        self.certs
            .first()
            .and_then(|leaf| spki_fingerprint(leaf).ok())
    }
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = io::BufReader::new(std::fs::File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(TlsError::MissingCertificate(path.display().to_string()));
    }
    Ok(certs)
}

/// SHA-256 over the DER SubjectPublicKeyInfo of a certificate.
pub fn spki_fingerprint(der: &[u8]) -> Result<[u8; 32], TlsError> {
    let (_, cert) =
        X509Certificate::from_der(der).map_err(|e| TlsError::Certificate(e.to_string()))?;
    let mut hasher = Sha256::new();
    hasher.update(cert.public_key().raw);
    Ok(hasher.finalize().into())
}

/// Development certificate authority backed by `rcgen`
pub mod dev_pki {
    use super::{TlsError, TlsIdentity};
    use rcgen::{
        BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
        KeyPair, KeyUsagePurpose,
    };
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

    pub struct DevAuthority {
        cert: Certificate,
        key: KeyPair,
    }

    impl DevAuthority {
        pub fn generate(common_name: &str) -> Result<Self, TlsError> {
            let key = KeyPair::generate()?;
            let mut params = CertificateParams::new(Vec::<String>::new())?;
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            params.distinguished_name.push(DnType::CommonName, common_name);
            params.key_usages = vec![
                KeyUsagePurpose::KeyCertSign,
                KeyUsagePurpose::CrlSign,
                KeyUsagePurpose::DigitalSignature,
            ];
            let cert = params.self_signed(&key)?;
            Ok(Self { cert, key })
        }

        pub fn ca_der(&self) -> CertificateDer<'static> {
            self.cert.der().clone()
        }

        pub fn ca_pem(&self) -> String {
            self.cert.pem()
        }

        /// Leaf valid for both server and client auth, covering `localhost`
        /// and `127.0.0.1` in addition to `names`.
        pub fn issue(&self, common_name: &str, names: &[&str]) -> Result<TlsIdentity, TlsError> {
            let (identity, _, _) = self.issue_pem(common_name, names)?;
            Ok(identity)
        }

        /// Like [`issue`](Self::issue), also returning the leaf and key as PEM.
        pub fn issue_pem(
            &self,
            common_name: &str,
            names: &[&str],
        ) -> Result<(TlsIdentity, String, String), TlsError> {
            self.sign_leaf(common_name, names, KeyPair::generate()?)
        }

        /// New leaf for the key already held by `identity`.
        pub fn renew(
            &self,
            identity: &TlsIdentity,
            common_name: &str,
            names: &[&str],
        ) -> Result<TlsIdentity, TlsError> {
            let leaf_key = KeyPair::try_from(identity.key.secret_der())?;
            let (renewed, _, _) = self.sign_leaf(common_name, names, leaf_key)?;
            Ok(renewed)
        }

        fn sign_leaf(
            &self,
            common_name: &str,
            names: &[&str],
            leaf_key: KeyPair,
        ) -> Result<(TlsIdentity, String, String), TlsError> {
            let mut sans = vec!["localhost".to_string(), "127.0.0.1".to_string()];
            sans.extend(names.iter().map(|n| n.to_string()));

            let mut params = CertificateParams::new(sans)?;
            params.is_ca = IsCa::NoCa;
            params.distinguished_name.push(DnType::CommonName, common_name);
            params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
            params.extended_key_usages = vec![
                ExtendedKeyUsagePurpose::ServerAuth,
                ExtendedKeyUsagePurpose::ClientAuth,
            ];
            let leaf = params.signed_by(&leaf_key, &self.cert, &self.key)?;

            let identity = TlsIdentity {
                certs: vec![leaf.der().clone()],
                key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der())),
                ca_certs: vec![self.ca_der()],
            };
            Ok((identity, leaf.pem(), leaf_key.serialize_pem()))
        }
    }

    /// Fresh authority plus one leaf, for single-node setups.
    pub fn issue(common_name: &str) -> Result<(DevAuthority, TlsIdentity), TlsError> {
        let authority = DevAuthority::generate("peerlink dev CA")?;
        let identity = authority.issue(common_name, &[])?;
        Ok((authority, identity))
    }
}

struct TlsConfigs {
    client: Arc<ClientConfig>,
    server: Arc<ServerConfig>,
}

impl TlsConfigs {
    fn build(identity: &TlsIdentity) -> Result<Self, TlsError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let mut roots = RootCertStore::empty();
        for ca in &identity.ca_certs {
            roots.add(ca.clone())?;
        }
        let roots = Arc::new(roots);

        let verifier = WebPkiClientVerifier::builder_with_provider(roots.clone(), provider.clone())
            .build()
            .map_err(|e| TlsError::Verifier(e.to_string()))?;

        let server = ServerConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .with_client_cert_verifier(verifier)
            .with_single_cert(identity.certs.clone(), identity.key.clone_key())?;

        let client = ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .with_root_certificates(roots)
            .with_client_auth_cert(identity.certs.clone(), identity.key.clone_key())?;

        Ok(Self {
            client: Arc::new(client),
            server: Arc::new(server),
        })
    }
}

struct TlsShared {
    configs: RwLock<Arc<TlsConfigs>>,
    pins: RwLock<Vec<[u8; 32]>>,
    handshake_timeout: Duration,
}

impl TlsShared {
    /// Empty pin list disables pinning.
    fn check_pin(&self, fingerprint: &[u8; 32]) -> Result<(), TransportError> {
        let pins = self.pins.read();
        if pins.is_empty() {
            return Ok(());
        }
        let pinned = pins
            .iter()
            .fold(subtle::Choice::from(0), |acc, pin| acc | pin[..].ct_eq(&fingerprint[..]));
        if bool::from(pinned) {
            Ok(())
        } else {
            warn!("🚫 TLS peer {} not in pin set", hex::encode(fingerprint));
            Err(TransportError::Unauthorized(hex::encode(fingerprint)))
        }
    }

    /// Server side of the handshake for one accepted socket.
    async fn accept(&self, tcp: TcpStream, addr: SocketAddr) -> Result<TlsConn, TransportError> {
        tcp.set_nodelay(true)?;

        let acceptor = TlsAcceptor::from(self.configs.read().server.clone());
        let timeout = self.handshake_timeout;
        let stream = tokio::time::timeout(timeout, acceptor.accept(tcp))
            .await
            .map_err(|_| TransportError::Timeout(timeout))?
            .map_err(|e| {
                warn!("⚠️  TLS handshake from {} failed: {}", addr, e);
                TransportError::Handshake(e.to_string())
            })?;

        let conn = self.establish(TlsStream::from(stream)).await?;
        debug!("🔒 TLS session from {} established", addr);
        Ok(conn)
    }

    async fn establish(&self, mut stream: TlsStream<TcpStream>) -> Result<TlsConn, TransportError> {
        let fingerprint = {
            let (_, session) = stream.get_ref();
            session
                .peer_certificates()
                .and_then(|chain| chain.first())
                .map(|leaf| spki_fingerprint(leaf))
        };
        let fingerprint = match fingerprint {
            Some(Ok(fingerprint)) => fingerprint,
            Some(Err(e)) => {
                let _ = stream.shutdown().await;
                return Err(TransportError::Handshake(e.to_string()));
            }
            None => {
                let _ = stream.shutdown().await;
                return Err(TransportError::Handshake(
                    "peer presented no certificate".to_string(),
                ));
            }
        };
        if let Err(e) = self.check_pin(&fingerprint) {
            let _ = stream.shutdown().await;
            return Err(e);
        }
        Ok(TlsConn { stream, fingerprint })
    }
}

/// Established TLS session
pub struct TlsConn {
    stream: TlsStream<TcpStream>,
    fingerprint: [u8; 32],
}

impl TlsConn {
    pub fn peer_fingerprint(&self) -> [u8; 32] {
        self.fingerprint
    }
}

impl AsyncRead for TlsConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TlsConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

impl SecureConn for TlsConn {
    fn remote_identity(&self) -> Vec<u8> {
        self.fingerprint.to_vec()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.get_ref().0.peer_addr().ok()
    }
}

/// Mutual-TLS transport; hot-swappable identity and optional SPKI pinning
#[derive(Clone)]
pub struct TlsTransport {
    shared: Arc<TlsShared>,
    server_name: Option<String>,
}

impl TlsTransport {
    pub fn new(identity: &TlsIdentity, handshake_timeout: Duration) -> Result<Self, TlsError> {
        let configs = TlsConfigs::build(identity)?;
        Ok(Self {
            shared: Arc::new(TlsShared {
                configs: RwLock::new(Arc::new(configs)),
                pins: RwLock::new(Vec::new()),
                handshake_timeout,
            }),
            server_name: None,
        })
    }

    /// Name verified against the server certificate instead of the dialed host.
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// Replaces the certificate chain for dials and handshakes started afterwards.
    pub fn reload_identity(&self, identity: &TlsIdentity) -> Result<(), TlsError> {
        let configs = TlsConfigs::build(identity)?;
        *self.shared.configs.write() = Arc::new(configs);
        info!("🔒 TLS identity reloaded");
        Ok(())
    }

    /// Hex SHA-256 SPKI fingerprints; an empty list disables pinning.
    pub fn set_pinned_fingerprints<S: AsRef<str>>(
        &self,
        fingerprints: &[S],
    ) -> Result<(), TlsError> {
        let mut pins = Vec::with_capacity(fingerprints.len());
        for fp in fingerprints {
            let fp = fp.as_ref();
            let bytes =
                hex::decode(fp).map_err(|_| TlsError::InvalidFingerprint(fp.to_string()))?;
            let pin: [u8; 32] = bytes
                .try_into()
                .map_err(|_| TlsError::InvalidFingerprint(fp.to_string()))?;
            pins.push(pin);
        }
        *self.shared.pins.write() = pins;
        Ok(())
    }

    fn server_name_for(&self, addr: &str) -> Result<ServerName<'static>, TransportError> {
        let host = match &self.server_name {
            Some(name) => name.clone(),
            None => {
                let (host, _) = addr
                    .rsplit_once(':')
                    .ok_or_else(|| TransportError::InvalidAddress(addr.to_string()))?;
                host.trim_start_matches('[').trim_end_matches(']').to_string()
            }
        };
        ServerName::try_from(host.as_str())
            .map(|name| name.to_owned())
            .map_err(|e| TransportError::InvalidAddress(e.to_string()))
    }
}

#[async_trait]
impl Transport for TlsTransport {
    async fn dial(&self, addr: &str) -> Result<BoxedConn, TransportError> {
        let server_name = self.server_name_for(addr)?;
        let connector = TlsConnector::from(self.shared.configs.read().client.clone());
        let timeout = self.shared.handshake_timeout;

        let stream = tokio::time::timeout(timeout, async {
            let tcp = connect_tcp(addr, timeout).await?;
            connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| TransportError::Handshake(e.to_string()))
        })
        .await
        .map_err(|_| TransportError::Timeout(timeout))??;

        let conn = self.shared.establish(TlsStream::from(stream)).await?;
        debug!("🔒 TLS session to {} established", addr);
        Ok(Box::new(conn))
    }

    async fn listen(&self, addr: &str) -> Result<BoxedListener, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        info!("🔒 TLS listener on {}", listener.local_addr()?);
        let shared = self.shared.clone();
        let listener = HandshakingListener::spawn(listener, move |tcp, addr| {
            let shared = shared.clone();
            async move {
                let conn = shared.accept(tcp, addr).await?;
                Ok(Box::new(conn) as BoxedConn)
            }
        })?;
        Ok(Box::new(listener))
    }

    fn name(&self) -> &'static str {
        "tls"
    }
}
