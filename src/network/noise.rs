//! Noise XX transport over TCP.
//!
//! Three-message XX handshake (`-> e`, `<- e, ee, s, es`, `-> s, se`) with
//! Curve25519, ChaCha20-Poly1305 and BLAKE2b, bound to a fixed prologue.
//! Every handshake message and every post-handshake frame is written as
//! `[u16 BE length][bytes]`; transport frames carry one AEAD-sealed chunk each
//! and are decrypted one frame at a time.
//!
//! A failed handshake shuts the socket down and returns the error; there is no
//! retry.

use crate::constants::transport::{
    AEAD_TAG_LEN, DEFAULT_HANDSHAKE_TIMEOUT, FRAME_HEADER_LEN, MAX_FRAME_PLAINTEXT,
    MAX_NOISE_MESSAGE, NOISE_PARAMS, NOISE_PROLOGUE,
};
use crate::crypto::key_rotator::{HandlerError, RotationHandler, RotationKeys};
use crate::network::transport::{
    connect_tcp, BoxedConn, BoxedListener, HandshakingListener, SecureConn, Transport,
    TransportError,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use snow::params::NoiseParams;
use snow::{Builder, HandshakeState, TransportState};
use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

/// Long-term X25519 key pair used as the Noise static key
pub struct NoiseKeypair {
    private: Zeroizing<[u8; 32]>,
    pub public: [u8; 32],
}

impl NoiseKeypair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::thread_rng());
        Self::from_private(secret.to_bytes())
    }

    /// The public key is derived from the private bytes.
    pub fn from_private(private: [u8; 32]) -> Self {
        let secret = StaticSecret::from(private);
        let public = PublicKey::from(&secret);
        Self {
            private: Zeroizing::new(private),
            public: *public.as_bytes(),
        }
    }
}

/// Callback that may veto a remote static key after the handshake
pub type IdentityValidator = Arc<dyn Fn(&[u8]) -> Result<(), String> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

struct NoiseShared {
    keypair: RwLock<Arc<NoiseKeypair>>,
    allowed: RwLock<HashSet<Vec<u8>>>,
    validator: RwLock<Option<IdentityValidator>>,
    handshake_timeout: Duration,
}

impl NoiseShared {
    fn authorize(&self, remote: &[u8]) -> Result<(), TransportError> {
        {
            let allowed = self.allowed.read();
            if !allowed.is_empty() && !allowed.contains(remote) {
                return Err(TransportError::Unauthorized(hex::encode(remote)));
            }
        }
        let validator = self.validator.read().clone();
        if let Some(validate) = validator {
            validate(remote).map_err(TransportError::Unauthorized)?;
        }
        Ok(())
    }

    async fn handshake<S>(&self, stream: S, role: Role) -> Result<NoiseStream<S>, TransportError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let timeout = self.handshake_timeout;
        tokio::time::timeout(timeout, self.run_handshake(stream, role))
            .await
            .map_err(|_| TransportError::Timeout(timeout))?
    }

    async fn run_handshake<S>(
        &self,
        mut stream: S,
        role: Role,
    ) -> Result<NoiseStream<S>, TransportError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let keypair = self.keypair.read().clone();
        let mut hs = match build_handshake(&keypair, role) {
            Ok(hs) => hs,
            Err(e) => {
                let _ = stream.shutdown().await;
                return Err(e);
            }
        };

        let established = match exchange(&mut hs, &mut stream, role).await {
            Ok(()) => self.finish(hs),
            Err(e) => Err(e),
        };

        match established {
            Ok((session, remote_static)) => {
                debug!("🔒 Noise session established ({:?})", role);
                Ok(NoiseStream::new(stream, session, remote_static))
            }
            Err(e) => {
                warn!("⚠️  Noise handshake failed ({:?}): {}", role, e);
                let _ = stream.shutdown().await;
                Err(e)
            }
        }
    }

    fn finish(&self, hs: HandshakeState) -> Result<(TransportState, Vec<u8>), TransportError> {
        let remote_static = hs
            .get_remote_static()
            .map(|key| key.to_vec())
            .ok_or_else(|| TransportError::Handshake("missing remote static key".to_string()))?;
        self.authorize(&remote_static)?;
        let session = hs.into_transport_mode().map_err(noise_error)?;
        Ok((session, remote_static))
    }
}

fn build_handshake(keypair: &NoiseKeypair, role: Role) -> Result<HandshakeState, TransportError> {
    let params: NoiseParams = NOISE_PARAMS.parse().map_err(noise_error)?;
    let builder = Builder::new(params)
        .local_private_key(&keypair.private[..])
        .prologue(NOISE_PROLOGUE);
    match role {
        Role::Initiator => builder.build_initiator(),
        Role::Responder => builder.build_responder(),
    }
    .map_err(noise_error)
}

async fn exchange<S>(
    hs: &mut HandshakeState,
    stream: &mut S,
    role: Role,
) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match role {
        Role::Initiator => {
            send_handshake_message(hs, stream).await?; // -> e
            recv_handshake_message(hs, stream).await?; // <- e, ee, s, es
            send_handshake_message(hs, stream).await?; // -> s, se
        }
        Role::Responder => {
            recv_handshake_message(hs, stream).await?;
            send_handshake_message(hs, stream).await?;
            recv_handshake_message(hs, stream).await?;
        }
    }
    Ok(())
}

async fn send_handshake_message<S>(
    hs: &mut HandshakeState,
    stream: &mut S,
) -> Result<(), TransportError>
where
    S: AsyncWrite + Unpin,
{
    let mut msg = vec![0u8; MAX_NOISE_MESSAGE];
    let len = hs.write_message(&[], &mut msg).map_err(noise_error)?;
    stream.write_all(&(len as u16).to_be_bytes()).await?;
    stream.write_all(&msg[..len]).await?;
    stream.flush().await?;
    Ok(())
}

async fn recv_handshake_message<S>(
    hs: &mut HandshakeState,
    stream: &mut S,
) -> Result<(), TransportError>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    stream.read_exact(&mut header).await?;
    let len = u16::from_be_bytes(header) as usize;
    let mut msg = vec![0u8; len];
    stream.read_exact(&mut msg).await?;
    let mut payload = vec![0u8; len];
    hs.read_message(&msg, &mut payload).map_err(noise_error)?;
    Ok(())
}

fn noise_error(e: snow::Error) -> TransportError {
    TransportError::Handshake(e.to_string())
}

fn invalid_data<E: std::fmt::Display>(e: E) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e.to_string())
}

/// Noise-encrypted byte stream
pub struct NoiseStream<S> {
    inner: S,
    session: TransportState,
    remote_static: Vec<u8>,
    // Frame being read: header, then header + ciphertext
    frame: Vec<u8>,
    filled: usize,
    plain: Vec<u8>,
    plain_pos: usize,
    // Sealed frame waiting to be written
    out: Vec<u8>,
    out_pos: usize,
}

impl<S> NoiseStream<S> {
    fn new(inner: S, session: TransportState, remote_static: Vec<u8>) -> Self {
        Self {
            inner,
            session,
            remote_static,
            frame: vec![0u8; FRAME_HEADER_LEN],
            filled: 0,
            plain: Vec::new(),
            plain_pos: 0,
            out: Vec::new(),
            out_pos: 0,
        }
    }

    pub fn remote_static(&self) -> &[u8] {
        &self.remote_static
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: AsyncWrite + Unpin> NoiseStream<S> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.out_pos < self.out.len() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.out[self.out_pos..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.out_pos += n;
        }
        self.out.clear();
        self.out_pos = 0;
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for NoiseStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.plain_pos < this.plain.len() {
                let n = buf.remaining().min(this.plain.len() - this.plain_pos);
                buf.put_slice(&this.plain[this.plain_pos..this.plain_pos + n]);
                this.plain_pos += n;
                return Poll::Ready(Ok(()));
            }

            if this.filled == this.frame.len() {
                if this.frame.len() == FRAME_HEADER_LEN {
                    let len = u16::from_be_bytes([this.frame[0], this.frame[1]]) as usize;
                    if len < AEAD_TAG_LEN {
                        let msg = format!("noise frame too short: {}", len);
                        return Poll::Ready(Err(invalid_data(msg)));
                    }
                    this.frame.resize(FRAME_HEADER_LEN + len, 0);
                    continue;
                }

                this.plain.resize(this.frame.len() - FRAME_HEADER_LEN, 0);
                let n = this
                    .session
                    .read_message(&this.frame[FRAME_HEADER_LEN..], &mut this.plain)
                    .map_err(invalid_data)?;
                this.plain.truncate(n);
                this.plain_pos = 0;
                this.frame.truncate(FRAME_HEADER_LEN);
                this.filled = 0;
                continue;
            }

            let mut rb = ReadBuf::new(&mut this.frame[this.filled..]);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut rb))?;
            let n = rb.filled().len();
            if n == 0 {
                if this.filled == 0 {
                    return Poll::Ready(Ok(()));
                }
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "noise frame truncated",
                )));
            }
            this.filled += n;
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for NoiseStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let chunk = &buf[..buf.len().min(MAX_FRAME_PLAINTEXT)];
        this.out.resize(FRAME_HEADER_LEN + chunk.len() + AEAD_TAG_LEN, 0);
        let n = match this.session.write_message(chunk, &mut this.out[FRAME_HEADER_LEN..]) {
            Ok(n) => n,
            Err(e) => {
                this.out.clear();
                return Poll::Ready(Err(invalid_data(e)));
            }
        };
        this.out[..FRAME_HEADER_LEN].copy_from_slice(&(n as u16).to_be_bytes());
        this.out.truncate(FRAME_HEADER_LEN + n);
        this.out_pos = 0;

        // The frame is accepted; a pending socket is drained on the next write or flush
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(chunk.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

impl SecureConn for NoiseStream<TcpStream> {
    fn remote_identity(&self) -> Vec<u8> {
        self.remote_static.clone()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr().ok()
    }
}

/// Noise XX transport with optional static-key allow-list
#[derive(Clone)]
pub struct NoiseTransport {
    shared: Arc<NoiseShared>,
}

impl NoiseTransport {
    /// Transport with a freshly generated static key.
    pub fn new() -> Self {
        Self::with_keypair(NoiseKeypair::generate(), DEFAULT_HANDSHAKE_TIMEOUT)
    }

    pub fn with_keypair(keypair: NoiseKeypair, handshake_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(NoiseShared {
                keypair: RwLock::new(Arc::new(keypair)),
                allowed: RwLock::new(HashSet::new()),
                validator: RwLock::new(None),
                handshake_timeout,
            }),
        }
    }

    pub fn static_public_key(&self) -> [u8; 32] {
        self.shared.keypair.read().public
    }

    /// Replaces the static key for handshakes started after this call.
    pub fn set_static_key(&self, keypair: NoiseKeypair) {
        *self.shared.keypair.write() = Arc::new(keypair);
    }

    /// Once any key is allowed, only listed remote static keys are accepted.
    pub fn allow_peer(&self, remote_static: &[u8]) {
        self.shared.allowed.write().insert(remote_static.to_vec());
    }

    pub fn disallow_peer(&self, remote_static: &[u8]) {
        self.shared.allowed.write().remove(remote_static);
    }

    pub fn set_identity_validator(&self, validator: IdentityValidator) {
        *self.shared.validator.write() = Some(validator);
    }

    /// Runs the handshake over any duplex stream.
    pub async fn handshake<S>(
        &self,
        stream: S,
        role: Role,
    ) -> Result<NoiseStream<S>, TransportError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.shared.handshake(stream, role).await
    }
}

impl Default for NoiseTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for NoiseTransport {
    async fn dial(&self, addr: &str) -> Result<BoxedConn, TransportError> {
        let stream = connect_tcp(addr, self.shared.handshake_timeout).await?;
        let conn = self.shared.handshake(stream, Role::Initiator).await?;
        Ok(Box::new(conn))
    }

    async fn listen(&self, addr: &str) -> Result<BoxedListener, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        info!("🔒 Noise listener on {}", listener.local_addr()?);
        let shared = self.shared.clone();
        let listener = HandshakingListener::spawn(listener, move |stream, addr| {
            let shared = shared.clone();
            async move {
                stream.set_nodelay(true)?;
                debug!("Inbound Noise connection from {}", addr);
                let conn = shared.handshake(stream, Role::Responder).await?;
                Ok(Box::new(conn) as BoxedConn)
            }
        })?;
        Ok(Box::new(listener))
    }

    fn name(&self) -> &'static str {
        "noise"
    }
}

impl RotationHandler for NoiseTransport {
    fn handle(&self, keys: &RotationKeys) -> Result<(), HandlerError> {
        self.set_static_key(NoiseKeypair::from_private(*keys.noise_static));
        debug!("Noise static key rotated to v{}", keys.noise_version);
        Ok(())
    }
}
