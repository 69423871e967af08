//! Common dial/listen contract for encrypted peer channels
//! Implemented by the Noise XX and mutual-TLS transports
use crate::constants::transport::ACCEPT_QUEUE;
use async_trait::async_trait;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Handshake failed: {0}")]
    Handshake(String),
    #[error("Handshake timed out after {0:?}")]
    Timeout(Duration),
    #[error("Remote identity not authorised: {0}")]
    Unauthorized(String),
    #[error("TLS error: {0}")]
    Tls(#[from] crate::network::tls::TlsError),
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Listener closed")]
    Closed,
}

/// An established, authenticated byte stream
pub trait SecureConn: AsyncRead + AsyncWrite + Unpin + Send {
    /// Authenticated remote identity: Noise static key or TLS leaf fingerprint
    fn remote_identity(&self) -> Vec<u8>;

    fn peer_addr(&self) -> Option<SocketAddr>;
}

pub type BoxedConn = Box<dyn SecureConn>;

/// Yields connections whose handshake already completed
#[async_trait]
pub trait SecureListener: Send {
    async fn accept(&mut self) -> Result<BoxedConn, TransportError>;

    fn local_addr(&self) -> std::io::Result<SocketAddr>;
}

pub type BoxedListener = Box<dyn SecureListener>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Connects to `addr` and completes the handshake as the initiator.
    async fn dial(&self, addr: &str) -> Result<BoxedConn, TransportError>;

    /// Binds `addr`; every accepted connection is handshaken as the responder.
    async fn listen(&self, addr: &str) -> Result<BoxedListener, TransportError>;

    fn name(&self) -> &'static str;
}

/// TCP connect bounded by `timeout`
pub(crate) async fn connect_tcp(
    addr: &str,
    timeout: Duration,
) -> Result<TcpStream, TransportError> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| TransportError::Timeout(timeout))??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

type HandshakeResult = Result<BoxedConn, TransportError>;

/// Accepts TCP sockets in the background and handshakes each one on its own
/// task, so a stalled client only holds up its own socket. `accept` yields
/// results in completion order.
pub(crate) struct HandshakingListener {
    local_addr: SocketAddr,
    ready: mpsc::Receiver<HandshakeResult>,
    acceptor: JoinHandle<()>,
}

impl HandshakingListener {
    pub(crate) fn spawn<F, Fut>(listener: TcpListener, handshake: F) -> std::io::Result<Self>
    where
        F: Fn(TcpStream, SocketAddr) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandshakeResult> + Send + 'static,
    {
        let local_addr = listener.local_addr()?;
        let (tx, ready) = mpsc::channel(ACCEPT_QUEUE);

        let acceptor = tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = tx.closed() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, addr)) => {
                        let tx = tx.clone();
                        let pending = handshake(stream, addr);
                        tokio::spawn(async move {
                            if tx.send(pending.await).await.is_err() {
                                debug!("Listener gone, dropping handshake from {}", addr);
                            }
                        });
                    }
                    Err(e) => {
                        if tx.send(Err(e.into())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(Self {
            local_addr,
            ready,
            acceptor,
        })
    }
}

impl Drop for HandshakingListener {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}

#[async_trait]
impl SecureListener for HandshakingListener {
    async fn accept(&mut self) -> Result<BoxedConn, TransportError> {
        self.ready.recv().await.ok_or(TransportError::Closed)?
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        Ok(self.local_addr)
    }
}
