//! Noise and mutual-TLS transports over loopback TCP.

use peerlink::network::noise::{NoiseKeypair, NoiseTransport};
use peerlink::network::tls::dev_pki::DevAuthority;
use peerlink::network::tls::TlsTransport;
use peerlink::network::transport::{Transport, TransportError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Listens on an ephemeral port, echoes one message back, returns the remote identity.
async fn echo_once(server: &dyn Transport) -> (String, tokio::task::JoinHandle<Vec<u8>>) {
    let mut listener = server.listen("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let handle = tokio::spawn(async move {
        let mut conn = listener.accept().await.unwrap();
        let mut buf = [0u8; 5];
        conn.read_exact(&mut buf).await.unwrap();
        conn.write_all(&buf).await.unwrap();
        conn.flush().await.unwrap();
        conn.remote_identity()
    });
    (addr, handle)
}

#[tokio::test]
async fn test_noise_echo_over_tcp() {
    let server = NoiseTransport::new();
    let client = NoiseTransport::new();
    let (addr, handle) = echo_once(&server).await;

    let mut conn = client.dial(&addr).await.unwrap();
    assert_eq!(conn.remote_identity(), server.static_public_key().to_vec());
    conn.write_all(b"hello").await.unwrap();
    conn.flush().await.unwrap();
    let mut buf = [0u8; 5];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");

    assert_eq!(handle.await.unwrap(), client.static_public_key().to_vec());
}

#[tokio::test]
async fn test_noise_allow_list_blocks_stranger() {
    let server = NoiseTransport::new();
    let friend = NoiseTransport::new();
    let stranger = NoiseTransport::new();
    server.allow_peer(&friend.static_public_key());

    let mut listener = server.listen("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let accepts = tokio::spawn(async move {
        let first = listener.accept().await.map(|c| c.remote_identity());
        let second = listener.accept().await.map(|c| c.remote_identity());
        (first, second)
    });

    // The stranger finishes its own side; the server refuses it
    let _ = stranger.dial(&addr).await;
    let friendly = friend.dial(&addr).await.unwrap();

    // Handshakes run concurrently, so results may arrive in either order
    let (first, second) = accepts.await.unwrap();
    let (refused, admitted) = if first.is_err() { (first, second) } else { (second, first) };
    assert!(matches!(refused, Err(TransportError::Unauthorized(_))));
    assert_eq!(admitted.unwrap(), friend.static_public_key().to_vec());
    drop(friendly);
}

#[tokio::test]
async fn test_noise_handshake_times_out_on_silent_peer() {
    let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = silent.local_addr().unwrap().to_string();
    let _hold = tokio::spawn(async move {
        let (socket, _) = silent.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        drop(socket);
    });

    let client = NoiseTransport::with_keypair(NoiseKeypair::generate(), Duration::from_millis(200));
    assert!(matches!(client.dial(&addr).await, Err(TransportError::Timeout(_))));
}

#[tokio::test]
async fn test_silent_client_does_not_stall_accept() {
    let server = NoiseTransport::with_keypair(NoiseKeypair::generate(), Duration::from_secs(30));
    let client = NoiseTransport::new();
    let mut listener = server.listen("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    // Connects and never speaks
    let _silent = TcpStream::connect(&addr).await.unwrap();

    let accept = tokio::spawn(async move { listener.accept().await.map(|c| c.remote_identity()) });
    let _conn = client.dial(&addr).await.unwrap();

    let accepted = tokio::time::timeout(Duration::from_secs(5), accept)
        .await
        .expect("accept stalled behind the silent socket")
        .unwrap()
        .unwrap();
    assert_eq!(accepted, client.static_public_key().to_vec());
}

#[tokio::test]
async fn test_tls_mutual_auth_echo() {
    let ca = DevAuthority::generate("integration CA").unwrap();
    let server_id = ca.issue("server", &[]).unwrap();
    let client_id = ca.issue("client", &[]).unwrap();

    let server = TlsTransport::new(&server_id, TIMEOUT).unwrap();
    let client = TlsTransport::new(&client_id, TIMEOUT).unwrap().with_server_name("localhost");
    let (addr, handle) = echo_once(&server).await;

    let mut conn = client.dial(&addr).await.unwrap();
    assert_eq!(conn.remote_identity(), server_id.fingerprint().unwrap().to_vec());
    conn.write_all(b"mtls!").await.unwrap();
    conn.flush().await.unwrap();
    let mut buf = [0u8; 5];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"mtls!");

    assert_eq!(handle.await.unwrap(), client_id.fingerprint().unwrap().to_vec());
}

#[tokio::test]
async fn test_tls_rejects_client_from_foreign_ca() {
    let ca = DevAuthority::generate("trusted CA").unwrap();
    let rogue_ca = DevAuthority::generate("rogue CA").unwrap();
    let server = TlsTransport::new(&ca.issue("server", &[]).unwrap(), TIMEOUT).unwrap();

    // Rogue client trusts the real CA but presents a rogue leaf
    let mut rogue_id = rogue_ca.issue("rogue", &[]).unwrap();
    rogue_id.ca_certs = vec![ca.ca_der()];
    let rogue = TlsTransport::new(&rogue_id, TIMEOUT).unwrap();

    let mut listener = server.listen("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let accept = tokio::spawn(async move { listener.accept().await.map(|c| c.remote_identity()) });

    let _ = rogue.dial(&addr).await;
    assert!(accept.await.unwrap().is_err());
}

#[tokio::test]
async fn test_tls_client_refuses_unknown_server() {
    let server_ca = DevAuthority::generate("server CA").unwrap();
    let client_ca = DevAuthority::generate("client CA").unwrap();
    let server = TlsTransport::new(&server_ca.issue("server", &[]).unwrap(), TIMEOUT).unwrap();
    let client = TlsTransport::new(&client_ca.issue("client", &[]).unwrap(), TIMEOUT).unwrap();

    let mut listener = server.listen("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let _accept = tokio::spawn(async move {
        let _ = listener.accept().await;
    });

    assert!(matches!(
        client.dial(&addr).await,
        Err(TransportError::Handshake(_))
    ));
}

#[tokio::test]
async fn test_tls_pin_mismatch_closes_connection() {
    let ca = DevAuthority::generate("pinning CA").unwrap();
    let server_id = ca.issue("server", &[]).unwrap();
    let server = TlsTransport::new(&server_id, TIMEOUT).unwrap();
    let client = TlsTransport::new(&ca.issue("client", &[]).unwrap(), TIMEOUT).unwrap();
    client.set_pinned_fingerprints(&[hex::encode([0xab; 32])]).unwrap();

    let mut listener = server.listen("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let _accept = tokio::spawn(async move {
        let _ = listener.accept().await;
    });

    match client.dial(&addr).await {
        Err(TransportError::Unauthorized(fp)) => {
            assert_eq!(fp, hex::encode(server_id.fingerprint().unwrap()))
        }
        other => panic!("expected pin rejection, got {:?}", other.err()),
    }

    // Pinning the real leaf lets the same client through
    client
        .set_pinned_fingerprints(&[hex::encode(server_id.fingerprint().unwrap())])
        .unwrap();
    let mut listener = server.listen("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let _accept = tokio::spawn(async move {
        let _ = listener.accept().await;
    });
    assert!(client.dial(&addr).await.is_ok());
}

#[tokio::test]
async fn test_tls_reload_identity_serves_new_leaf() {
    let ca = DevAuthority::generate("reload CA").unwrap();
    let old_id = ca.issue("server-old", &[]).unwrap();
    let new_id = ca.issue("server-new", &[]).unwrap();
    let server = TlsTransport::new(&old_id, TIMEOUT).unwrap();
    let client = TlsTransport::new(&ca.issue("client", &[]).unwrap(), TIMEOUT).unwrap();

    server.reload_identity(&new_id).unwrap();
    let (addr, handle) = echo_once(&server).await;

    let mut conn = client.dial(&addr).await.unwrap();
    assert_eq!(conn.remote_identity(), new_id.fingerprint().unwrap().to_vec());
    conn.write_all(b"fresh").await.unwrap();
    conn.flush().await.unwrap();
    let mut buf = [0u8; 5];
    conn.read_exact(&mut buf).await.unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_tls_pin_survives_certificate_renewal() {
    let ca = DevAuthority::generate("renewal CA").unwrap();
    let server_id = ca.issue("server", &[]).unwrap();
    let server = TlsTransport::new(&server_id, TIMEOUT).unwrap();
    let client = TlsTransport::new(&ca.issue("client", &[]).unwrap(), TIMEOUT).unwrap();
    let pin = hex::encode(server_id.fingerprint().unwrap());
    client.set_pinned_fingerprints(&[pin.as_str()]).unwrap();

    let renewed = ca.renew(&server_id, "server", &["server.local"]).unwrap();
    assert_ne!(renewed.certs, server_id.certs);
    server.reload_identity(&renewed).unwrap();

    let (addr, handle) = echo_once(&server).await;
    let mut conn = client.dial(&addr).await.unwrap();
    assert_eq!(hex::encode(conn.remote_identity()), pin);
    conn.write_all(b"renew").await.unwrap();
    conn.flush().await.unwrap();
    let mut buf = [0u8; 5];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"renew");
    handle.await.unwrap();
}
