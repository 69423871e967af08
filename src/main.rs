use clap::Parser;
use parking_lot::Mutex;
use peerlink::config::{self, Config, LoggingConfig};
use peerlink::crypto::key_manager::KeyManager;
use peerlink::crypto::key_rotator::KeyRotator;
use peerlink::error::AppError;
use peerlink::network::ddos::DdosMitigator;
use peerlink::network::discovery::{DiscoveryError, DiscoveryService};
use peerlink::network::noise::NoiseTransport;
use peerlink::network::tls::{dev_pki, TlsIdentity, TlsTransport};
use peerlink::network::transport::{BoxedConn, BoxedListener, Transport};
use peerlink::peer_manager::{Peer, PeerManager};
use peerlink::shutdown::ShutdownManager;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "peerlinkd")]
#[command(about = "Peerlink secure P2P node", long_about = None)]
struct Args {
    /// Config file (defaults to ~/.peerlink/peerlink.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    listen_addr: Option<String>,

    #[arg(short, long)]
    verbose: bool,

    /// Write the default config to --config and exit
    #[arg(long)]
    generate_config: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = run(args).await {
        eprintln!("❌ {}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), AppError> {
    let config_path = args.config.unwrap_or_else(config::default_config_path);

    if args.generate_config {
        Config::default().save_to_file(&config_path)?;
        println!("✓ Wrote default config to {}", config_path.display());
        return Ok(());
    }

    let mut cfg = Config::load_or_default(&config_path)?;
    if let Some(addr) = args.listen_addr {
        cfg.network.listen_address = addr;
    }
    let _log_guard = setup_logging(&cfg.logging, args.verbose);

    info!("🚀 peerlinkd v{} starting", env!("CARGO_PKG_VERSION"));
    info!("📝 Config: {}", config_path.display());

    let mitigator = Arc::new(DdosMitigator::new(cfg.ddos.to_mitigator_config()));
    let peers = Arc::new(PeerManager::new().with_quarantine(mitigator.clone()));
    let keys = Arc::new(KeyManager::new());
    let rotator = Arc::new(KeyRotator::with_actor(keys, cfg.rotation.actor.clone()));

    let transport: Arc<dyn Transport> = match cfg.network.transport.as_str() {
        "tls" => Arc::new(build_tls(&cfg)?),
        _ => {
            let noise = Arc::new(NoiseTransport::new());
            rotator.register(noise.clone());
            noise
        }
    };

    // Key material for registered handlers comes from the first rotation
    rotator.rotate()?;

    let mut shutdown = ShutdownManager::new();

    let listener = transport.listen(&cfg.network.listen_address).await?;
    info!(
        "✓ {} transport listening on {}",
        transport.name(),
        listener.local_addr()?
    );
    shutdown.register_task(tokio::spawn(accept_loop(
        listener,
        transport.name(),
        peers.clone(),
        mitigator.clone(),
        shutdown.token(),
    )));

    shutdown.register_task(tokio::spawn(log_peer_events(
        peers.clone(),
        cfg.network.event_buffer,
        shutdown.token(),
    )));

    let discovery = Arc::new(
        DiscoveryService::new(peers.clone(), cfg.network.bootstrap())
            .with_mitigator(mitigator.clone())
            .with_quorum(cfg.network.quorum),
    );
    shutdown.register_task(tokio::spawn(discovery_loop(
        discovery,
        transport.clone(),
        peers.clone(),
        Duration::from_secs(cfg.network.discovery_interval_secs),
        shutdown.token(),
    )));

    shutdown.register_task(
        rotator
            .clone()
            .start(Duration::from_secs(cfg.rotation.interval_secs), shutdown.token()),
    );

    shutdown.wait_for_shutdown().await;
    Ok(())
}

fn build_tls(cfg: &Config) -> Result<TlsTransport, AppError> {
    let identity = match cfg.tls.pem_paths() {
        Some((cert, key, ca)) => TlsIdentity::from_pem_files(cert, key, ca)?,
        None => {
            warn!("⚠️  No TLS certificates configured, issuing a development CA");
            dev_pki::issue("peerlinkd")?.1
        }
    };
    if let Some(fp) = identity.fingerprint() {
        info!("🔒 TLS SPKI fingerprint {}", hex::encode(fp));
    }

    let mut transport = TlsTransport::new(&identity, cfg.network.handshake_timeout())?;
    if let Some(name) = &cfg.tls.server_name {
        transport = transport.with_server_name(name.clone());
    }
    transport.set_pinned_fingerprints(&cfg.tls.pinned_fingerprints[..])?;
    Ok(transport)
}

fn peer_from_conn(conn: &BoxedConn, transport: &str) -> Peer {
    let identity = conn.remote_identity();
    let address = conn
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();
    let mut peer = Peer::new(hex::encode(&identity), address);
    match transport {
        "noise" => peer.noise_key = identity,
        _ => peer.tls_fingerprint = hex::encode(&identity),
    }
    peer
}

async fn accept_loop(
    mut listener: BoxedListener,
    transport: &'static str,
    peers: Arc<PeerManager>,
    mitigator: Arc<DdosMitigator>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let conn = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                warn!("⚠️  Inbound handshake failed: {}", e);
                continue;
            }
        };

        let ip = conn.peer_addr().map(|a| a.ip().to_string()).unwrap_or_default();
        if !mitigator.allow(&ip, Instant::now()) {
            warn!("🚫 Rejecting inbound connection from {}", ip);
            continue;
        }

        let peer = peers.add_peer(peer_from_conn(&conn, transport));
        tokio::spawn(drive_connection(conn, peer.id, peers.clone(), cancel.clone()));
    }
    debug!("Accept loop stopped");
}

/// Holds the session open until the remote closes it, then forgets the peer.
async fn drive_connection(
    mut conn: BoxedConn,
    peer_id: String,
    peers: Arc<PeerManager>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; 16 * 1024];
    let reason = loop {
        tokio::select! {
            _ = cancel.cancelled() => break "shutdown".to_string(),
            read = conn.read(&mut buf) => match read {
                Ok(0) => break "connection closed".to_string(),
                Ok(n) => debug!("{} bytes from {}", n, peer_id),
                Err(e) => break format!("read error: {}", e),
            },
        }
    };
    peers.remove_peer(&peer_id, &reason);
}

async fn discovery_loop(
    discovery: Arc<DiscoveryService>,
    transport: Arc<dyn Transport>,
    peers: Arc<PeerManager>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let dialed: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let found = match discovery.discover(&cancel).await {
            Ok(found) => found,
            Err(DiscoveryError::QuorumNotSatisfied { have, want, peers }) => {
                warn!("⚠️  Continuing with {}/{} peers", have, want);
                peers
            }
            Err(DiscoveryError::Cancelled) => break,
        };

        for peer in discovery.dial_targets(found, Instant::now()) {
            if !dialed.lock().insert(peer.id.clone()) {
                continue;
            }
            tokio::spawn(dial_peer(
                peer,
                transport.clone(),
                peers.clone(),
                dialed.clone(),
                cancel.clone(),
            ));
        }
    }
    debug!("Discovery loop stopped");
}

async fn dial_peer(
    peer: Peer,
    transport: Arc<dyn Transport>,
    peers: Arc<PeerManager>,
    dialed: Arc<Mutex<HashSet<String>>>,
    cancel: CancellationToken,
) {
    match transport.dial(&peer.address).await {
        Ok(conn) => {
            info!("✓ Connected to {} at {}", peer.id, peer.address);
            let mut conn = conn;
            let mut read_buf = vec![0u8; 16 * 1024];
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    read = conn.read(&mut read_buf) => match read {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {}
                    },
                }
            }
        }
        Err(e) => {
            warn!("⚠️  Dial {} ({}) failed: {}", peer.id, peer.address, e);
            peers.mark_failure(&peer.id, &e.to_string());
        }
    }
    dialed.lock().remove(&peer.id);
}

async fn log_peer_events(peers: Arc<PeerManager>, buffer: usize, cancel: CancellationToken) {
    let (mut events, subscription) = peers.subscribe(buffer);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => info!(
                    "📡 {:?} {} ({}){}",
                    event.kind,
                    event.peer.id,
                    event.peer.address,
                    event.reason.map(|r| format!(": {}", r)).unwrap_or_default()
                ),
                None => break,
            },
        }
    }
    subscription.cancel();
    if peers.dropped_events() > 0 {
        warn!("⚠️  {} peer events dropped", peers.dropped_events());
    }
}

fn setup_logging(
    config: &LoggingConfig,
    verbose: bool,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{fmt, EnvFilter};

    let level = if verbose { "trace" } else { &config.level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let is_systemd =
        std::env::var("JOURNAL_STREAM").is_ok() || std::env::var("INVOCATION_ID").is_ok();

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    let short_hostname = hostname.split('.').next().unwrap_or(&hostname).to_string();

    if config.output == "file" {
        let path = Path::new(&config.file_path);
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let file_name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "peerlinkd.log".into());
        let (writer, guard) =
            tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, file_name));

        if config.format == "json" {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(writer)
                .init();
        } else {
            fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false)
                .with_timer(CustomTimer {
                    hostname: short_hostname,
                })
                .compact()
                .init();
        }
        return Some(guard);
    }

    match config.format.as_str() {
        "json" => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_thread_ids(false)
                .init();
        }
        _ if is_systemd => {
            // journald adds its own timestamp and host
            fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_file(false)
                .with_line_number(false)
                .without_time()
                .compact()
                .init();
        }
        _ => {
            fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_file(false)
                .with_line_number(false)
                .with_timer(CustomTimer {
                    hostname: short_hostname,
                })
                .compact()
                .init();
        }
    }
    None
}

/// "YYYY-MM-DD HH:MM:SS.mmm [host]" in UTC
struct CustomTimer {
    hostname: String,
}

impl tracing_subscriber::fmt::time::FormatTime for CustomTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(
            w,
            "{}.{:03} [{}]",
            now.format("%Y-%m-%d %H:%M:%S"),
            now.timestamp_subsec_millis(),
            self.hostname
        )
    }
}
