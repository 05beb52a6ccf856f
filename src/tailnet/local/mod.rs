//! A node backed by a managed tailscaled process.
//!
//! tailscaled runs in userspace-networking mode. Listeners are published
//! with serve config TCP forwards to loopback sockets owned by this process,
//! with the PROXY protocol carrying the real caller address. Dials and
//! whois lookups go through the LocalAPI.

pub mod api;
pub mod daemon;
pub mod proxy_protocol;

use super::{BoxedStream, Identity, ListenMode, Tailnet, TailnetListener, WhoisError};
use crate::config::NodeOptions;
use api::{LocalApiError, LocalClient, TcpPortHandler};
use async_trait::async_trait;
use daemon::{AuthKey, Daemon};
use hyper::StatusCode;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Bound on reading the PROXY header of a forwarded connection.
const PROXY_HEADER_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("could not determine a configuration directory, pass -stateDir")]
    NoConfigDir,
    #[error("could not create state directory {path}: {source}")]
    StateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("could not run {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("could not check on tailscaled: {0}")]
    Wait(#[source] io::Error),
    #[error("tailscaled exited early with {0}")]
    Exited(ExitStatus),
    #[error("tailscale up failed with {status}: {stderr}")]
    Up { status: ExitStatus, stderr: String },
    #[error("could not stage the auth key for tailscale up: {0}")]
    AuthKey(#[source] io::Error),
    #[error("node is {0}, not Running")]
    NotRunning(String),
    #[error(transparent)]
    Api(#[from] LocalApiError),
}

/// A tailnet node run by a child tailscaled.
pub struct LocalTailnet {
    client: LocalClient,
    dns_name: String,
    tailscale_ips: Vec<IpAddr>,
    /// Serve config edits are read-modify-write
    serve_lock: tokio::sync::Mutex<()>,
    ports: Mutex<HashSet<u16>>,
    _daemon: Daemon,
}

impl LocalTailnet {
    /// Spawn tailscaled, log it in and wait until the node is running.
    pub async fn start(opts: &NodeOptions) -> Result<Self, NodeError> {
        let authkey = read_authkey(opts);

        let mut daemon = Daemon::spawn(opts)?;
        let client = LocalClient::new(daemon.socket());
        daemon.wait_ready(&client).await?;
        daemon.up(opts, authkey.as_ref()).await?;

        let status = client.status().await?;
        if status.backend_state != "Running" {
            return Err(NodeError::NotRunning(status.backend_state));
        }

        let me = status.self_node.unwrap_or_default();
        let dns_name = me.dns_name.trim_end_matches('.').to_string();
        let tailscale_ips = me.tailscale_ips.unwrap_or_default();
        info!(
            dns_name = %dns_name,
            ips = ?tailscale_ips,
            state_dir = %daemon.state_dir().display(),
            "Node is running"
        );

        Ok(Self {
            client,
            dns_name,
            tailscale_ips,
            serve_lock: tokio::sync::Mutex::new(()),
            ports: Mutex::new(HashSet::new()),
            _daemon: daemon,
        })
    }

    /// The node's MagicDNS name, without the trailing dot.
    pub fn dns_name(&self) -> &str {
        &self.dns_name
    }

    pub fn tailscale_ips(&self) -> &[IpAddr] {
        &self.tailscale_ips
    }

    async fn publish(&self, mode: ListenMode, port: u16, target: SocketAddr) -> Result<(), LocalApiError> {
        let _guard = self.serve_lock.lock().await;
        let mut config = self.client.serve_config().await?;

        let key = port.to_string();
        if let Some(previous) = config.tcp.get(&key) {
            debug!(port, previous = ?previous, "Replacing serve config entry");
        }
        config.tcp.insert(
            key,
            TcpPortHandler {
                tcp_forward: target.to_string(),
                terminate_tls: if mode.terminates_tls() {
                    self.dns_name.clone()
                } else {
                    String::new()
                },
                proxy_protocol: 1,
                ..Default::default()
            },
        );

        let host_port = format!("{}:{}", self.dns_name, port);
        if matches!(mode, ListenMode::Funnel { .. }) {
            config.allow_funnel.insert(host_port, true);
        } else {
            config.allow_funnel.remove(&host_port);
        }

        self.client.set_serve_config(&config).await
    }
}

/// The auth key file if it holds a key, else `TS_AUTHKEY`.
fn read_authkey(opts: &NodeOptions) -> Option<AuthKey> {
    if let Some(path) = &opts.authkey_path {
        match std::fs::read_to_string(path) {
            Ok(key) if !key.trim().is_empty() => {
                // tailscale trims the file contents itself
                let path = std::fs::canonicalize(path).unwrap_or_else(|_| path.clone());
                return Some(AuthKey::File(path));
            }
            Ok(_) => warn!(path = %path.display(), "Auth key file is empty"),
            Err(e) => warn!(path = %path.display(), error = %e, "Could not read auth key"),
        }
    }
    std::env::var("TS_AUTHKEY")
        .ok()
        .filter(|key| !key.is_empty())
        .map(AuthKey::Value)
}

/// Whether `ip` belongs to the tailnet ranges (100.64.0.0/10 or
/// fd7a:115c:a1e0::/48).
pub fn is_tailnet_addr(ip: IpAddr) -> bool {
    match ip.to_canonical() {
        IpAddr::V4(v4) => {
            let [a, b, ..] = v4.octets();
            a == 100 && (b & 0xc0) == 64
        }
        IpAddr::V6(v6) => v6.segments()[..3] == [0xfd7a, 0x115c, 0xa1e0],
    }
}

fn to_io(e: LocalApiError) -> io::Error {
    match e {
        LocalApiError::Connect { source, .. } => source,
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}

/// Pause after a failed accept on the loopback socket.
const ACCEPT_RETRY: Duration = Duration::from_millis(50);

/// Connections whose PROXY header has been read, waiting for `accept`.
const ACCEPT_QUEUE: usize = 128;

type Forwarded = (TcpStream, SocketAddr);

/// Receives the connections tailscaled forwards to a loopback socket. Each
/// PROXY header is read in its own task, so a slow caller never holds up
/// the others.
struct LocalListener {
    rx: mpsc::Receiver<Forwarded>,
    advertised: SocketAddr,
    acceptor: JoinHandle<()>,
}

impl LocalListener {
    fn spawn(tcp: TcpListener, funnel_only: bool, advertised: SocketAddr) -> Self {
        let (tx, rx) = mpsc::channel(ACCEPT_QUEUE);
        Self {
            rx,
            advertised,
            acceptor: tokio::spawn(accept_forwarded(tcp, funnel_only, tx)),
        }
    }
}

impl Drop for LocalListener {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}

async fn accept_forwarded(tcp: TcpListener, funnel_only: bool, tx: mpsc::Sender<Forwarded>) {
    loop {
        let accepted = tokio::select! {
            accepted = tcp.accept() => accepted,
            _ = tx.closed() => return,
        };
        let (stream, from) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "Failed to accept forwarded connection");
                tokio::time::sleep(ACCEPT_RETRY).await;
                continue;
            }
        };

        let tx = tx.clone();
        tokio::spawn(async move {
            if let Some(forwarded) = read_peer(stream, from, funnel_only).await {
                let _ = tx.send(forwarded).await;
            }
        });
    }
}

/// Recover the caller's address from the PROXY header. Returns `None` for
/// connections that are dropped.
async fn read_peer(mut stream: TcpStream, from: SocketAddr, funnel_only: bool) -> Option<Forwarded> {
    let peer = match tokio::time::timeout(PROXY_HEADER_TIMEOUT, proxy_protocol::read_v1(&mut stream)).await {
        Ok(Ok(Some(peer))) => peer,
        Ok(Ok(None)) => from,
        Ok(Err(e)) => {
            debug!(%from, error = %e, "Dropping connection with bad PROXY header");
            return None;
        }
        Err(_) => {
            debug!(%from, "Timed out reading PROXY header");
            return None;
        }
    };

    if funnel_only && is_tailnet_addr(peer.ip()) {
        debug!(%peer, "Dropping tailnet connection on funnel-only listener");
        return None;
    }
    Some((stream, peer))
}

#[async_trait]
impl TailnetListener for LocalListener {
    async fn accept(&mut self) -> io::Result<(BoxedStream, SocketAddr)> {
        match self.rx.recv().await {
            Some((stream, peer)) => Ok((Box::new(stream), peer)),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "listener closed")),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.advertised)
    }
}

#[async_trait]
impl Tailnet for LocalTailnet {
    async fn listen(&self, mode: ListenMode, addr: &str) -> io::Result<Box<dyn TailnetListener>> {
        let port = super::listen_port(addr).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("invalid listen address {}", addr))
        })?;
        if !self.ports.lock().insert(port) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("port {} is already served by this node", port),
            ));
        }

        let result = async {
            let tcp = TcpListener::bind("127.0.0.1:0").await?;
            let target = tcp.local_addr()?;
            self.publish(mode, port, target).await.map_err(to_io)?;
            Ok::<_, io::Error>((tcp, target))
        }
        .await;

        let (tcp, target) = match result {
            Ok(bound) => bound,
            Err(e) => {
                self.ports.lock().remove(&port);
                return Err(e);
            }
        };

        debug!(port, %target, ?mode, "Published serve config forward");
        let ip = self
            .tailscale_ips
            .first()
            .copied()
            .unwrap_or(IpAddr::from([127, 0, 0, 1]));

        Ok(Box::new(LocalListener::spawn(
            tcp,
            matches!(mode, ListenMode::Funnel { funnel_only: true }),
            SocketAddr::new(ip, port),
        )))
    }

    async fn dial(&self, network: &str, addr: &str) -> io::Result<BoxedStream> {
        if network != "tcp" {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("network {} is not supported", network),
            ));
        }
        let (host, port) = addr
            .rsplit_once(':')
            .and_then(|(host, port)| Some((host, port.parse::<u16>().ok()?)))
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, format!("invalid address {}", addr))
            })?;
        let host = host.trim_start_matches('[').trim_end_matches(']');

        let stream = self.client.dial(host, port).await.map_err(to_io)?;
        Ok(Box::new(stream))
    }

    async fn whois(&self, peer: SocketAddr) -> Result<Identity, WhoisError> {
        match self.client.whois(peer).await {
            Ok(who) => Ok(Identity::from(who)),
            Err(e) if e.status() == Some(StatusCode::NOT_FOUND) => Err(WhoisError::UnknownPeer(peer)),
            Err(e) => Err(WhoisError::Unavailable(e.to_string())),
        }
    }
}
