//! In-process node for tests and local experiments.
//!
//! Listeners and dialers are connected through `tokio::io::duplex` pipes, so a
//! whole proxy (client, tsnsrv and downstream) can run inside one test without
//! touching the network.

use super::{BoxedStream, Identity, ListenMode, Tailnet, TailnetListener, WhoisError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tracing::debug;

const PIPE_CAPACITY: usize = 64 * 1024;

type Incoming = io::Result<(DuplexStream, SocketAddr)>;

struct Registration {
    mode: ListenMode,
    tx: mpsc::UnboundedSender<Incoming>,
}

/// A node whose "network" is a table of in-process listeners.
pub struct MemoryTailnet {
    self_ip: IpAddr,
    listeners: Mutex<HashMap<String, Registration>>,
    refused: Mutex<HashSet<String>>,
    identities: Mutex<HashMap<IpAddr, Identity>>,
    whois_delay: Mutex<Option<Duration>>,
    whois_unavailable: Mutex<bool>,
    whois_calls: AtomicUsize,
    next_port: AtomicU16,
}

impl Default for MemoryTailnet {
    fn default() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::new(100, 100, 0, 1)))
    }
}

impl MemoryTailnet {
    pub fn new(self_ip: IpAddr) -> Self {
        Self {
            self_ip,
            listeners: Mutex::new(HashMap::new()),
            refused: Mutex::new(HashSet::new()),
            identities: Mutex::new(HashMap::new()),
            whois_delay: Mutex::new(None),
            whois_unavailable: Mutex::new(false),
            whois_calls: AtomicUsize::new(0),
            next_port: AtomicU16::new(40000),
        }
    }

    /// Register the identity returned for peers connecting from `ip`.
    pub fn add_identity(&self, ip: IpAddr, identity: Identity) {
        self.identities.lock().insert(ip, identity);
    }

    /// Delay every whois answer, to exercise lookup timeouts.
    pub fn set_whois_delay(&self, delay: Duration) {
        *self.whois_delay.lock() = Some(delay);
    }

    /// Make every whois fail as if the identity service were down.
    pub fn set_whois_unavailable(&self, unavailable: bool) {
        *self.whois_unavailable.lock() = unavailable;
    }

    pub fn whois_calls(&self) -> usize {
        self.whois_calls.load(Ordering::SeqCst)
    }

    /// Make future `listen` calls on `addr` fail.
    pub fn refuse_listen(&self, addr: &str) {
        self.refused.lock().insert(addr.to_string());
    }

    /// Close the listener on `addr`. Its pending and future accepts fail
    /// with `NotConnected`.
    pub fn close_listener(&self, addr: &str) -> bool {
        self.listeners.lock().remove(addr).is_some()
    }

    /// Make the listener on `addr` fail its next accept, as a single failed
    /// incoming connection would. The listener stays open.
    pub fn break_listener(&self, addr: &str) -> bool {
        let listeners = self.listeners.lock();
        match listeners.get(addr) {
            Some(reg) => reg
                .tx
                .send(Err(io::Error::new(io::ErrorKind::ConnectionAborted, "connection aborted during accept")))
                .is_ok(),
            None => false,
        }
    }

    /// Addresses currently bound, with their modes.
    pub fn bound(&self) -> Vec<(String, ListenMode)> {
        let mut bound: Vec<_> = self
            .listeners
            .lock()
            .iter()
            .map(|(addr, reg)| (addr.clone(), reg.mode))
            .collect();
        bound.sort_by(|a, b| a.0.cmp(&b.0));
        bound
    }

    /// Open a connection to the listener on `addr` as if it came from `peer`.
    pub fn connect(&self, addr: &str, peer: SocketAddr) -> io::Result<DuplexStream> {
        let mut listeners = self.listeners.lock();
        let Some(reg) = listeners.get(addr) else {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("nothing listening on {}", addr),
            ));
        };

        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        if reg.tx.send(Ok((server, peer))).is_err() {
            listeners.remove(addr);
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("listener on {} was closed", addr),
            ));
        }
        debug!(addr, %peer, "memory connection opened");
        Ok(client)
    }
}

struct MemoryListener {
    rx: mpsc::UnboundedReceiver<Incoming>,
    local_addr: SocketAddr,
}

#[async_trait]
impl TailnetListener for MemoryListener {
    async fn accept(&mut self) -> io::Result<(BoxedStream, SocketAddr)> {
        match self.rx.recv().await {
            Some(Ok((stream, peer))) => Ok((Box::new(stream), peer)),
            Some(Err(e)) => Err(e),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "listener closed")),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr)
    }
}

#[async_trait]
impl Tailnet for MemoryTailnet {
    async fn listen(&self, mode: ListenMode, addr: &str) -> io::Result<Box<dyn TailnetListener>> {
        if self.refused.lock().contains(addr) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("listening on {} is not allowed", addr),
            ));
        }

        let mut listeners = self.listeners.lock();
        if let Some(existing) = listeners.get(addr) {
            if !existing.tx.is_closed() {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("{} is already bound", addr),
                ));
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        listeners.insert(addr.to_string(), Registration { mode, tx });

        let port = super::listen_port(addr).unwrap_or(0);
        Ok(Box::new(MemoryListener {
            rx,
            local_addr: SocketAddr::new(self.self_ip, port),
        }))
    }

    async fn dial(&self, network: &str, addr: &str) -> io::Result<BoxedStream> {
        if network != "tcp" {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("network {} is not supported", network),
            ));
        }
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        let stream = self.connect(addr, SocketAddr::new(self.self_ip, port))?;
        Ok(Box::new(stream))
    }

    async fn whois(&self, peer: SocketAddr) -> Result<Identity, WhoisError> {
        self.whois_calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.whois_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if *self.whois_unavailable.lock() {
            return Err(WhoisError::Unavailable("identity service is down".to_string()));
        }

        self.identities
            .lock()
            .get(&peer.ip())
            .cloned()
            .ok_or(WhoisError::UnknownPeer(peer))
    }
}
