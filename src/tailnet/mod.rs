//! The overlay network node the proxy runs as.
//!
//! The pipeline only needs three capabilities from a node: accepting
//! connections on one of the listening modes, dialing outbound connections,
//! and looking up who is on the other end of an accepted connection.

pub mod local;
pub mod memory;

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};

pub use local::LocalTailnet;
pub use memory::MemoryTailnet;

/// A bidirectional byte stream, erased so listeners and dialers of different
/// nodes can be used interchangeably.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// How a listener is exposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenMode {
    /// Reachable from the public internet through the Funnel relay. TLS is
    /// always terminated by the node. With `funnel_only`, tailnet peers are not
    /// accepted on this listener.
    Funnel { funnel_only: bool },
    /// Reachable on the tailnet with TLS terminated using node certificates.
    Tls,
    /// Reachable on the tailnet without transport encryption.
    Plaintext,
}

impl ListenMode {
    /// Scheme as seen by the caller.
    pub fn scheme(&self) -> &'static str {
        match self {
            ListenMode::Funnel { .. } | ListenMode::Tls => "https",
            ListenMode::Plaintext => "http",
        }
    }

    pub fn terminates_tls(&self) -> bool {
        !matches!(self, ListenMode::Plaintext)
    }
}

/// Verified identity of a tailnet peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub login_name: String,
    pub display_name: String,
    pub profile_pic_url: String,
    pub caps: Vec<String>,
    pub node_id: String,
    pub node_name: String,
    pub node_caps: Vec<String>,
    pub node_tags: Vec<String>,
}

impl Identity {
    /// The part of the login name before the `@`, or the whole name.
    pub fn login_localpart(&self) -> &str {
        self.login_name
            .split_once('@')
            .map(|(local, _)| local)
            .unwrap_or(&self.login_name)
    }

    /// The part of the login name after the `@`, or empty.
    pub fn login_domain(&self) -> &str {
        self.login_name
            .split_once('@')
            .map(|(_, domain)| domain)
            .unwrap_or("")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WhoisError {
    #[error("no peer known for {0}")]
    UnknownPeer(SocketAddr),
    #[error("identity service unavailable: {0}")]
    Unavailable(String),
}

/// A listener bound on a node.
#[async_trait]
pub trait TailnetListener: Send {
    /// Accept the next connection together with the caller's tailnet address.
    ///
    /// An error of kind `NotConnected` means the listener is closed for good.
    /// Any other error concerns a single incoming connection.
    async fn accept(&mut self) -> io::Result<(BoxedStream, SocketAddr)>;

    /// The address callers reach this listener on.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// An overlay network node. Shared by every in-flight request, so
/// implementations must be safe for concurrent use.
#[async_trait]
pub trait Tailnet: Send + Sync + 'static {
    async fn listen(&self, mode: ListenMode, addr: &str) -> io::Result<Box<dyn TailnetListener>>;

    async fn dial(&self, network: &str, addr: &str) -> io::Result<BoxedStream>;

    async fn whois(&self, peer: SocketAddr) -> Result<Identity, WhoisError>;
}

/// Whether an accept error means the listener is gone rather than one
/// connection having failed.
pub fn is_listener_closed(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::NotConnected
}

/// Extract the port from a Go-style listen address (`:443`, `0.0.0.0:443`,
/// `[::]:443`).
pub fn listen_port(addr: &str) -> Option<u16> {
    let (_, port) = addr.rsplit_once(':')?;
    port.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listen_port() {
        assert_eq!(listen_port(":443"), Some(443));
        assert_eq!(listen_port("0.0.0.0:8443"), Some(8443));
        assert_eq!(listen_port("[::]:10000"), Some(10000));
        assert_eq!(listen_port("443"), None);
        assert_eq!(listen_port(":https"), None);
        assert_eq!(listen_port(":70000"), None);
    }

    #[test]
    fn test_listener_closed_errors() {
        assert!(is_listener_closed(&io::Error::new(io::ErrorKind::NotConnected, "closed")));
        assert!(!is_listener_closed(&io::Error::new(io::ErrorKind::ConnectionAborted, "aborted")));
        assert!(!is_listener_closed(&io::Error::from_raw_os_error(24)));
    }

    #[test]
    fn test_listen_mode_scheme() {
        assert_eq!(ListenMode::Tls.scheme(), "https");
        assert_eq!(ListenMode::Funnel { funnel_only: true }.scheme(), "https");
        assert_eq!(ListenMode::Plaintext.scheme(), "http");
        assert!(!ListenMode::Plaintext.terminates_tls());
    }

    #[test]
    fn test_login_parts() {
        let identity = Identity {
            login_name: "alice@example.com".to_string(),
            ..Default::default()
        };
        assert_eq!(identity.login_localpart(), "alice");
        assert_eq!(identity.login_domain(), "example.com");

        let tagged = Identity {
            login_name: "tagged-devices".to_string(),
            ..Default::default()
        };
        assert_eq!(tagged.login_localpart(), "tagged-devices");
        assert_eq!(tagged.login_domain(), "");
    }
}
