//! Bounded caller identity lookup.

use crate::metrics;
use crate::tailnet::{Identity, Tailnet, WhoisError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Looks up who is calling. Never fails a request: every lookup problem
/// yields `None` and the request proceeds without identity headers.
pub struct IdentityResolver {
    node: Arc<dyn Tailnet>,
    timeout: Duration,
    suppress: bool,
}

impl IdentityResolver {
    pub fn new(node: Arc<dyn Tailnet>, timeout: Duration, suppress: bool) -> Self {
        Self {
            node,
            timeout,
            suppress,
        }
    }

    pub async fn resolve(&self, peer: SocketAddr) -> Option<Identity> {
        if self.suppress {
            return None;
        }

        match tokio::time::timeout(self.timeout, self.node.whois(peer)).await {
            Ok(Ok(identity)) => {
                debug!(%peer, login = %identity.login_name, "Resolved caller");
                metrics::record_whois("ok");
                Some(identity)
            }
            Ok(Err(WhoisError::UnknownPeer(_))) => {
                // Funnel callers are not tailnet peers
                debug!(%peer, "Caller is not a known peer");
                metrics::record_whois("unknown");
                None
            }
            Ok(Err(e)) => {
                warn!(%peer, error = %e, "Could not look up caller identity");
                metrics::record_whois("error");
                None
            }
            Err(_) => {
                warn!(%peer, timeout = ?self.timeout, "Timed out looking up caller identity");
                metrics::record_whois("timeout");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tailnet::MemoryTailnet;
    use std::time::Instant;

    fn peer() -> SocketAddr {
        "100.64.0.7:51000".parse().unwrap()
    }

    fn node_with_alice() -> Arc<MemoryTailnet> {
        let node = Arc::new(MemoryTailnet::default());
        node.add_identity(
            peer().ip(),
            Identity {
                login_name: "alice@example.com".to_string(),
                display_name: "Alice".to_string(),
                ..Default::default()
            },
        );
        node
    }

    #[tokio::test]
    async fn test_resolves_known_peer() {
        let node = node_with_alice();
        let resolver = IdentityResolver::new(node.clone(), Duration::from_secs(1), false);

        let identity = resolver.resolve(peer()).await.unwrap();
        assert_eq!(identity.display_name, "Alice");
        assert_eq!(node.whois_calls(), 1);
    }

    #[tokio::test]
    async fn test_suppressed_never_calls_node() {
        let node = node_with_alice();
        let resolver = IdentityResolver::new(node.clone(), Duration::from_secs(1), true);

        assert!(resolver.resolve(peer()).await.is_none());
        assert_eq!(node.whois_calls(), 0);
    }

    #[tokio::test]
    async fn test_unknown_peer_and_unavailable_yield_none() {
        let node = node_with_alice();
        let resolver = IdentityResolver::new(node.clone(), Duration::from_secs(1), false);

        assert!(resolver.resolve("203.0.113.9:443".parse().unwrap()).await.is_none());

        node.set_whois_unavailable(true);
        assert!(resolver.resolve(peer()).await.is_none());
    }

    #[tokio::test]
    async fn test_slow_lookup_is_bounded() {
        let node = node_with_alice();
        node.set_whois_delay(Duration::from_secs(10));
        let resolver = IdentityResolver::new(node.clone(), Duration::from_millis(100), false);

        let started = Instant::now();
        assert!(resolver.resolve(peer()).await.is_none());
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
