//! Outbound header rewriting.
//!
//! Proxy headers are always overwritten, never appended. Nothing the caller
//! sends under an `X-Tailscale-` name reaches the downstream.

use crate::config::ServiceConfig;
use crate::tailnet::{Identity, ListenMode};
use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION,
    TE, TRAILER, TRANSFER_ENCODING, UPGRADE,
};
use hyper::Request;
use std::net::SocketAddr;
use tracing::debug;

const IDENTITY_HEADER_PREFIX: &str = "x-tailscale-";

const X_SCHEME: &str = "x-scheme";
const X_REAL_IP: &str = "x-real-ip";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const X_FORWARDED_SERVER: &str = "x-forwarded-server";
const X_FORWARDED_PORT: &str = "x-forwarded-port";

/// Caller-supplied proxy headers dropped before our own are set.
const FORWARDING_HEADERS: [&str; 7] = [
    X_SCHEME,
    X_REAL_IP,
    X_FORWARDED_FOR,
    X_FORWARDED_HOST,
    X_FORWARDED_PROTO,
    X_FORWARDED_SERVER,
    X_FORWARDED_PORT,
];

/// Rewrites inbound request headers for the downstream.
#[derive(Debug, Clone)]
pub struct HeaderInjector {
    scheme: &'static str,
    listen_port: u16,
    recommended: bool,
    dest_authority: String,
}

impl HeaderInjector {
    pub fn new(mode: ListenMode, config: &ServiceConfig) -> Self {
        let dest_authority = match (config.dest_url.host_str(), config.dest_url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => String::new(),
        };
        Self {
            scheme: mode.scheme(),
            listen_port: config.listen_port,
            recommended: config.recommended_proxy_headers,
            dest_authority,
        }
    }

    /// Apply every rewrite to `req`. Identity headers are only set when
    /// `identity` is known.
    pub fn apply<B>(&self, req: &mut Request<B>, peer: SocketAddr, identity: Option<&Identity>) {
        let inbound_host = req
            .headers()
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string)
            .or_else(|| req.uri().authority().map(|a| a.to_string()));

        let headers = req.headers_mut();
        strip_hop_by_hop(headers);
        strip_identity_headers(headers);
        for name in FORWARDING_HEADERS {
            headers.remove(name);
        }

        if self.recommended {
            self.set_forwarding_headers(headers, peer, inbound_host.as_deref());
        } else if let Ok(value) = HeaderValue::from_str(&self.dest_authority) {
            headers.insert(HOST, value);
        }

        if let Some(identity) = identity {
            set_identity_headers(headers, identity);
        }
    }

    fn set_forwarding_headers(&self, headers: &mut HeaderMap, peer: SocketAddr, host: Option<&str>) {
        let scheme = HeaderValue::from_static(self.scheme);
        headers.insert(X_SCHEME, scheme.clone());
        headers.insert(X_FORWARDED_PROTO, scheme);

        let ip = peer.ip().to_string();
        if let Ok(value) = HeaderValue::from_str(&ip) {
            headers.insert(X_REAL_IP, value.clone());
            headers.insert(X_FORWARDED_FOR, value);
        }
        headers.insert(X_FORWARDED_PORT, HeaderValue::from(self.listen_port));

        if let Some(host) = host {
            if let Ok(value) = HeaderValue::from_str(host) {
                headers.insert(HOST, value.clone());
                headers.insert(X_FORWARDED_HOST, value);
            }
            if let Ok(value) = HeaderValue::from_str(host_without_port(host)) {
                headers.insert(X_FORWARDED_SERVER, value);
            }
        }
    }
}

/// Whether the request asks to switch protocols.
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    connection_upgrade && headers.contains_key(UPGRADE)
}

/// Remove connection-scoped headers. An upgrade request keeps its
/// `Connection: upgrade` and `Upgrade` pair.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let upgrade = if is_upgrade_request(headers) {
        headers.get(UPGRADE).cloned()
    } else {
        None
    };

    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }

    for name in [CONNECTION, TE, TRAILER, TRANSFER_ENCODING, UPGRADE, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION] {
        headers.remove(name);
    }
    headers.remove("keep-alive");
    headers.remove("proxy-connection");

    if let Some(upgrade) = upgrade {
        headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
        headers.insert(UPGRADE, upgrade);
    }
}

fn strip_identity_headers(headers: &mut HeaderMap) {
    let spoofed: Vec<HeaderName> = headers
        .keys()
        .filter(|name| name.as_str().starts_with(IDENTITY_HEADER_PREFIX))
        .cloned()
        .collect();
    for name in spoofed {
        debug!(header = %name, "Dropping caller-supplied identity header");
        headers.remove(name);
    }
}

fn set_identity_headers(headers: &mut HeaderMap, identity: &Identity) {
    let values = [
        ("x-tailscale-user", identity.user_id.clone()),
        ("x-tailscale-user-loginname", identity.login_name.clone()),
        ("x-tailscale-user-loginname-localpart", identity.login_localpart().to_string()),
        ("x-tailscale-user-loginname-domain", identity.login_domain().to_string()),
        ("x-tailscale-user-displayname", identity.display_name.clone()),
        ("x-tailscale-user-profilepicurl", identity.profile_pic_url.clone()),
        ("x-tailscale-caps", identity.caps.join(", ")),
        ("x-tailscale-node", identity.node_id.clone()),
        ("x-tailscale-node-name", identity.node_name.clone()),
        ("x-tailscale-node-caps", identity.node_caps.join(", ")),
        ("x-tailscale-node-tags", identity.node_tags.join(", ")),
    ];

    for (name, value) in values {
        match HeaderValue::from_str(&value) {
            Ok(value) => {
                headers.insert(name, value);
            }
            Err(_) => debug!(header = name, "Identity value is not a valid header value"),
        }
    }
}

fn host_without_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceOptions;

    fn config(recommended: bool) -> ServiceConfig {
        ServiceOptions {
            name: Some("svc".to_string()),
            destinations: vec!["http://127.0.0.1:3000/base".to_string()],
            recommended_proxy_headers: recommended,
            ..Default::default()
        }
        .validate()
        .unwrap()
    }

    fn request(headers: &[(&str, &str)]) -> Request<()> {
        let mut builder = Request::builder().uri("/path");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap()
    }

    fn peer() -> SocketAddr {
        "100.64.0.7:51000".parse().unwrap()
    }

    fn alice() -> Identity {
        Identity {
            user_id: "678".to_string(),
            login_name: "alice@example.com".to_string(),
            display_name: "Alice".to_string(),
            profile_pic_url: "https://example.com/alice.png".to_string(),
            caps: vec!["cap/a".to_string(), "cap/b".to_string()],
            node_id: "12345".to_string(),
            node_name: "laptop".to_string(),
            node_caps: vec![],
            node_tags: vec!["tag:dev".to_string()],
        }
    }

    #[test]
    fn test_recommended_headers_tls() {
        let injector = HeaderInjector::new(ListenMode::Tls, &config(true));
        let mut req = request(&[("host", "svc.tail1234.ts.net")]);
        injector.apply(&mut req, peer(), None);

        let h = req.headers();
        assert_eq!(h["host"], "svc.tail1234.ts.net");
        assert_eq!(h["x-scheme"], "https");
        assert_eq!(h["x-forwarded-proto"], "https");
        assert_eq!(h["x-real-ip"], "100.64.0.7");
        assert_eq!(h["x-forwarded-for"], "100.64.0.7");
        assert_eq!(h["x-forwarded-host"], "svc.tail1234.ts.net");
        assert_eq!(h["x-forwarded-server"], "svc.tail1234.ts.net");
        assert_eq!(h["x-forwarded-port"], "443");
    }

    #[test]
    fn test_recommended_headers_plaintext() {
        let injector = HeaderInjector::new(ListenMode::Plaintext, &config(true));
        let mut req = request(&[("host", "svc:8080")]);
        injector.apply(&mut req, peer(), None);

        assert_eq!(req.headers()["x-forwarded-proto"], "http");
        assert_eq!(req.headers()["x-forwarded-server"], "svc");
        assert_eq!(req.headers()["x-forwarded-host"], "svc:8080");
    }

    #[test]
    fn test_without_recommended_headers_host_is_destination() {
        let injector = HeaderInjector::new(ListenMode::Tls, &config(false));
        let mut req = request(&[("host", "svc.tail1234.ts.net")]);
        injector.apply(&mut req, peer(), None);

        assert_eq!(req.headers()["host"], "127.0.0.1:3000");
        assert!(req.headers().get("x-forwarded-proto").is_none());
        assert!(req.headers().get("x-real-ip").is_none());
    }

    #[test]
    fn test_spoofed_headers_are_replaced() {
        let injector = HeaderInjector::new(ListenMode::Tls, &config(true));
        let mut req = request(&[
            ("host", "svc"),
            ("x-forwarded-for", "1.2.3.4"),
            ("x-real-ip", "1.2.3.4"),
            ("X-Tailscale-User-LoginName", "admin@example.com"),
            ("x-tailscale-anything", "x"),
        ]);
        injector.apply(&mut req, peer(), None);

        let h = req.headers();
        assert_eq!(h["x-forwarded-for"], "100.64.0.7");
        assert_eq!(h["x-real-ip"], "100.64.0.7");
        assert!(h.keys().all(|name| !name.as_str().starts_with("x-tailscale-")));
    }

    #[test]
    fn test_identity_headers() {
        let injector = HeaderInjector::new(ListenMode::Tls, &config(true));
        let mut req = request(&[("host", "svc"), ("x-tailscale-user-loginname", "mallory@evil")]);
        injector.apply(&mut req, peer(), Some(&alice()));

        let h = req.headers();
        assert_eq!(h["x-tailscale-user"], "678");
        assert_eq!(h["x-tailscale-user-loginname"], "alice@example.com");
        assert_eq!(h["x-tailscale-user-loginname-localpart"], "alice");
        assert_eq!(h["x-tailscale-user-loginname-domain"], "example.com");
        assert_eq!(h["x-tailscale-user-displayname"], "Alice");
        assert_eq!(h["x-tailscale-user-profilepicurl"], "https://example.com/alice.png");
        assert_eq!(h["x-tailscale-caps"], "cap/a, cap/b");
        assert_eq!(h["x-tailscale-node-name"], "laptop");
        assert_eq!(h["x-tailscale-node-tags"], "tag:dev");
        assert_eq!(h.get_all("x-tailscale-user-loginname").iter().count(), 1);
    }

    #[test]
    fn test_hop_by_hop_headers_removed() {
        let mut req = request(&[
            ("connection", "keep-alive, x-custom-hop"),
            ("keep-alive", "timeout=5"),
            ("x-custom-hop", "1"),
            ("te", "gzip"),
            ("accept", "text/html"),
        ]);
        strip_hop_by_hop(req.headers_mut());

        let h = req.headers();
        assert!(h.get("connection").is_none());
        assert!(h.get("keep-alive").is_none());
        assert!(h.get("x-custom-hop").is_none());
        assert!(h.get("te").is_none());
        assert_eq!(h["accept"], "text/html");
    }

    #[test]
    fn test_upgrade_headers_survive() {
        let mut req = request(&[("connection", "Upgrade"), ("upgrade", "websocket")]);
        assert!(is_upgrade_request(req.headers()));
        strip_hop_by_hop(req.headers_mut());

        assert_eq!(req.headers()["connection"], "upgrade");
        assert_eq!(req.headers()["upgrade"], "websocket");
    }

    #[test]
    fn test_host_without_port() {
        assert_eq!(host_without_port("svc.ts.net:443"), "svc.ts.net");
        assert_eq!(host_without_port("svc.ts.net"), "svc.ts.net");
        assert_eq!(host_without_port("[fd7a::1]:443"), "fd7a::1");
    }
}
