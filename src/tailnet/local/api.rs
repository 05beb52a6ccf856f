//! Client for tailscaled's LocalAPI, spoken over its Unix socket.

use crate::tailnet::Identity;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{CONNECTION, CONTENT_TYPE, HOST, UPGRADE};
use hyper::upgrade::Upgraded;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use tokio::net::UnixStream;
use tracing::debug;

/// Host header tailscaled expects on LocalAPI requests.
const LOCALAPI_HOST: &str = "local-tailscaled.sock";

#[derive(Debug, thiserror::Error)]
pub enum LocalApiError {
    #[error("could not connect to tailscaled at {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("LocalAPI transport error: {0}")]
    Http(#[from] hyper::Error),
    #[error("invalid LocalAPI request: {0}")]
    Request(#[from] hyper::http::Error),
    #[error("LocalAPI returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("invalid LocalAPI response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl LocalApiError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            LocalApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// `ipnstate.Status`, reduced to the fields we read.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Status {
    #[serde(default)]
    pub backend_state: String,
    #[serde(rename = "Self", default)]
    pub self_node: Option<PeerStatus>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PeerStatus {
    #[serde(rename = "DNSName", default)]
    pub dns_name: String,
    #[serde(rename = "TailscaleIPs", default)]
    pub tailscale_ips: Option<Vec<IpAddr>>,
}

/// `apitype.WhoIsResponse`, reduced to the fields we forward.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WhoIsResponse {
    #[serde(default)]
    pub node: Option<WhoIsNode>,
    #[serde(default)]
    pub user_profile: Option<UserProfile>,
    #[serde(default)]
    pub cap_map: Option<HashMap<String, Value>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WhoIsNode {
    #[serde(rename = "ID", default)]
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub computed_name: String,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub capabilities: Option<Vec<String>>,
    #[serde(default)]
    pub cap_map: Option<HashMap<String, Value>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UserProfile {
    #[serde(rename = "ID", default)]
    pub id: i64,
    #[serde(default)]
    pub login_name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(rename = "ProfilePicURL", default)]
    pub profile_pic_url: String,
}

fn cap_names(
    list: Option<Vec<String>>,
    map: Option<HashMap<String, Value>>,
) -> Vec<String> {
    let mut caps = list.unwrap_or_default();
    caps.extend(map.unwrap_or_default().into_keys());
    caps.sort();
    caps.dedup();
    caps
}

impl From<WhoIsResponse> for Identity {
    fn from(who: WhoIsResponse) -> Self {
        let user = who.user_profile.unwrap_or_default();
        let node = who.node.unwrap_or_default();
        let node_name = if node.computed_name.is_empty() {
            node.name.trim_end_matches('.').to_string()
        } else {
            node.computed_name
        };

        Identity {
            user_id: user.id.to_string(),
            login_name: user.login_name,
            display_name: user.display_name,
            profile_pic_url: user.profile_pic_url,
            caps: cap_names(None, who.cap_map),
            node_id: node.id.to_string(),
            node_name,
            node_caps: cap_names(node.capabilities, node.cap_map),
            node_tags: node.tags.unwrap_or_default(),
        }
    }
}

/// `ipn.ServeConfig`. Only TCP forwarding and Funnel are managed here; every
/// other field is carried through unchanged. Ports are kept as their JSON
/// string keys since flattened structs can't decode integer map keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServeConfig {
    #[serde(rename = "TCP", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tcp: BTreeMap<String, TcpPortHandler>,
    #[serde(rename = "AllowFunnel", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub allow_funnel: BTreeMap<String, bool>,
    #[serde(flatten)]
    pub other: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TcpPortHandler {
    #[serde(rename = "HTTPS", default, skip_serializing_if = "is_false")]
    pub https: bool,
    #[serde(rename = "HTTP", default, skip_serializing_if = "is_false")]
    pub http: bool,
    #[serde(rename = "TCPForward", default, skip_serializing_if = "String::is_empty")]
    pub tcp_forward: String,
    #[serde(rename = "TerminateTLS", default, skip_serializing_if = "String::is_empty")]
    pub terminate_tls: String,
    #[serde(rename = "ProxyProtocol", default, skip_serializing_if = "is_zero")]
    pub proxy_protocol: u8,
}

fn is_false(b: &bool) -> bool {
    !*b
}

fn is_zero(v: &u8) -> bool {
    *v == 0
}

/// A LocalAPI client. Each call opens a fresh connection to the socket.
#[derive(Debug, Clone)]
pub struct LocalClient {
    socket: PathBuf,
}

impl LocalClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    async fn send(&self, req: Request<Full<Bytes>>) -> Result<Response<Incoming>, LocalApiError> {
        let stream = UnixStream::connect(&self.socket)
            .await
            .map_err(|source| LocalApiError::Connect {
                path: self.socket.clone(),
                source,
            })?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!(error = %e, "LocalAPI connection closed with error");
            }
        });

        Ok(sender.send_request(req).await?)
    }

    fn request(method: Method, path: &str) -> hyper::http::request::Builder {
        Request::builder()
            .method(method)
            .uri(path)
            .header(HOST, LOCALAPI_HOST)
            .header("Sec-Tailscale", "localapi")
    }

    async fn read_body(response: Response<Incoming>) -> Result<Bytes, LocalApiError> {
        let status = response.status();
        let body = response.into_body().collect().await?.to_bytes();
        if !status.is_success() {
            return Err(LocalApiError::Status {
                status,
                body: String::from_utf8_lossy(&body).trim().to_string(),
            });
        }
        Ok(body)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, LocalApiError> {
        let req = Self::request(Method::GET, path).body(Full::new(Bytes::new()))?;
        let body = Self::read_body(self.send(req).await?).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn post_json<B: Serialize>(&self, path: &str, value: &B) -> Result<(), LocalApiError> {
        let body = serde_json::to_vec(value)?;
        let req = Self::request(Method::POST, path)
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)))?;
        Self::read_body(self.send(req).await?).await?;
        Ok(())
    }

    pub async fn status(&self) -> Result<Status, LocalApiError> {
        self.get_json("/localapi/v0/status").await
    }

    pub async fn whois(&self, addr: SocketAddr) -> Result<WhoIsResponse, LocalApiError> {
        let addr: String = url::form_urlencoded::byte_serialize(addr.to_string().as_bytes()).collect();
        self.get_json(&format!("/localapi/v0/whois?addr={}", addr)).await
    }

    pub async fn serve_config(&self) -> Result<ServeConfig, LocalApiError> {
        let config: Option<ServeConfig> = self.get_json("/localapi/v0/serve-config").await?;
        Ok(config.unwrap_or_default())
    }

    pub async fn set_serve_config(&self, config: &ServeConfig) -> Result<(), LocalApiError> {
        self.post_json("/localapi/v0/serve-config", config).await
    }

    /// Open a TCP connection through the node's network stack.
    pub async fn dial(&self, host: &str, port: u16) -> Result<TokioIo<Upgraded>, LocalApiError> {
        let req = Self::request(Method::POST, "/localapi/v0/dial")
            .header(CONNECTION, "upgrade")
            .header(UPGRADE, "ts-dial")
            .header("Dial-Host", host)
            .header("Dial-Port", port.to_string())
            .header("Dial-Network", "tcp")
            .body(Full::new(Bytes::new()))?;

        let response = self.send(req).await?;
        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            Self::read_body(response).await?;
            return Err(LocalApiError::Status {
                status: StatusCode::BAD_GATEWAY,
                body: format!("dial {}:{} was not upgraded", host, port),
            });
        }

        let upgraded = hyper::upgrade::on(response).await?;
        Ok(TokioIo::new(upgraded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whois_response_to_identity() {
        let json = r#"{
            "Node": {
                "ID": 12345,
                "StableID": "nStable",
                "Name": "laptop.tail1234.ts.net.",
                "ComputedName": "laptop",
                "Tags": ["tag:dev"],
                "CapMap": {"https://tailscale.com/cap/funnel": null}
            },
            "UserProfile": {
                "ID": 678,
                "LoginName": "alice@example.com",
                "DisplayName": "Alice",
                "ProfilePicURL": "https://example.com/alice.png"
            },
            "CapMap": {"example.com/cap/admin": [{}]}
        }"#;

        let who: WhoIsResponse = serde_json::from_str(json).unwrap();
        let identity = Identity::from(who);

        assert_eq!(identity.user_id, "678");
        assert_eq!(identity.login_name, "alice@example.com");
        assert_eq!(identity.display_name, "Alice");
        assert_eq!(identity.profile_pic_url, "https://example.com/alice.png");
        assert_eq!(identity.caps, vec!["example.com/cap/admin"]);
        assert_eq!(identity.node_id, "12345");
        assert_eq!(identity.node_name, "laptop");
        assert_eq!(identity.node_tags, vec!["tag:dev"]);
        assert_eq!(identity.node_caps, vec!["https://tailscale.com/cap/funnel"]);
    }

    #[test]
    fn test_whois_node_name_falls_back_to_fqdn() {
        let json = r#"{"Node": {"ID": 1, "Name": "box.tail1234.ts.net."}, "UserProfile": null}"#;
        let identity = Identity::from(serde_json::from_str::<WhoIsResponse>(json).unwrap());
        assert_eq!(identity.node_name, "box.tail1234.ts.net");
        assert_eq!(identity.login_name, "");
    }

    #[test]
    fn test_status_parsing() {
        let json = r#"{
            "BackendState": "Running",
            "Self": {"DNSName": "svc.tail1234.ts.net.", "TailscaleIPs": ["100.64.0.1", "fd7a:115c:a1e0::1"]},
            "CertDomains": ["svc.tail1234.ts.net"]
        }"#;
        let status: Status = serde_json::from_str(json).unwrap();
        assert_eq!(status.backend_state, "Running");
        let me = status.self_node.unwrap();
        assert_eq!(me.dns_name, "svc.tail1234.ts.net.");
        assert_eq!(me.tailscale_ips.unwrap().len(), 2);
    }

    #[test]
    fn test_serve_config_preserves_unknown_fields() {
        let json = r#"{
            "TCP": {"443": {"HTTPS": true}},
            "Web": {"svc.tail1234.ts.net:443": {"Handlers": {"/": {"Proxy": "http://127.0.0.1:3000"}}}}
        }"#;
        let mut config: ServeConfig = serde_json::from_str(json).unwrap();
        assert!(config.tcp["443"].https);

        config.tcp.insert(
            "8443".to_string(),
            TcpPortHandler {
                tcp_forward: "127.0.0.1:41000".to_string(),
                terminate_tls: "svc.tail1234.ts.net".to_string(),
                proxy_protocol: 1,
                ..Default::default()
            },
        );

        let out = serde_json::to_value(&config).unwrap();
        assert!(out.get("Web").is_some());
        assert_eq!(out["TCP"]["8443"]["TCPForward"], "127.0.0.1:41000");
        assert_eq!(out["TCP"]["8443"]["ProxyProtocol"], 1);
        assert!(out["TCP"]["8443"].get("HTTPS").is_none());
        assert!(out.get("AllowFunnel").is_none());
    }
}
