use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::tailnet::listen_port;

/// Ports the Funnel relay will forward to.
pub const FUNNEL_PORTS: [u16; 3] = [443, 8443, 10000];

/// Options as given on the command line, before validation.
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    /// Proxy to an HTTP service listening on this TCP address
    pub downstream_tcp_addr: Option<String>,
    /// Proxy to an HTTP service listening on this Unix socket
    pub downstream_unix_addr: Option<PathBuf>,
    pub ephemeral: bool,
    pub funnel: bool,
    pub funnel_only: bool,
    pub listen_addr: String,
    pub name: Option<String>,
    pub recommended_proxy_headers: bool,
    pub plaintext: bool,
    /// Bound on connecting to the tailnet
    pub timeout: Duration,
    pub prefixes: Vec<String>,
    pub strip_prefix: bool,
    pub state_dir: Option<PathBuf>,
    pub authkey_path: Option<PathBuf>,
    pub insecure_https: bool,
    pub whois_timeout: Duration,
    pub suppress_whois: bool,
    /// Empty disables the metrics listener
    pub prometheus_addr: String,
    /// Control server override (from `TS_URL`)
    pub control_url: Option<String>,
    pub tailscaled_path: PathBuf,
    pub tailscale_path: PathBuf,
    /// Positional arguments; exactly one destination URL is expected
    pub destinations: Vec<String>,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            downstream_tcp_addr: None,
            downstream_unix_addr: None,
            ephemeral: false,
            funnel: false,
            funnel_only: false,
            listen_addr: default_listen_addr(),
            name: None,
            recommended_proxy_headers: true,
            plaintext: false,
            timeout: default_timeout(),
            prefixes: Vec::new(),
            strip_prefix: true,
            state_dir: None,
            authkey_path: None,
            insecure_https: false,
            whois_timeout: default_whois_timeout(),
            suppress_whois: false,
            prometheus_addr: default_prometheus_addr(),
            control_url: None,
            tailscaled_path: PathBuf::from("tailscaled"),
            tailscale_path: PathBuf::from("tailscale"),
            destinations: Vec::new(),
        }
    }
}

/// Who can reach the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exposure {
    Tailnet,
    /// Tailnet and the public internet
    Funnel,
    /// Public internet only
    FunnelOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    Terminated,
    Plaintext,
}

/// Where proxied connections are dialed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Downstream {
    /// Dial the destination URL's host over the tailnet
    Tailnet,
    /// Dial this fixed address over the tailnet, whatever the URL says
    Tcp(String),
    /// Dial this local Unix socket
    Unix(PathBuf),
}

/// Settings for bringing up the node the service runs as.
#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub hostname: String,
    pub ephemeral: bool,
    pub state_dir: Option<PathBuf>,
    pub authkey_path: Option<PathBuf>,
    pub control_url: Option<String>,
    pub connect_timeout: Duration,
    pub tailscaled_path: PathBuf,
    pub tailscale_path: PathBuf,
}

/// Validated service configuration. Immutable for the life of the process.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub name: String,
    pub exposure: Exposure,
    pub tls: TlsMode,
    pub downstream: Downstream,
    pub listen_addr: String,
    pub listen_port: u16,
    pub prefixes: Vec<String>,
    pub strip_prefix: bool,
    pub whois_timeout: Duration,
    pub suppress_whois: bool,
    pub insecure_https: bool,
    pub recommended_proxy_headers: bool,
    pub dest_url: Url,
    pub prometheus_addr: Option<String>,
    pub node: NodeOptions,
}

/// A single configuration problem.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Violation {
    #[error("tsnsrv needs a -name")]
    MissingName,
    #[error("can not serve plaintext on a funnel service")]
    PlaintextFunnel,
    #[error("can only proxy to one address at a time, pass either -downstreamUnixAddr or -downstreamTCPAddr")]
    ConflictingDownstreams,
    #[error("-funnel is required if -funnelOnly is set")]
    FunnelOnlyWithoutFunnel,
    #[error("tsnsrv requires a destination URL")]
    MissingDestination,
    #[error("tsnsrv takes exactly one destination URL, got {0}")]
    ExtraDestinations(usize),
    #[error("invalid destination URL {url:?}: {reason}")]
    InvalidDestination { url: String, reason: String },
    #[error("invalid listen address {0:?}: expected [host]:port")]
    InvalidListenAddr(String),
    #[error("funnel can only listen on ports 443, 8443 or 10000, not {0}")]
    FunnelPort(u16),
}

/// Every problem found while validating, reported together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violations(pub Vec<Violation>);

impl Violations {
    pub fn contains(&self, violation: &Violation) -> bool {
        self.0.contains(violation)
    }
}

impl fmt::Display for Violations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, violation) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", violation)?;
        }
        Ok(())
    }
}

impl std::error::Error for Violations {}

fn non_empty<T: AsRef<std::ffi::OsStr>>(value: Option<T>) -> Option<T> {
    value.filter(|v| !v.as_ref().is_empty())
}

impl ServiceOptions {
    /// Check the options, collecting every violation rather than stopping at
    /// the first one.
    pub fn validate(self) -> Result<ServiceConfig, Violations> {
        let mut errors = Vec::new();

        let name = non_empty(self.name);
        if name.is_none() {
            errors.push(Violation::MissingName);
        }
        if self.plaintext && self.funnel {
            errors.push(Violation::PlaintextFunnel);
        }

        let tcp = non_empty(self.downstream_tcp_addr);
        let unix = non_empty(self.downstream_unix_addr);
        if tcp.is_some() && unix.is_some() {
            errors.push(Violation::ConflictingDownstreams);
        }
        if self.funnel_only && !self.funnel {
            errors.push(Violation::FunnelOnlyWithoutFunnel);
        }

        let port = listen_port(&self.listen_addr);
        match port {
            None => errors.push(Violation::InvalidListenAddr(self.listen_addr.clone())),
            Some(port) if self.funnel && !FUNNEL_PORTS.contains(&port) => {
                errors.push(Violation::FunnelPort(port));
            }
            Some(_) => {}
        }

        let dest_url = match self.destinations.as_slice() {
            [] => {
                errors.push(Violation::MissingDestination);
                None
            }
            [dest] => match parse_destination(dest) {
                Ok(url) => Some(url),
                Err(reason) => {
                    errors.push(Violation::InvalidDestination {
                        url: dest.clone(),
                        reason,
                    });
                    None
                }
            },
            many => {
                errors.push(Violation::ExtraDestinations(many.len()));
                None
            }
        };

        let (Some(name), Some(listen_port), Some(dest_url)) = (name, port, dest_url) else {
            return Err(Violations(errors));
        };
        if !errors.is_empty() {
            return Err(Violations(errors));
        }

        let exposure = match (self.funnel, self.funnel_only) {
            (true, true) => Exposure::FunnelOnly,
            (true, false) => Exposure::Funnel,
            (false, _) => Exposure::Tailnet,
        };
        let downstream = match (tcp, unix) {
            (Some(addr), _) => Downstream::Tcp(addr),
            (None, Some(path)) => Downstream::Unix(path),
            (None, None) => Downstream::Tailnet,
        };

        Ok(ServiceConfig {
            node: NodeOptions {
                hostname: name.clone(),
                ephemeral: self.ephemeral,
                state_dir: non_empty(self.state_dir),
                authkey_path: non_empty(self.authkey_path),
                control_url: non_empty(self.control_url),
                connect_timeout: self.timeout,
                tailscaled_path: self.tailscaled_path,
                tailscale_path: self.tailscale_path,
            },
            name,
            exposure,
            tls: if self.plaintext {
                TlsMode::Plaintext
            } else {
                TlsMode::Terminated
            },
            downstream,
            listen_addr: self.listen_addr,
            listen_port,
            prefixes: self.prefixes,
            strip_prefix: self.strip_prefix,
            whois_timeout: self.whois_timeout,
            suppress_whois: self.suppress_whois,
            insecure_https: self.insecure_https,
            recommended_proxy_headers: self.recommended_proxy_headers,
            dest_url,
            prometheus_addr: non_empty(Some(self.prometheus_addr)),
        })
    }
}

fn parse_destination(dest: &str) -> Result<Url, String> {
    let url = Url::parse(dest).map_err(|e| e.to_string())?;
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(format!("unsupported scheme {:?}, use http or https", other)),
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err("missing host".to_string());
    }
    Ok(url)
}

// Default value functions
fn default_listen_addr() -> String {
    ":443".to_string()
}

fn default_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_whois_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_prometheus_addr() -> String {
    ":9099".to_string()
}
