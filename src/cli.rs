//! Command-line interface.
//!
//! Flags keep their single-dash spellings (`-name svc`, `-funnel`,
//! `-stripPrefix=false`). [`normalize_args`] rewrites them to the double-dash
//! form clap expects before parsing.

use crate::config::ServiceOptions;
use clap::{ArgAction, CommandFactory, Parser};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "tsnsrv",
    version,
    about = "Expose an HTTP service on a tailnet, optionally funneled to the internet"
)]
pub struct Args {
    /// Proxy to an HTTP service listening on this TCP address
    #[arg(long = "downstreamTCPAddr", value_name = "ADDR")]
    pub downstream_tcp_addr: Option<String>,

    /// Proxy to an HTTP service listening on this Unix domain socket path
    #[arg(long = "downstreamUnixAddr", value_name = "PATH")]
    pub downstream_unix_addr: Option<PathBuf>,

    /// Do not persist the node's state
    #[arg(long, num_args = 0..=1, require_equals = true, default_value = "false", default_missing_value = "true", action = ArgAction::Set)]
    pub ephemeral: bool,

    /// Serve to the public internet through Funnel
    #[arg(long, num_args = 0..=1, require_equals = true, default_value = "false", default_missing_value = "true", action = ArgAction::Set)]
    pub funnel: bool,

    /// Serve only on Funnel, not on the tailnet
    #[arg(long = "funnelOnly", num_args = 0..=1, require_equals = true, default_value = "false", default_missing_value = "true", action = ArgAction::Set)]
    pub funnel_only: bool,

    /// Address to listen on; only the port is used
    #[arg(long = "listenAddr", default_value = ":443", value_name = "ADDR")]
    pub listen_addr: String,

    /// Name of this service on the tailnet
    #[arg(long)]
    pub name: Option<String>,

    /// Set Host and X-Forwarded-* headers the way most applications expect
    #[arg(long = "recommendedProxyHeaders", num_args = 0..=1, require_equals = true, default_value = "true", default_missing_value = "true", action = ArgAction::Set)]
    pub recommended_proxy_headers: bool,

    /// Serve plain HTTP instead of HTTPS
    #[arg(long, num_args = 0..=1, require_equals = true, default_value = "false", default_missing_value = "true", action = ArgAction::Set)]
    pub plaintext: bool,

    /// Maximum time to wait for the node to come up
    #[arg(long, default_value = "1m", value_parser = parse_go_duration, value_name = "DURATION")]
    pub timeout: Duration,

    /// Allowed URL path prefix; repeat for several. Empty allows everything
    #[arg(long = "prefix", value_name = "PREFIX")]
    pub prefixes: Vec<String>,

    /// Strip the matched prefix before forwarding
    #[arg(long = "stripPrefix", num_args = 0..=1, require_equals = true, default_value = "true", default_missing_value = "true", action = ArgAction::Set)]
    pub strip_prefix: bool,

    /// Directory holding the node's state
    #[arg(long = "stateDir", value_name = "DIR")]
    pub state_dir: Option<PathBuf>,

    /// File containing the auth key used to join the tailnet
    #[arg(long = "authkeyPath", value_name = "PATH")]
    pub authkey_path: Option<PathBuf>,

    /// Do not verify the downstream's TLS certificate
    #[arg(long = "insecureHTTPS", num_args = 0..=1, require_equals = true, default_value = "false", default_missing_value = "true", action = ArgAction::Set)]
    pub insecure_https: bool,

    /// Maximum time to spend looking up a caller's identity
    #[arg(long = "whoisTimeout", default_value = "1s", value_parser = parse_go_duration, value_name = "DURATION")]
    pub whois_timeout: Duration,

    /// Do not look up callers' identities
    #[arg(long = "suppressWhois", num_args = 0..=1, require_equals = true, default_value = "false", default_missing_value = "true", action = ArgAction::Set)]
    pub suppress_whois: bool,

    /// Serve Prometheus metrics on this tailnet address; empty disables
    #[arg(long = "prometheusAddr", default_value = ":9099", value_name = "ADDR")]
    pub prometheus_addr: String,

    /// tailscaled binary to run
    #[arg(long = "tailscaledPath", default_value = "tailscaled", value_name = "PATH")]
    pub tailscaled_path: PathBuf,

    /// tailscale CLI used to bring the node up
    #[arg(long = "tailscalePath", default_value = "tailscale", value_name = "PATH")]
    pub tailscale_path: PathBuf,

    /// URL of the service to proxy to
    #[arg(value_name = "DESTINATION_URL")]
    pub destinations: Vec<String>,
}

impl Args {
    /// Parse the process arguments, exiting with usage on error.
    pub fn from_env() -> Self {
        Self::parse_from(normalize_args(std::env::args()))
    }

    /// Raw options, with the control URL taken from `TS_URL`.
    pub fn into_options(self) -> ServiceOptions {
        ServiceOptions {
            downstream_tcp_addr: self.downstream_tcp_addr,
            downstream_unix_addr: self.downstream_unix_addr,
            ephemeral: self.ephemeral,
            funnel: self.funnel,
            funnel_only: self.funnel_only,
            listen_addr: self.listen_addr,
            name: self.name,
            recommended_proxy_headers: self.recommended_proxy_headers,
            plaintext: self.plaintext,
            timeout: self.timeout,
            prefixes: self.prefixes,
            strip_prefix: self.strip_prefix,
            state_dir: self.state_dir,
            authkey_path: self.authkey_path,
            insecure_https: self.insecure_https,
            whois_timeout: self.whois_timeout,
            suppress_whois: self.suppress_whois,
            prometheus_addr: self.prometheus_addr,
            control_url: std::env::var("TS_URL").ok(),
            tailscaled_path: self.tailscaled_path,
            tailscale_path: self.tailscale_path,
            destinations: self.destinations,
        }
    }
}

/// Rendered `--help` text.
pub fn usage() -> String {
    Args::command().render_help().to_string()
}

/// Rewrite single-dash long flags (`-name`) to `--name`. `-h` stays a short
/// flag, and nothing after a bare `--` is touched.
pub fn normalize_args<I, S>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut out = Vec::new();
    let mut flags_done = false;

    for (i, arg) in args.into_iter().map(Into::into).enumerate() {
        if i == 0 || flags_done {
            out.push(arg);
            continue;
        }
        if arg == "--" {
            flags_done = true;
            out.push(arg);
            continue;
        }

        let is_single_dash_long = arg.len() > 2
            && arg.starts_with('-')
            && !arg.starts_with("--")
            && arg[1..].starts_with(|c: char| c.is_ascii_alphabetic());
        if is_single_dash_long {
            out.push(format!("-{}", arg));
        } else {
            out.push(arg);
        }
    }
    out
}

/// Parse a Go-style duration such as `1m30s`, `500ms` or `1.5h`.
pub fn parse_go_duration(s: &str) -> Result<Duration, String> {
    let input = s.trim();
    if input == "0" {
        return Ok(Duration::ZERO);
    }
    if input.is_empty() {
        return Err("empty duration".to_string());
    }

    let mut rest = input;
    let mut nanos = 0f64;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if num_len == 0 {
            return Err(format!("invalid duration {:?}", s));
        }
        let value: f64 = rest[..num_len]
            .parse()
            .map_err(|_| format!("invalid duration {:?}", s))?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let per_unit = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            "" => return Err(format!("missing unit in duration {:?}", s)),
            unit => return Err(format!("unknown unit {:?} in duration {:?}", unit, s)),
        };
        nanos += value * per_unit;
        rest = &rest[unit_len..];
    }

    Ok(Duration::from_nanos(nanos.round() as u64))
}
