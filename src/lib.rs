//! tsnsrv - expose a local HTTP service on a tailnet
//!
//! This library provides a single-destination reverse proxy that:
//! - Runs as its own named node on a tailnet (or publicly via Funnel)
//! - Listens with TLS terminated by the node, plaintext, or through Funnel
//! - Authorizes request paths against an ordered allow-list of prefixes
//! - Looks up the calling peer's identity with a bounded whois
//! - Forwards to a downstream over the tailnet, a fixed TCP address, or a Unix socket
//! - Serves Prometheus metrics on a separate tailnet listener

pub mod cli;
pub mod config;
pub mod error;
pub mod forward;
pub mod headers;
pub mod listener;
pub mod metrics;
pub mod proxy;
pub mod router;
pub mod service;
pub mod tailnet;
pub mod whois;

pub use config::{ServiceConfig, ServiceOptions};
pub use tailnet::Tailnet;
