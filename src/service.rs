//! Running one configured service on a node.

use crate::config::ServiceConfig;
use crate::error::ServeError;
use crate::listener;
use crate::metrics::{self, MetricsServer};
use crate::proxy::ProxyServer;
use crate::tailnet::{ListenMode, Tailnet};
use std::future::pending;
use std::sync::Arc;
use tracing::{error, info};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Serve `config` on `node` until the service or metrics listener closes.
///
/// A metrics listener that cannot be bound is logged and skipped. One that
/// closes after binding stops the service with [`ServeError::Metrics`].
/// Failed accepts on either listener are logged and retried.
pub async fn run(config: ServiceConfig, node: Arc<dyn Tailnet>) -> Result<(), ServeError> {
    let (mode, listener) = listener::bind(node.as_ref(), &config).await?;
    let proxy = ProxyServer::new(Arc::clone(&node), &config, mode)?;

    let metrics_server = match &config.prometheus_addr {
        Some(addr) => bind_metrics(node.as_ref(), addr).await,
        None => None,
    };

    print_startup_banner(&config, mode);

    let metrics_task = async move {
        match metrics_server {
            Some(server) => server.run().await,
            None => pending().await,
        }
    };

    tokio::select! {
        result = proxy.run(listener) => result.map_err(ServeError::Serve),
        result = metrics_task => match result {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(error = %e, "Metrics listener failed");
                Err(ServeError::Metrics(e))
            }
        },
    }
}

async fn bind_metrics(node: &dyn Tailnet, addr: &str) -> Option<MetricsServer> {
    let Some(handle) = metrics::init() else {
        error!("Metrics recorder unavailable, not serving metrics");
        return None;
    };
    match node.listen(ListenMode::Plaintext, addr).await {
        Ok(listener) => Some(MetricsServer::new(listener, handle)),
        Err(e) => {
            error!(addr, error = %e, "Could not listen for metrics, continuing without them");
            None
        }
    }
}

fn print_startup_banner(config: &ServiceConfig, mode: ListenMode) {
    info!("========================================");
    info!("  {} v{}", PKG_NAME, VERSION);
    info!("========================================");
    info!(name = %config.name, listen = %config.listen_addr, ?mode, "Serving");
    info!(destination = %config.dest_url, downstream = ?config.downstream, "Proxying");
    if !config.prefixes.is_empty() {
        info!(prefixes = ?config.prefixes, strip = config.strip_prefix, "Allowed prefixes");
    }
    if config.suppress_whois {
        info!("Caller identity lookups are suppressed");
    }
    if let Some(addr) = &config.prometheus_addr {
        info!(addr = %addr, "Metrics endpoint");
    }
}
