//! Choosing and binding the service's listener.

use crate::config::{Exposure, ServiceConfig, TlsMode};
use crate::error::StartupError;
use crate::tailnet::{self, BoxedStream, ListenMode, Tailnet, TailnetListener};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{error, info};

/// First pause after a failed accept; doubles up to [`MAX_ACCEPT_BACKOFF`].
const INITIAL_ACCEPT_BACKOFF: Duration = Duration::from_millis(5);
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

impl ListenMode {
    /// The mode a validated configuration asks for. Funnel always terminates
    /// TLS, so the plaintext setting only matters on the tailnet.
    pub fn select(config: &ServiceConfig) -> ListenMode {
        match (config.exposure, config.tls) {
            (Exposure::Funnel, _) => ListenMode::Funnel { funnel_only: false },
            (Exposure::FunnelOnly, _) => ListenMode::Funnel { funnel_only: true },
            (Exposure::Tailnet, TlsMode::Terminated) => ListenMode::Tls,
            (Exposure::Tailnet, TlsMode::Plaintext) => ListenMode::Plaintext,
        }
    }
}

/// Bind the single service listener. Failing here is fatal.
pub async fn bind(
    node: &dyn Tailnet,
    config: &ServiceConfig,
) -> Result<(ListenMode, Box<dyn TailnetListener>), StartupError> {
    let mode = ListenMode::select(config);
    let listener = node
        .listen(mode, &config.listen_addr)
        .await
        .map_err(|source| StartupError::Listen {
            addr: config.listen_addr.clone(),
            source,
        })?;

    info!(addr = %config.listen_addr, ?mode, "Listener bound");
    Ok((mode, listener))
}

/// Accept the next connection, logging and retrying failed accepts with a
/// growing pause. Only returns an error once the listener is closed.
pub async fn accept_next(listener: &mut dyn TailnetListener) -> io::Result<(BoxedStream, SocketAddr)> {
    let mut backoff = INITIAL_ACCEPT_BACKOFF;
    loop {
        match listener.accept().await {
            Ok(accepted) => return Ok(accepted),
            Err(e) if tailnet::is_listener_closed(&e) => return Err(e),
            Err(e) => {
                error!(error = %e, retry_in = ?backoff, "Failed to accept connection");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_ACCEPT_BACKOFF);
            }
        }
    }
}
