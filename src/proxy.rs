use crate::config::ServiceConfig;
use crate::error::{json_error_response, ProxyBody, ProxyErrorCode, StartupError};
use crate::forward::{ForwardError, Forwarder};
use crate::headers::{self, HeaderInjector};
use crate::listener::accept_next;
use crate::metrics;
use crate::router::{PrefixRouter, Route};
use crate::tailnet::{ListenMode, Tailnet, TailnetListener};
use crate::whois::IdentityResolver;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::upgrade::OnUpgrade;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

/// Per-request stages, shared by every connection.
struct Pipeline {
    router: PrefixRouter,
    resolver: IdentityResolver,
    injector: HeaderInjector,
    forwarder: Forwarder,
}

/// The reverse proxy serving one listener
pub struct ProxyServer {
    pipeline: Arc<Pipeline>,
    mode: ListenMode,
}

impl ProxyServer {
    pub fn new(node: Arc<dyn Tailnet>, config: &ServiceConfig, mode: ListenMode) -> Result<Self, StartupError> {
        if config.insecure_https {
            warn!("Not verifying the downstream's TLS certificate (-insecureHTTPS)");
        }
        let forwarder = Forwarder::new(
            Arc::clone(&node),
            config.downstream.clone(),
            config.dest_url.clone(),
            config.insecure_https,
        )?;

        Ok(Self {
            pipeline: Arc::new(Pipeline {
                router: PrefixRouter::new(config.prefixes.clone(), config.strip_prefix),
                resolver: IdentityResolver::new(node, config.whois_timeout, config.suppress_whois),
                injector: HeaderInjector::new(mode, config),
                forwarder,
            }),
            mode,
        })
    }

    /// Accept connections until the listener is closed. Failed accepts are
    /// logged and retried.
    pub async fn run(self, mut listener: Box<dyn TailnetListener>) -> io::Result<()> {
        let addr = listener.local_addr()?;
        info!(%addr, mode = ?self.mode, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        loop {
            let (stream, peer) = accept_next(listener.as_mut()).await?;
            let pipeline = Arc::clone(&self.pipeline);

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer, pipeline).await {
                    debug!(%peer, error = %e, "Connection error");
                }
            });
        }
    }
}

async fn handle_connection<S>(stream: S, peer: SocketAddr, pipeline: Arc<Pipeline>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let pipeline = Arc::clone(&pipeline);
        async move { handle_request(req, peer, pipeline).await }
    });

    // HTTP/1.1 connections can still use WebSocket upgrades
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    peer: SocketAddr,
    pipeline: Arc<Pipeline>,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let started = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = match pipeline.router.route(&path) {
        Route::Reject => {
            metrics::record_forbidden();
            debug!(%peer, %method, path = %path, "Path is outside the allowed prefixes");
            json_error_response(
                ProxyErrorCode::Forbidden,
                format!("{} is not an allowed path", path),
            )
        }
        Route::Forward(routed) => pipeline.proxy(req, peer, &routed).await,
    };

    let status = response.status().as_u16();
    metrics::record_request(status, started.elapsed());
    debug!(%peer, %method, path = %path, status, elapsed = ?started.elapsed(), "Request handled");
    Ok(response)
}

impl Pipeline {
    async fn proxy(&self, mut req: Request<Incoming>, peer: SocketAddr, routed: &str) -> Response<ProxyBody> {
        let identity = self.resolver.resolve(peer).await;
        self.injector.apply(&mut req, peer, identity.as_ref());

        let client_upgrade = headers::is_upgrade_request(req.headers()).then(|| hyper::upgrade::on(&mut req));

        let mut response = match self.forwarder.forward(req, routed).await {
            Ok(response) => response,
            Err(ForwardError::InvalidUri(e)) => {
                debug!(%peer, routed, error = %e, "Could not build downstream URI");
                return json_error_response(ProxyErrorCode::BadRequest, "Invalid request path");
            }
            Err(e) => {
                metrics::record_upstream_error();
                warn!(%peer, routed, error = %e, "Failed to forward request");
                return json_error_response(
                    ProxyErrorCode::ConnectionFailed,
                    "Failed to reach the downstream service",
                );
            }
        };

        match (response.status(), client_upgrade) {
            (StatusCode::SWITCHING_PROTOCOLS, Some(client_upgrade)) => {
                let downstream_upgrade = hyper::upgrade::on(&mut response);
                tokio::spawn(forward_bidirectional(client_upgrade, downstream_upgrade, peer));
            }
            _ => headers::strip_hop_by_hop(response.headers_mut()),
        }

        response.map(|body| body.boxed())
    }
}

/// Relay an upgraded connection until either side closes
async fn forward_bidirectional(client: OnUpgrade, downstream: OnUpgrade, peer: SocketAddr) {
    let (client, downstream) = match tokio::try_join!(client, downstream) {
        Ok(upgraded) => upgraded,
        Err(e) => {
            warn!(%peer, error = %e, "Upgrade failed");
            return;
        }
    };

    let mut client_io = TokioIo::new(client);
    let mut downstream_io = TokioIo::new(downstream);
    match tokio::io::copy_bidirectional(&mut client_io, &mut downstream_io).await {
        Ok((to_downstream, to_client)) => {
            debug!(%peer, to_downstream, to_client, "Upgraded connection closed");
        }
        Err(e) => {
            debug!(%peer, error = %e, "Upgraded connection closed with error");
        }
    }
}
