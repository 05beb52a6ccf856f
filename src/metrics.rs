//! Prometheus metrics and the `/metrics` listener.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `tsnsrv_requests_total` | Counter | `status` |
//! | `tsnsrv_request_duration_seconds` | Histogram | - |
//! | `tsnsrv_forbidden_total` | Counter | - |
//! | `tsnsrv_whois_lookups_total` | Counter | `result` |
//! | `tsnsrv_upstream_errors_total` | Counter | - |

use crate::error::{full_body, json_error_response, ProxyBody, ProxyErrorCode};
use crate::listener::accept_next;
use crate::tailnet::TailnetListener;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::io;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, info, warn};

static METRICS_HANDLE: OnceLock<Option<PrometheusHandle>> = OnceLock::new();

/// Install the Prometheus recorder once per process and return its handle.
/// Returns `None` if another recorder was installed first.
pub fn init() -> Option<PrometheusHandle> {
    METRICS_HANDLE
        .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                register_metric_descriptions();
                Some(handle)
            }
            Err(e) => {
                warn!(error = %e, "Could not install metrics recorder");
                None
            }
        })
        .clone()
}

fn register_metric_descriptions() {
    describe_counter!("tsnsrv_requests_total", "Proxied requests by response status");
    describe_histogram!(
        "tsnsrv_request_duration_seconds",
        "Time from receiving a request to sending response headers"
    );
    describe_counter!(
        "tsnsrv_forbidden_total",
        "Requests rejected because no allowed prefix matched"
    );
    describe_counter!("tsnsrv_whois_lookups_total", "Caller identity lookups by result");
    describe_counter!(
        "tsnsrv_upstream_errors_total",
        "Requests that failed to reach the downstream service"
    );
}

pub fn record_request(status: u16, duration: Duration) {
    counter!("tsnsrv_requests_total", "status" => status.to_string()).increment(1);
    histogram!("tsnsrv_request_duration_seconds").record(duration.as_secs_f64());
}

pub fn record_forbidden() {
    counter!("tsnsrv_forbidden_total").increment(1);
}

/// `result` is one of `ok`, `unknown`, `error` or `timeout`.
pub fn record_whois(result: &'static str) {
    counter!("tsnsrv_whois_lookups_total", "result" => result).increment(1);
}

pub fn record_upstream_error() {
    counter!("tsnsrv_upstream_errors_total").increment(1);
}

/// Serves `GET /metrics` on its own listener.
pub struct MetricsServer {
    listener: Box<dyn TailnetListener>,
    handle: PrometheusHandle,
}

impl MetricsServer {
    pub fn new(listener: Box<dyn TailnetListener>, handle: PrometheusHandle) -> Self {
        Self { listener, handle }
    }

    /// Serve until the listener is closed. Only returns with that error.
    pub async fn run(mut self) -> io::Result<()> {
        if let Ok(addr) = self.listener.local_addr() {
            info!(%addr, "Metrics listener ready");
        }

        loop {
            let (stream, peer) = accept_next(self.listener.as_mut()).await?;
            let handle = self.handle.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let handle = handle.clone();
                    async move { Ok::<_, hyper::Error>(handle_metrics_request(req, &handle)) }
                });
                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    debug!(%peer, error = %e, "Metrics connection error");
                }
            });
        }
    }
}

fn handle_metrics_request(req: Request<Incoming>, handle: &PrometheusHandle) -> Response<ProxyBody> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let mut response = Response::new(full_body(handle.render()));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        (_, path) => json_error_response(ProxyErrorCode::NotFound, format!("{} not found", path)),
    }
}
