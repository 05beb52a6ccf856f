//! Forwarding requests to the downstream service.
//!
//! Requests go through a pooled hyper-util client whose connector dials the
//! configured transport: the destination host through the node, a fixed
//! address through the node, or a local Unix socket. `https` destinations are
//! wrapped in TLS on top of whichever transport was dialed.

use crate::config::Downstream;
use crate::tailnet::{BoxedStream, Tailnet};
use hyper::body::Incoming;
use hyper::http::uri::{InvalidUri, Uri};
use hyper::{Request, Response, Version};
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::future::Future;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::UnixStream;
use tokio_rustls::TlsConnector;
use tower::Service;
use tracing::{debug, warn};
use url::Url;

/// Maximum idle connections kept to the downstream
const POOL_MAX_IDLE: usize = 10;
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("could not build downstream URI: {0}")]
    InvalidUri(#[from] InvalidUri),
    #[error("downstream request failed: {0}")]
    Request(#[from] hyper_util::client::legacy::Error),
    #[error("could not set up TLS: {0}")]
    Tls(#[from] rustls::Error),
}

/// A connection to the downstream, plain or TLS.
pub struct DownstreamStream(TokioIo<BoxedStream>);

impl Connection for DownstreamStream {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

impl hyper::rt::Read for DownstreamStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        hyper::rt::Read::poll_read(Pin::new(&mut self.0), cx, buf)
    }
}

impl hyper::rt::Write for DownstreamStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        hyper::rt::Write::poll_write(Pin::new(&mut self.0), cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        hyper::rt::Write::poll_flush(Pin::new(&mut self.0), cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        hyper::rt::Write::poll_shutdown(Pin::new(&mut self.0), cx)
    }
}

/// Dials the downstream for the pooled client.
#[derive(Clone)]
pub struct DownstreamConnector {
    node: Arc<dyn Tailnet>,
    target: Downstream,
    tls: TlsConnector,
}

impl DownstreamConnector {
    pub fn new(node: Arc<dyn Tailnet>, target: Downstream, tls: TlsConnector) -> Self {
        Self { node, target, tls }
    }

    async fn connect(self, uri: Uri) -> io::Result<DownstreamStream> {
        let host = uri
            .host()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("no host in {}", uri)))?;
        let https = uri.scheme_str() == Some("https");
        let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });

        let stream: BoxedStream = match &self.target {
            Downstream::Tailnet => self.node.dial("tcp", &format!("{}:{}", host, port)).await?,
            Downstream::Tcp(addr) => self.node.dial("tcp", addr).await?,
            Downstream::Unix(path) => Box::new(connect_unix(path).await?),
        };
        debug!(%uri, target = ?self.target, "Dialed downstream");

        if !https {
            return Ok(DownstreamStream(TokioIo::new(stream)));
        }

        let name = host.trim_start_matches('[').trim_end_matches(']').to_string();
        let server_name = ServerName::try_from(name)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let tls_stream = self.tls.connect(server_name, stream).await?;
        Ok(DownstreamStream(TokioIo::new(Box::new(tls_stream))))
    }
}

async fn connect_unix(path: &Path) -> io::Result<UnixStream> {
    UnixStream::connect(path).await.map_err(|e| {
        io::Error::new(e.kind(), format!("could not connect to {}: {}", path.display(), e))
    })
}

impl Service<Uri> for DownstreamConnector {
    type Response = DownstreamStream;
    type Error = io::Error;
    type Future = Pin<Box<dyn Future<Output = io::Result<DownstreamStream>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        Box::pin(self.clone().connect(uri))
    }
}

/// Sends routed requests to the destination.
pub struct Forwarder {
    client: Client<DownstreamConnector, Incoming>,
    dest: Url,
}

impl Forwarder {
    pub fn new(
        node: Arc<dyn Tailnet>,
        target: Downstream,
        dest: Url,
        insecure_https: bool,
    ) -> Result<Self, ForwardError> {
        let tls = tls_connector(insecure_https)?;
        let connector = DownstreamConnector::new(node, target, tls);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(POOL_MAX_IDLE)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .build(connector);

        Ok(Self { client, dest })
    }

    /// Forward `req` with its path replaced by `path`. The inbound query is
    /// kept.
    pub async fn forward(&self, mut req: Request<Incoming>, path: &str) -> Result<Response<Incoming>, ForwardError> {
        let uri = outbound_uri(&self.dest, path, req.uri().query())?;
        *req.uri_mut() = uri;
        // The downstream connection is always HTTP/1.1
        *req.version_mut() = Version::HTTP_11;

        Ok(self.client.request(req).await?)
    }
}

/// Destination URL joined with the routed path and inbound query.
pub fn outbound_uri(dest: &Url, path: &str, query: Option<&str>) -> Result<Uri, InvalidUri> {
    let authority = match (dest.host_str(), dest.port()) {
        (Some(host), Some(port)) => format!("{}:{}", host, port),
        (Some(host), None) => host.to_string(),
        (None, _) => String::new(),
    };

    let base = dest.path();
    let joined = match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    };

    let query = match (dest.query().filter(|q| !q.is_empty()), query.filter(|q| !q.is_empty())) {
        (Some(a), Some(b)) => format!("?{}&{}", a, b),
        (Some(q), None) | (None, Some(q)) => format!("?{}", q),
        (None, None) => String::new(),
    };

    format!("{}://{}{}{}", dest.scheme(), authority, joined, query).parse()
}

fn tls_connector(insecure: bool) -> Result<TlsConnector, ForwardError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?;

    let mut config = if insecure {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier(provider)))
            .with_no_client_auth()
    } else {
        let native = rustls_native_certs::load_native_certs();
        for e in &native.errors {
            warn!(error = %e, "Could not load some native root certificates");
        }
        let mut roots = RootCertStore::empty();
        let (added, ignored) = roots.add_parsable_certificates(native.certs);
        debug!(added, ignored, "Loaded native root certificates");
        builder.with_root_certificates(roots).with_no_client_auth()
    };
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Accepts any downstream certificate. Only used with -insecureHTTPS.
#[derive(Debug)]
struct NoVerifier(Arc<CryptoProvider>);

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
