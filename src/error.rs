//! Error types and JSON error responses

use crate::forward::ForwardError;
use crate::tailnet::local::NodeError;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::io;
use std::time::Duration;

/// Body type of every response the proxy produces.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Exit code used when the metrics listener fails after it was bound.
pub const METRICS_EXIT_CODE: i32 = 20;

/// Error codes reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Path is outside every allowed prefix
    Forbidden,
    /// Request could not be turned into a downstream request
    BadRequest,
    NotFound,
    /// Downstream could not be reached or failed mid-response
    ConnectionFailed,
}

impl ProxyErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ProxyErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ProxyErrorCode::NotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
        }
    }

    /// Value of the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::Forbidden => "FORBIDDEN",
            ProxyErrorCode::BadRequest => "BAD_REQUEST",
            ProxyErrorCode::NotFound => "NOT_FOUND",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ProxyErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.status
            )
        })
    }
}

pub fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed()
}

/// Build a JSON error response carrying an X-Proxy-Error header
pub fn json_error_response(code: ProxyErrorCode, message: impl Into<String>) -> Response<ProxyBody> {
    let body = ErrorResponse::new(code, message).to_json();

    let mut response = Response::new(full_body(body));
    *response.status_mut() = code.status_code();
    let headers = response.headers_mut();
    headers.insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    headers.insert(
        "x-proxy-error",
        hyper::header::HeaderValue::from_static(code.as_header_value()),
    );
    response
}

/// Failures before the service starts serving.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("could not connect to the tailnet: {0}")]
    Connect(#[from] NodeError),
    #[error("timed out after {0:?} connecting to the tailnet")]
    Timeout(Duration),
    #[error("could not listen on {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("could not set up forwarding: {0}")]
    Forward(#[from] ForwardError),
}

/// Reasons the service stopped.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error(transparent)]
    Startup(#[from] StartupError),
    #[error("serving failed: {0}")]
    Serve(#[source] io::Error),
    #[error("metrics listener failed: {0}")]
    Metrics(#[source] io::Error),
}

impl ServeError {
    /// Process exit code for this failure
    pub fn exit_code(&self) -> i32 {
        match self {
            ServeError::Metrics(_) => METRICS_EXIT_CODE,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(ProxyErrorCode::Forbidden.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(ProxyErrorCode::ConnectionFailed.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(ProxyErrorCode::NotFound.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_error_response_json() {
        let json = ErrorResponse::new(ProxyErrorCode::Forbidden, "path /admin is not allowed").to_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["code"], "FORBIDDEN");
        assert_eq!(value["message"], "path /admin is not allowed");
        assert_eq!(value["status"], 403);
    }

    #[test]
    fn test_json_error_response_headers() {
        let response = json_error_response(ProxyErrorCode::ConnectionFailed, "downstream refused");

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers()["content-type"], "application/json");
        assert_eq!(response.headers()["x-proxy-error"], "CONNECTION_FAILED");
    }

    #[test]
    fn test_exit_codes() {
        let metrics = ServeError::Metrics(io::Error::new(io::ErrorKind::BrokenPipe, "closed"));
        assert_eq!(metrics.exit_code(), 20);

        let serve = ServeError::Serve(io::Error::new(io::ErrorKind::BrokenPipe, "closed"));
        assert_eq!(serve.exit_code(), 1);

        let startup = ServeError::from(StartupError::Timeout(Duration::from_secs(60)));
        assert_eq!(startup.exit_code(), 1);
    }
}
