//! Error handling and JSON error responses for the load balancer

use crate::pool::ProxyBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Error codes for responses generated by the load balancer itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Every backend in the pool is marked dead
    NoBackendAvailable,
    /// The selected backend could not be reached or failed mid-request
    UpstreamUnavailable,
    /// The selected backend did not answer within the request timeout
    UpstreamTimeout,
    /// The client's request body failed before it reached the backend
    ClientBodyError,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the HTTP status code for this error.
    ///
    /// Clients retry on 503, so every upstream-side failure maps to it.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::NoBackendAvailable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::UpstreamUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::UpstreamTimeout => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::ClientBodyError => StatusCode::BAD_REQUEST,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::NoBackendAvailable => "NO_BACKEND_AVAILABLE",
            ProxyErrorCode::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            ProxyErrorCode::UpstreamTimeout => "UPSTREAM_TIMEOUT",
            ProxyErrorCode::ClientBodyError => "CLIENT_BODY_ERROR",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
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

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(code: ProxyErrorCode, message: impl Into<String>) -> Response<ProxyBody> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
