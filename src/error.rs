//! Error codes and JSON error responses for the router
//!
//! Every error leaving the router is a JSON object with at least an `error`
//! field, plus `available` (the catalog) for routing errors or `details` for
//! worker and proxy failures. All of them carry the CORS headers.

use crate::cors::apply_cors;
use crate::forward::ForwardError;
use crate::supervisor::SpawnError;
use crate::ResponseBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Header carrying the machine-readable error code
pub const X_ROUTER_ERROR: &str = "x-router-error";

/// Error codes for router errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterErrorCode {
    /// Path did not name a function
    NoFunction,
    /// Function is not in the catalog
    UnknownFunction,
    /// Worker could not be spawned (missing source, transform or launch failure)
    SpawnFailed,
    /// Worker exited before it started listening
    WorkerExited,
    /// Worker did not start listening in time
    StartupTimeout,
    /// Forwarding to the worker failed
    ProxyFailed,
    /// Worker did not answer within the request timeout
    ProxyTimeout,
}

impl RouterErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            RouterErrorCode::NoFunction => StatusCode::BAD_REQUEST,
            RouterErrorCode::UnknownFunction => StatusCode::NOT_FOUND,
            RouterErrorCode::SpawnFailed => StatusCode::INTERNAL_SERVER_ERROR,
            RouterErrorCode::WorkerExited => StatusCode::BAD_GATEWAY,
            RouterErrorCode::StartupTimeout => StatusCode::GATEWAY_TIMEOUT,
            RouterErrorCode::ProxyFailed => StatusCode::BAD_GATEWAY,
            RouterErrorCode::ProxyTimeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Get the error code as a string for the x-router-error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            RouterErrorCode::NoFunction => "NO_FUNCTION",
            RouterErrorCode::UnknownFunction => "UNKNOWN_FUNCTION",
            RouterErrorCode::SpawnFailed => "SPAWN_FAILED",
            RouterErrorCode::WorkerExited => "WORKER_EXITED",
            RouterErrorCode::StartupTimeout => "STARTUP_TIMEOUT",
            RouterErrorCode::ProxyFailed => "PROXY_FAILED",
            RouterErrorCode::ProxyTimeout => "PROXY_TIMEOUT",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            available: None,
            details: None,
        }
    }

    pub fn with_available(mut self, catalog: &[String]) -> Self {
        self.available = Some(catalog.to_vec());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"error":"{}"}}"#,
                self.error.replace('\\', "\\\\").replace('"', "\\\"")
            )
        })
    }
}

/// Create a 2xx/4xx/5xx JSON response carrying the CORS headers
pub fn json_response(status: StatusCode, body: String) -> Response<ResponseBody> {
    let mut response = Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static headers");
    apply_cors(response.headers_mut());
    response
}

/// Create a JSON error response with the x-router-error header
pub fn json_error_response(code: RouterErrorCode, body: ErrorBody) -> Response<ResponseBody> {
    let mut response = json_response(code.status_code(), body.to_json());
    response.headers_mut().insert(
        X_ROUTER_ERROR,
        hyper::header::HeaderValue::from_static(code.as_header_value()),
    );
    response
}

/// Map a failure to obtain a worker onto its error response
pub fn spawn_error_response(err: &SpawnError) -> Response<ResponseBody> {
    match err {
        SpawnError::Exited { .. } => json_error_response(
            RouterErrorCode::WorkerExited,
            ErrorBody::new("Worker exited before accepting connections").with_details(err.to_string()),
        ),
        SpawnError::StartupTimeout { .. } => json_error_response(
            RouterErrorCode::StartupTimeout,
            ErrorBody::new("Worker startup timeout").with_details(err.to_string()),
        ),
        _ => json_error_response(RouterErrorCode::SpawnFailed, ErrorBody::new(err.to_string())),
    }
}

/// Map a forwarding failure onto its error response
pub fn forward_error_response(err: &ForwardError) -> Response<ResponseBody> {
    match err {
        ForwardError::Timeout(_) => json_error_response(
            RouterErrorCode::ProxyTimeout,
            ErrorBody::new("Proxy timeout").with_details(err.to_string()),
        ),
        _ => json_error_response(
            RouterErrorCode::ProxyFailed,
            ErrorBody::new("Proxy error").with_details(err.to_string()),
        ),
    }
}
