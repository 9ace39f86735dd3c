//! Pooled forwarding of requests to function workers
//!
//! One hyper client is shared by every request task so that connections to a
//! worker are reused across requests.

use crate::cors::apply_cors;
use crate::ResponseBody;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderName, HeaderValue};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::error::Error as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Header carrying the router-assigned request id
pub const X_REQUEST_ID: &str = "x-request-id";

#[derive(Debug, Error)]
pub enum ForwardError {
    /// Error from the HTTP client, rendered with its full source chain
    #[error("{}", describe_client_error(.0))]
    Client(#[from] hyper_util::client::legacy::Error),

    #[error("request build error: {0}")]
    RequestBuild(String),

    #[error("worker did not respond within {0:?}")]
    Timeout(Duration),
}

/// The legacy client's Display is just "client error (Connect)"; append the
/// causes so the details say what actually went wrong.
fn describe_client_error(err: &hyper_util::client::legacy::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Statistics for forwarded requests
#[derive(Debug, Default)]
pub struct ForwardStats {
    pub total_requests: AtomicU64,
    pub failed_requests: AtomicU64,
}

impl ForwardStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }
}

/// Configuration for the worker connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per worker
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Sends requests to workers over pooled connections
pub struct Forwarder {
    client: Client<HttpConnector, Incoming>,
    worker_host: String,
    request_timeout: Option<Duration>,
    stats: Arc<ForwardStats>,
    config: PoolConfig,
}

impl Forwarder {
    pub fn new(config: PoolConfig, worker_host: String, request_timeout: Option<Duration>) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            worker_host = %worker_host,
            "Worker connection pool initialized"
        );

        Self {
            client,
            worker_host,
            request_timeout,
            stats: Arc::new(ForwardStats::default()),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<ForwardStats> {
        Arc::clone(&self.stats)
    }

    pub fn worker_host(&self) -> &str {
        &self.worker_host
    }

    /// Forward `req` to the worker on `port`, keeping method, path, query,
    /// headers and body. The worker's status, headers and body come back
    /// unchanged apart from the CORS overlay.
    pub async fn forward(
        &self,
        req: Request<Incoming>,
        port: u16,
        request_id: &str,
    ) -> Result<Response<ResponseBody>, ForwardError> {
        let uri = format!(
            "http://{}:{}{}",
            self.worker_host,
            port,
            req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
        );

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder()
            .method(parts.method)
            .uri(&uri)
            .version(hyper::Version::HTTP_11);

        for (key, value) in parts.headers.iter() {
            // Host comes from the worker URI, the request id is set below
            if *key == hyper::header::HOST || key.as_str() == X_REQUEST_ID {
                continue;
            }
            builder = builder.header(key, value);
        }

        if let Ok(value) = HeaderValue::from_str(request_id) {
            builder = builder.header(HeaderName::from_static(X_REQUEST_ID), value);
        }

        let worker_req = builder
            .body(body)
            .map_err(|e| ForwardError::RequestBuild(e.to_string()))?;

        self.stats.record_request();

        let result = match self.request_timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.client.request(worker_req))
                .await
                .map_err(|_| ForwardError::Timeout(timeout))
                .and_then(|r| r.map_err(ForwardError::from)),
            None => self.client.request(worker_req).await.map_err(ForwardError::from),
        };

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                self.stats.record_failure();
                return Err(e);
            }
        };

        let (mut parts, body) = response.into_parts();
        apply_cors(&mut parts.headers);

        Ok(Response::from_parts(parts, body.boxed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_idle_per_host, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_forward_stats() {
        let stats = ForwardStats::default();

        assert_eq!(stats.get_total_requests(), 0);
        assert_eq!(stats.get_failed_requests(), 0);

        stats.record_request();
        stats.record_request();
        stats.record_failure();
        assert_eq!(stats.get_total_requests(), 2);
        assert_eq!(stats.get_failed_requests(), 1);
    }

    #[tokio::test]
    async fn test_forwarder_creation() {
        let config = PoolConfig {
            max_idle_per_host: 5,
            idle_timeout: Duration::from_secs(30),
        };

        let forwarder = Forwarder::new(config, "127.0.0.1".to_string(), Some(Duration::from_secs(2)));
        assert_eq!(forwarder.config().max_idle_per_host, 5);
        assert_eq!(forwarder.config().idle_timeout, Duration::from_secs(30));
        assert_eq!(forwarder.worker_host(), "127.0.0.1");
        assert_eq!(forwarder.stats().get_total_requests(), 0);
    }

    #[test]
    fn test_error_display() {
        let err = ForwardError::Timeout(Duration::from_secs(3));
        assert_eq!(err.to_string(), "worker did not respond within 3s");

        let err = ForwardError::RequestBuild("invalid uri".to_string());
        assert!(err.to_string().contains("invalid uri"));
    }
}
