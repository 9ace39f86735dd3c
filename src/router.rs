use crate::cors::preflight_response;
use crate::error::{
    forward_error_response, json_error_response, json_response, spawn_error_response,
    ErrorBody, RouterErrorCode,
};
use crate::forward::{Forwarder, X_REQUEST_ID};
use crate::registry::WorkerRegistry;
use crate::ResponseBody;
use hyper::body::Incoming;
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use regex::Regex;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// State shared by every connection
struct RouterState {
    catalog: Vec<String>,
    registry: Arc<WorkerRegistry>,
    forwarder: Forwarder,
}

/// The HTTP front end: built-in endpoints, routing and forwarding
pub struct RouterServer {
    bind_addr: SocketAddr,
    state: Arc<RouterState>,
    shutdown_rx: watch::Receiver<bool>,
}

#[derive(Debug, Serialize)]
struct HealthBody<'a> {
    status: &'static str,
    functions: &'a [String],
    workers: Vec<String>,
}

impl RouterServer {
    pub fn new(
        bind_addr: SocketAddr,
        catalog: Vec<String>,
        registry: Arc<WorkerRegistry>,
        forwarder: Forwarder,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            state: Arc::new(RouterState {
                catalog,
                registry,
                forwarder,
            }),
            shutdown_rx,
        }
    }

    /// Bind the listen address and serve until shutdown is signalled.
    /// Failing to bind is the only error returned.
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Edge router listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, state).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Edge router shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<RouterState>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { handle_request(req, state, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    state: Arc<RouterState>,
    client_addr: SocketAddr,
) -> Result<Response<ResponseBody>, hyper::Error> {
    if *req.method() == Method::OPTIONS {
        return Ok(preflight_response());
    }

    let path = req.uri().path();
    if path == "/" || path == "/health" {
        return Ok(health_response(&state));
    }

    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let request_id = request_id.as_str();

    // Overwrite rather than append; the router is the first hop
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        req.headers_mut().insert(X_FORWARDED_FOR, value);
    }

    let Some(name) = function_name(req.uri().path()).map(str::to_string) else {
        return Ok(json_error_response(
            RouterErrorCode::NoFunction,
            ErrorBody::new("No function specified").with_available(&state.catalog),
        ));
    };
    let function = name.as_str();

    if !state.catalog.iter().any(|known| known == function) {
        debug!(function, request_id, "Request for unknown function");
        return Ok(json_error_response(
            RouterErrorCode::UnknownFunction,
            ErrorBody::new(format!("Function not found: {}", function)).with_available(&state.catalog),
        ));
    }

    debug!(function, method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

    let port = match state.registry.ensure_worker(function).await {
        Ok(port) => port,
        Err(e) => {
            error!(function, request_id, error = %e, "Failed to obtain worker");
            return Ok(spawn_error_response(&e));
        }
    };

    let start = Instant::now();
    match state.forwarder.forward(req, port, request_id).await {
        Ok(response) => {
            debug!(
                function,
                port,
                request_id,
                status = response.status().as_u16(),
                elapsed_ms = start.elapsed().as_millis(),
                "Forwarded request"
            );
            Ok(response)
        }
        Err(e) => {
            warn!(function, port, request_id, error = %e, "Failed to forward request");
            Ok(forward_error_response(&e))
        }
    }
}

fn health_response(state: &RouterState) -> Response<ResponseBody> {
    let body = HealthBody {
        status: "ok",
        functions: &state.catalog,
        workers: state.registry.snapshot_names(),
    };
    let json = serde_json::to_string(&body).unwrap_or_else(|_| r#"{"status":"ok"}"#.to_string());
    json_response(StatusCode::OK, json)
}

fn function_path() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^/(?:functions/v1/)?([^/]+)").expect("valid function path regex"))
}

/// Extract the function name from `/{name}[/...]` or
/// `/functions/v1/{name}[/...]`
pub fn function_name(path: &str) -> Option<&str> {
    function_path()
        .captures(path)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_name_plain_path() {
        assert_eq!(function_name("/hello"), Some("hello"));
        assert_eq!(function_name("/hello/extra/segments"), Some("hello"));
    }

    #[test]
    fn test_function_name_prefixed_path() {
        assert_eq!(function_name("/functions/v1/hello"), Some("hello"));
        assert_eq!(function_name("/functions/v1/hello/nested"), Some("hello"));
    }

    #[test]
    fn test_function_name_edge_cases() {
        assert_eq!(function_name("/"), None);
        assert_eq!(function_name("//hello"), None);
        assert_eq!(function_name(""), None);
        // The prefix alone names a function called "functions"
        assert_eq!(function_name("/functions/v1/"), Some("functions"));
        assert_eq!(function_name("/functions"), Some("functions"));
    }

    #[test]
    fn test_function_name_keeps_dots_and_dashes() {
        assert_eq!(function_name("/my-func_2.0"), Some("my-func_2.0"));
    }
}
