//! Edge Router - spawns edge function workers on demand and proxies to them
//!
//! This library provides a single-process router that:
//! - Maps `/{name}` and `/functions/v1/{name}` to a catalog of function scripts
//! - Spawns one runtime worker per function on first use, feeding it the
//!   function source rewritten to listen on a dedicated port
//! - Shares a single in-flight spawn between concurrent first requests
//! - Probes the worker port before forwarding the first request
//! - Reverse-proxies requests through a pooled client and adds CORS headers
//!   to every response

use http_body_util::combinators::BoxBody;
use hyper::body::Bytes;

pub mod config;
pub mod cors;
pub mod error;
pub mod forward;
pub mod ports;
pub mod registry;
pub mod router;
pub mod supervisor;
pub mod transform;

/// Body type of every response the router produces
pub type ResponseBody = BoxBody<Bytes, hyper::Error>;
