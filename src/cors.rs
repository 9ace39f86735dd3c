//! CORS policy applied to every response leaving the router

use crate::ResponseBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, ACCESS_CONTROL_ALLOW_HEADERS,
    ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
};
use hyper::{Response, StatusCode};

pub const ALLOW_ORIGIN: &str = "*";
pub const ALLOW_HEADERS: &str = "authorization, x-client-info, apikey, content-type";
pub const ALLOW_METHODS: &str = "GET, POST, PUT, DELETE, OPTIONS";

const CORS_HEADERS: [(HeaderName, &str); 3] = [
    (ACCESS_CONTROL_ALLOW_ORIGIN, ALLOW_ORIGIN),
    (ACCESS_CONTROL_ALLOW_HEADERS, ALLOW_HEADERS),
    (ACCESS_CONTROL_ALLOW_METHODS, ALLOW_METHODS),
];

/// Overlay the CORS headers, replacing any value already present
pub fn apply_cors(headers: &mut HeaderMap) {
    for (name, value) in CORS_HEADERS {
        headers.insert(name, HeaderValue::from_static(value));
    }
}

/// Response to a CORS preflight: 200, empty body, CORS headers only
pub fn preflight_response() -> Response<ResponseBody> {
    let mut response = Response::builder()
        .status(StatusCode::OK)
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum");
    apply_cors(response.headers_mut());
    response
}
