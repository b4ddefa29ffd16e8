//! Permissive CORS.
//!
//! Players run in arbitrary web pages, so every response, errors included,
//! must be readable cross-origin.

use axum::http::{HeaderMap, HeaderValue, header};
use tower_http::cors::{Any, CorsLayer};

/// Attach the permissive CORS headers to a response header map
pub fn apply(headers: &mut HeaderMap) {
    let any = HeaderValue::from_static("*");
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, any.clone());
    headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, any.clone());
    headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, any);
}

/// Layer answering preflight requests
pub fn layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(Any)
}
