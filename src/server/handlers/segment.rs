use crate::{
    error::Result,
    metrics, relay,
    server::{query::ProxyParams, state::AppState},
    upstream::{FetchMode, InboundHeaders, headers},
};
use axum::{
    extract::{Query, State},
    http::{HeaderMap, Method, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use std::time::Instant;
use tracing::info;
use url::Url;

/// `GET|HEAD /segment-proxy?url=&headers=`
pub async fn serve_segment(
    method: Method,
    Query(params): Query<ProxyParams>,
    State(state): State<AppState>,
    request_headers: HeaderMap,
) -> Response {
    let start = Instant::now();
    let client_range = request_headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok());

    let response = match (params.target(), params.inbound_headers()) {
        (Ok(target), Ok(inbound)) => {
            proxy_segment(&state, target, inbound, method, client_range).await
        }
        (Err(e), _) | (_, Err(e)) => Err(e),
    }
    .unwrap_or_else(IntoResponse::into_response);

    metrics::record_request("segment", response.status().as_u16());
    metrics::record_duration("segment", start);
    response
}

/// Query string of `/fetch`
#[derive(Debug, Deserialize)]
pub struct FetchParams {
    pub url: Option<String>,
}

/// `GET|HEAD /fetch?url=`: plain pass-through with the default identity
pub async fn serve_fetch(
    method: Method,
    Query(params): Query<FetchParams>,
    State(state): State<AppState>,
) -> Response {
    let start = Instant::now();
    let params = ProxyParams {
        url: params.url,
        headers: None,
    };

    let response = match params.target() {
        Ok(target) => proxy_segment(&state, target, InboundHeaders::new(), method, None).await,
        Err(e) => Err(e),
    }
    .unwrap_or_else(IntoResponse::into_response);

    metrics::record_request("fetch", response.status().as_u16());
    metrics::record_duration("fetch", start);
    response
}

/// Fetch `target` with a forged identity and stream it to the client.
///
/// The client's `Range` is forwarded and the origin's status (including
/// `206`) and whitelisted headers are passed through untouched.
pub async fn proxy_segment(
    state: &AppState,
    target: Url,
    inbound: InboundHeaders,
    method: Method,
    client_range: Option<&str>,
) -> Result<Response> {
    info!("Proxying segment: {} {}", method, target);

    let outbound = headers::build(
        &inbound,
        FetchMode::Segment,
        client_range,
        &state.config.identity,
    );

    let origin = state
        .fetcher
        .fetch_segment(&target, &outbound, method)
        .await
        .inspect_err(|_| metrics::record_origin_error())?;

    Ok(relay::respond(origin).await)
}
