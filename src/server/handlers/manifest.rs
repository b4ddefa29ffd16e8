use crate::{
    error::{RelayError, Result},
    hls::{RewriteContext, rewrite},
    metrics,
    server::{cors, query::ProxyParams, state::AppState},
    upstream::{FetchMode, InboundHeaders, SpoofIdentity, cookie, headers},
};
use axum::{
    extract::{Query, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use std::time::Instant;
use tracing::info;
use url::Url;

/// `GET /manifest-proxy?url=&headers=`
pub async fn serve_manifest(
    Query(params): Query<ProxyParams>,
    State(state): State<AppState>,
) -> Result<Response> {
    let start = Instant::now();

    let result = match (params.target(), params.inbound_headers()) {
        (Ok(target), Ok(inbound)) => proxy_manifest(&state, target, inbound).await,
        (Err(e), _) | (_, Err(e)) => Err(e),
    };

    let status = match &result {
        Ok(resp) => resp.status().as_u16(),
        Err(e) => e.status_code().as_u16(),
    };
    metrics::record_request("manifest", status);
    metrics::record_duration("manifest", start);

    result
}

/// Fetch `target` with a forged browser identity and rewrite every reference
/// in it to route back through this proxy.
///
/// # Errors
/// - [`RelayError::UpstreamUnreachable`] when the origin cannot be reached
/// - [`RelayError::UpstreamNonSuccess`] when the origin answers non-2xx
/// - [`RelayError::ManifestDecode`] when the body is not UTF-8
pub async fn proxy_manifest(
    state: &AppState,
    target: Url,
    inbound: InboundHeaders,
) -> Result<Response> {
    info!("Proxying manifest: {}", target);

    let outbound = headers::build(&inbound, FetchMode::Manifest, None, &state.config.identity);

    let origin = state
        .fetcher
        .fetch_manifest(&target, &outbound)
        .await
        .inspect_err(|_| metrics::record_origin_error())?;

    if !origin.status.is_success() {
        return Err(RelayError::upstream_non_success(origin.status, &origin.body));
    }

    let body = origin.text()?;

    let harvested = cookie::extract(origin.headers.set_cookie().as_deref());
    let identity = SpoofIdentity::resolve(&inbound, &harvested, &state.config.identity);
    let ctx = RewriteContext::new(origin.url.clone(), identity, &state.config.public_url);

    let rewritten = rewrite(body, &ctx);

    let mut response = (StatusCode::OK, rewritten).into_response();
    let out = response.headers_mut();
    out.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/vnd.apple.mpegurl"),
    );
    out.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    cors::apply(out);

    Ok(response)
}
