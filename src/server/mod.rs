pub mod cors;
pub mod handlers;
pub mod query;
pub mod state;

use crate::config::Config;
use crate::error::RelayError;
use axum::{
    Router,
    http::{HeaderName, HeaderValue},
    middleware,
    response::Response,
    routing::get,
};
use state::AppState;
use tracing::{error, info};

/// Response header carrying the crate version
pub const VERSION_HEADER: &str = "x-hls-relay-version";

/// Build the Axum router with all routes and middleware.
///
/// Split out of [`start`] so tests can drive the router without binding a port.
pub async fn build_router(config: Config) -> Result<Router, RelayError> {
    let state = AppState::new(config)?;

    let router = Router::new()
        .route("/", get(handlers::health::health_check))
        .route("/health", get(handlers::health::health_check))
        .route("/metrics", get(handlers::health::metrics))
        .route("/manifest-proxy", get(handlers::manifest::serve_manifest))
        .route("/segment-proxy", get(handlers::segment::serve_segment))
        // Endpoint names embedded by older rewritten playlists
        .route("/m3u8-proxy", get(handlers::manifest::serve_manifest))
        .route("/ts-proxy", get(handlers::segment::serve_segment))
        .route("/fetch", get(handlers::segment::serve_fetch))
        .layer(middleware::map_response(add_version_header))
        .layer(cors::layer())
        .with_state(state);

    Ok(router)
}

async fn add_version_header(mut response: Response) -> Response {
    response.headers_mut().insert(
        HeaderName::from_static(VERSION_HEADER),
        HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
    );
    response
}

/// Start the Axum HTTP server
pub async fn start(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.host, config.port);
    let public_url = config.public_url.clone();

    let app = build_router(config).await?;

    // Bind TCP listener
    let listener = match tokio::net::TcpListener::bind(addr.as_str()).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to address {}: {}", addr, e);
            return Err(e.into());
        }
    };

    info!("Listening on http://{} (public URL {})", addr, public_url);

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("Server error: {}", e);
        return Err(e.into());
    }

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
