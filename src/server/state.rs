use crate::{config::Config, error::Result, metrics, upstream::OriginFetcher};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::Instant;

/// Application state shared across all handlers.
///
/// Read-only after startup; requests share no mutable state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// Origin client; idle connections are never pooled
    pub fetcher: OriginFetcher,
    pub metrics: Option<PrometheusHandle>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self> {
        let fetcher = OriginFetcher::new(config.upstream.clone())?;

        Ok(Self {
            config: Arc::new(config),
            fetcher,
            metrics: metrics::install(),
            started_at: Instant::now(),
        })
    }
}
