//! Prometheus metrics.
//!
//! Thin wrappers over the `metrics` facade so handlers record with one call
//! and metric names live in one place.

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;
use tracing::warn;

static HANDLE: OnceLock<Option<PrometheusHandle>> = OnceLock::new();

/// Install the global recorder once per process and return its render handle.
///
/// Returns `None` when another recorder was already installed.
pub fn install() -> Option<PrometheusHandle> {
    HANDLE
        .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Prometheus recorder not installed: {}", e);
                None
            }
        })
        .clone()
}

/// Count a finished request for `endpoint` with its response status
pub fn record_request(endpoint: &'static str, status: u16) {
    counter!(
        "hls_relay_requests_total",
        "endpoint" => endpoint,
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_duration(endpoint: &'static str, start: Instant) {
    histogram!("hls_relay_request_duration_seconds", "endpoint" => endpoint)
        .record(start.elapsed().as_secs_f64());
}

pub fn record_origin_error() {
    counter!("hls_relay_origin_errors_total").increment(1);
}

pub fn record_relayed_bytes(bytes: u64) {
    counter!("hls_relay_relayed_bytes_total").increment(bytes);
}

pub fn record_client_disconnect() {
    counter!("hls_relay_client_disconnects_total").increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_is_idempotent() {
        let first = install();
        let second = install();
        assert_eq!(first.is_some(), second.is_some());
    }

    #[test]
    fn recorded_request_shows_in_render() {
        let Some(handle) = install() else {
            return;
        };
        record_request("manifest", 200);
        let text = handle.render();
        assert!(text.contains("hls_relay_requests_total"));
    }
}
