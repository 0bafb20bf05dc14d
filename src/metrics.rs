//! Prometheus metrics

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;

/// Setup Prometheus metrics exporter
/// Returns a handle that can be used to retrieve metrics
pub fn setup_metrics() -> Result<metrics_exporter_prometheus::PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    tracing::info!("Prometheus metrics exporter installed");

    Ok(handle)
}

pub fn record_download_started(artifact: &str) {
    metrics::counter!("weights_manager_downloads_started_total",
        "artifact" => artifact.to_string()
    )
    .increment(1);
}

pub fn record_download_completed(artifact: &str, method: &str) {
    metrics::counter!("weights_manager_downloads_completed_total",
        "artifact" => artifact.to_string(),
        "method" => method.to_string()
    )
    .increment(1);
}

/// Record a session that ended with every candidate exhausted
pub fn record_download_failed(artifact: &str) {
    metrics::counter!("weights_manager_downloads_failed_total",
        "artifact" => artifact.to_string()
    )
    .increment(1);
}

pub fn record_download_cancelled(artifact: &str) {
    metrics::counter!("weights_manager_downloads_cancelled_total",
        "artifact" => artifact.to_string()
    )
    .increment(1);
}

/// Record a single failed attempt (recovered by retry or fallback)
pub fn record_attempt_failure(artifact: &str, method: &str, reason: &str) {
    metrics::counter!("weights_manager_attempt_failures_total",
        "artifact" => artifact.to_string(),
        "method" => method.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Update in-flight session gauge
pub fn update_active_downloads(count: usize) {
    metrics::gauge!("weights_manager_active_downloads").set(count as f64);
}
