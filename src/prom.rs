//! Prometheus metrics.

use std::sync::OnceLock;

use anyhow::Result;
use axum::http::{header::HeaderName, HeaderMap, HeaderValue, StatusCode};
use axum::{extract::Extension, routing::get, AddExtensionLayer, Router};
use futures::prelude::*;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::Config;

pub const METRIC_MESSAGES_RECEIVED: &str = "stagehand_messages_received";
pub const METRIC_MESSAGES_SENT: &str = "stagehand_messages_sent";
pub const METRIC_DUPLICATES_DROPPED: &str = "stagehand_duplicates_dropped";
pub const METRIC_PROCESSING_ERRORS: &str = "stagehand_processing_errors";
pub const METRIC_EOF_REQUEUES: &str = "stagehand_eof_requeues";
pub const METRIC_CLIENTS_EVICTED: &str = "stagehand_clients_evicted";
pub const METRIC_CLIENTS_CONNECTED: &str = "stagehand_clients_connected";

/// Register the descriptions of every metric with the global recorder.
pub fn register_metrics() {
    metrics::register_counter!(METRIC_MESSAGES_RECEIVED, metrics::Unit::Count, "unique input messages handled by stage replicas");
    metrics::register_counter!(METRIC_MESSAGES_SENT, metrics::Unit::Count, "messages published by stage replicas");
    metrics::register_counter!(METRIC_DUPLICATES_DROPPED, metrics::Unit::Count, "redelivered input messages discarded as duplicates");
    metrics::register_counter!(METRIC_PROCESSING_ERRORS, metrics::Unit::Count, "records skipped due to decoding or processing errors");
    metrics::register_counter!(METRIC_EOF_REQUEUES, metrics::Unit::Count, "EOF tokens requeued while waiting for a stage to drain");
    metrics::register_counter!(METRIC_CLIENTS_EVICTED, metrics::Unit::Count, "clients finished and evicted by stage replicas");
    metrics::register_counter!(METRIC_CLIENTS_CONNECTED, metrics::Unit::Count, "clients connected to the gateway");
}

/// Get a handle to the metrics recorder, initializing it as needed.
pub fn get_metrics_recorder() -> &'static PrometheusRecorder {
    static RECORDER: OnceLock<PrometheusRecorder> = OnceLock::new();
    RECORDER.get_or_init(|| PrometheusBuilder::new().add_global_label("service", "stagehand").build())
}

/// Spawns a prometheus server which uses the default global registry for metrics.
pub fn spawn_prom_server(config: &Config, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<Result<()>> {
    let state = get_metrics_recorder().handle();
    let app = Router::new().route("/metrics", get(prometheus_scrape)).layer(AddExtensionLayer::new(state));
    let server = axum::Server::bind(&([0, 0, 0, 0], config.metrics_port).into())
        .serve(app.into_make_service())
        .with_graceful_shutdown(async move {
            let _res = shutdown.recv().await;
        });
    tracing::info!("metrics server is listening at 0.0.0.0:{}/metrics", config.metrics_port);
    tokio::spawn(server.map_err(anyhow::Error::from))
}

/// Handle Prometheus metrics scraping.
async fn prometheus_scrape(Extension(state): Extension<PrometheusHandle>) -> (StatusCode, HeaderMap, String) {
    let mut headers = HeaderMap::new();
    headers.insert(HeaderName::from_static("content-type"), HeaderValue::from_static("text/plain; version=0.0.4"));
    (StatusCode::OK, headers, state.render())
}
