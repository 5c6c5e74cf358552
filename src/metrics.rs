//! Prometheus adapter: a `/metrics` endpoint over the shared default
//! registry, synced from `AggregateStats` on every scrape.
//!
//! Mirrors the teacher's `lazy_static!`-registered metric families plus a
//! minimal `axum` router, trimmed to the one route this crate needs.

use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use lazy_static::lazy_static;
use prometheus::{
    register_gauge, register_int_gauge, register_int_gauge_vec, Encoder, Gauge, IntGauge,
    IntGaugeVec, TextEncoder,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::aggregator::StatsAggregator;

lazy_static! {
    static ref TARGET_CLIENTS: IntGauge =
        register_int_gauge!("hls_loadgen_target_clients", "Configured target client count").unwrap();
    static ref ACTIVE_CLIENTS: IntGauge = register_int_gauge!(
        "hls_loadgen_active_clients",
        "Clients registered and not yet terminal (registered minus terminal)"
    )
    .unwrap();
    static ref PEAK_ACTIVE_CLIENTS: IntGauge =
        register_int_gauge!("hls_loadgen_peak_active_clients", "High-water mark of active_clients this run").unwrap();
    static ref TERMINAL_CLIENTS: IntGauge = register_int_gauge!(
        "hls_loadgen_terminal_clients",
        "Clients that reached max_restarts_per_client and will not respawn"
    )
    .unwrap();
    static ref STALLED_CLIENTS: IntGauge =
        register_int_gauge!("hls_loadgen_stalled_clients", "Clients currently stalled").unwrap();
    static ref DEGRADED_CLIENTS: IntGauge = register_int_gauge!(
        "hls_loadgen_degraded_clients",
        "Clients whose parser drop rate exceeds the configured threshold"
    )
    .unwrap();
    static ref HIGH_DRIFT_CLIENTS: IntGauge = register_int_gauge!(
        "hls_loadgen_high_drift_clients",
        "Clients whose playback drift exceeds the configured threshold"
    )
    .unwrap();
    static ref CLIENTS_ABOVE_REALTIME: IntGauge = register_int_gauge!(
        "hls_loadgen_clients_above_realtime",
        "Clients decoding faster than 1.0x"
    )
    .unwrap();
    static ref RAMP_PROGRESS: Gauge = register_gauge!(
        "hls_loadgen_ramp_progress_ratio",
        "active_clients / target_clients, 0 when target is 0"
    )
    .unwrap();
    static ref TEST_ELAPSED_SECONDS: Gauge =
        register_gauge!("hls_loadgen_test_elapsed_seconds", "Seconds since the run started").unwrap();

    static ref MANIFEST_REQUESTS_TOTAL: IntGauge =
        register_int_gauge!("hls_loadgen_manifest_requests_total", "Cumulative manifest requests").unwrap();
    static ref SEGMENT_REQUESTS_TOTAL: IntGauge =
        register_int_gauge!("hls_loadgen_segment_requests_total", "Cumulative segment requests").unwrap();
    static ref UNKNOWN_REQUESTS_TOTAL: IntGauge =
        register_int_gauge!("hls_loadgen_unknown_requests_total", "Cumulative unclassified requests").unwrap();
    static ref BYTES_TOTAL: IntGauge =
        register_int_gauge!("hls_loadgen_bytes_total", "Cumulative bytes received across all clients").unwrap();
    static ref RECONNECTS_TOTAL: IntGauge =
        register_int_gauge!("hls_loadgen_reconnects_total", "Cumulative decoder reconnects").unwrap();
    static ref TIMEOUTS_TOTAL: IntGauge =
        register_int_gauge!("hls_loadgen_timeouts_total", "Cumulative pending-request timeouts").unwrap();
    static ref STALLS_TOTAL: IntGauge =
        register_int_gauge!("hls_loadgen_stalls_total", "Cumulative stall transitions").unwrap();

    static ref HTTP_ERRORS_BY_CODE: IntGaugeVec = register_int_gauge_vec!(
        "hls_loadgen_http_errors_total",
        "Cumulative HTTP error responses observed by the decoder, by status code",
        &["code"]
    )
    .unwrap();

    static ref AVERAGE_SPEED: Gauge =
        register_gauge!("hls_loadgen_average_speed", "Mean decoder playback speed across clients").unwrap();
    static ref SPEED_QUANTILES: prometheus::GaugeVec = prometheus::register_gauge_vec!(
        "hls_loadgen_speed_ratio",
        "Decoder playback speed distribution across clients",
        &["quantile"]
    )
    .unwrap();
    static ref THROUGHPUT_P50: Gauge =
        register_gauge!("hls_loadgen_throughput_bps_p50", "Fleet segment throughput, 50th percentile").unwrap();
    static ref THROUGHPUT_P95: Gauge =
        register_gauge!("hls_loadgen_throughput_bps_p95", "Fleet segment throughput, 95th percentile").unwrap();
    static ref THROUGHPUT_P99: Gauge =
        register_gauge!("hls_loadgen_throughput_bps_p99", "Fleet segment throughput, 99th percentile").unwrap();
    static ref THROUGHPUT_MAX: Gauge =
        register_gauge!("hls_loadgen_throughput_bps_max", "Fleet segment throughput, observed maximum").unwrap();

    static ref MANIFEST_LATENCY_SECONDS: IntGaugeVec = register_int_gauge_vec!(
        "hls_loadgen_manifest_latency_milliseconds",
        "Inferred manifest request latency quantiles",
        &["quantile"]
    )
    .unwrap();
    static ref SEGMENT_LATENCY_SECONDS: IntGaugeVec = register_int_gauge_vec!(
        "hls_loadgen_segment_latency_milliseconds",
        "Inferred segment request latency quantiles",
        &["quantile"]
    )
    .unwrap();

    static ref PIPELINE_LINES_DROPPED: IntGaugeVec = register_int_gauge_vec!(
        "hls_loadgen_pipeline_lines_dropped_total",
        "Diagnostic/progress lines dropped under backpressure, summed across clients as of last sync",
        &["stream"]
    )
    .unwrap();

    static ref UPTIME_SECONDS: IntGaugeVec = register_int_gauge_vec!(
        "hls_loadgen_process_uptime_seconds",
        "Per-child wall-clock uptime distribution, sampled at each child exit",
        &["quantile"]
    )
    .unwrap();

    static ref EXIT_CLASS_TOTAL: IntGaugeVec = register_int_gauge_vec!(
        "hls_loadgen_exit_class_total",
        "Cumulative child exits by class",
        &["class"]
    )
    .unwrap();
}

/// Marker type the orchestrator threads through construction so metric
/// wiring has the same lifecycle shape as every other component, even
/// though the underlying families live in the process-global registry.
pub struct MetricsRegistry;

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self
    }

    /// Pushes the latest `AggregateStats` snapshot into the registered
    /// gauges. Called on every scrape rather than on a timer so the
    /// numbers are exact as of the request, at the cost of (at most) one
    /// aggregator refresh per scrape -- cheap, since `get_aggregate_stats`
    /// is itself cached.
    fn sync(&self, aggregator: &StatsAggregator) {
        let stats = aggregator.get_aggregate_stats();

        TARGET_CLIENTS.set(stats.target_clients as i64);
        ACTIVE_CLIENTS.set(stats.active_clients as i64);
        PEAK_ACTIVE_CLIENTS.set(stats.peak_active_clients as i64);
        TERMINAL_CLIENTS.set(stats.terminal_clients as i64);
        STALLED_CLIENTS.set(stats.stalled_clients as i64);
        DEGRADED_CLIENTS.set(stats.degraded_clients as i64);
        HIGH_DRIFT_CLIENTS.set(stats.high_drift_clients as i64);
        CLIENTS_ABOVE_REALTIME.set(stats.clients_above_realtime as i64);
        RAMP_PROGRESS.set(if stats.target_clients == 0 {
            0.0
        } else {
            stats.active_clients as f64 / stats.target_clients as f64
        });
        TEST_ELAPSED_SECONDS.set(stats.generated_at_elapsed.as_secs_f64());

        MANIFEST_REQUESTS_TOTAL.set(stats.manifest_requests as i64);
        SEGMENT_REQUESTS_TOTAL.set(stats.segment_requests as i64);
        UNKNOWN_REQUESTS_TOTAL.set(stats.unknown_requests as i64);
        BYTES_TOTAL.set(stats.total_bytes as i64);
        RECONNECTS_TOTAL.set(stats.reconnects as i64);
        TIMEOUTS_TOTAL.set(stats.timeouts as i64);
        STALLS_TOTAL.set(stats.stalls as i64);

        for (code, count) in &stats.http_errors_by_code {
            HTTP_ERRORS_BY_CODE
                .with_label_values(&[&code.to_string()])
                .set(*count as i64);
        }

        AVERAGE_SPEED.set(stats.average_speed);
        SPEED_QUANTILES.with_label_values(&["p50"]).set(stats.speed_p50);
        SPEED_QUANTILES.with_label_values(&["p95"]).set(stats.speed_p95);
        SPEED_QUANTILES.with_label_values(&["p99"]).set(stats.speed_p99);
        THROUGHPUT_P50.set(stats.throughput_p50);
        THROUGHPUT_P95.set(stats.throughput_p95);
        THROUGHPUT_P99.set(stats.throughput_p99);
        THROUGHPUT_MAX.set(stats.throughput_max);

        set_latency(&MANIFEST_LATENCY_SECONDS, "p50", stats.manifest_latency_p50);
        set_latency(&MANIFEST_LATENCY_SECONDS, "p95", stats.manifest_latency_p95);
        set_latency(&MANIFEST_LATENCY_SECONDS, "p99", stats.manifest_latency_p99);
        set_latency(&SEGMENT_LATENCY_SECONDS, "p50", stats.segment_latency_p50);
        set_latency(&SEGMENT_LATENCY_SECONDS, "p95", stats.segment_latency_p95);
        set_latency(&SEGMENT_LATENCY_SECONDS, "p99", stats.segment_latency_p99);

        PIPELINE_LINES_DROPPED
            .with_label_values(&["progress"])
            .set(stats.progress_lines_dropped as i64);
        PIPELINE_LINES_DROPPED
            .with_label_values(&["diagnostic"])
            .set(stats.diagnostic_lines_dropped as i64);

        set_uptime(&UPTIME_SECONDS, "p50", stats.uptime_p50);
        set_uptime(&UPTIME_SECONDS, "p95", stats.uptime_p95);
        set_uptime(&UPTIME_SECONDS, "p99", stats.uptime_p99);

        EXIT_CLASS_TOTAL.with_label_values(&["clean"]).set(stats.exit_clean as i64);
        EXIT_CLASS_TOTAL
            .with_label_values(&["expected_shutdown"])
            .set(stats.exit_expected_shutdown as i64);
        EXIT_CLASS_TOTAL
            .with_label_values(&["external_kill"])
            .set(stats.exit_external_kill as i64);
        EXIT_CLASS_TOTAL.with_label_values(&["error"]).set(stats.exit_error as i64);
    }
}

fn set_uptime(vec: &IntGaugeVec, quantile: &str, value: Option<std::time::Duration>) {
    if let Some(d) = value {
        vec.with_label_values(&[quantile]).set(d.as_secs() as i64);
    }
}

fn set_latency(vec: &IntGaugeVec, quantile: &str, value: Option<std::time::Duration>) {
    if let Some(d) = value {
        vec.with_label_values(&[quantile]).set(d.as_millis() as i64);
    }
}

async fn handle_metrics(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    state.registry.sync(&state.aggregator);

    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "failed to encode metrics");
        return (axum::http::StatusCode::INTERNAL_SERVER_ERROR, String::new());
    }
    (
        axum::http::StatusCode::OK,
        String::from_utf8_lossy(&buffer).to_string(),
    )
}

struct ServerState {
    registry: Arc<MetricsRegistry>,
    aggregator: Arc<StatsAggregator>,
}

/// Serves `GET /metrics` until `cancel` fires. Binding failures are
/// logged and the task exits -- a dead metrics endpoint should not bring
/// down the load generator itself.
pub async fn serve(
    registry: Arc<MetricsRegistry>,
    aggregator: Arc<StatsAggregator>,
    listen_address: String,
    cancel: CancellationToken,
) {
    let state = Arc::new(ServerState { registry, aggregator });
    let app = Router::new()
        .route("/metrics", get(handle_metrics))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state);

    let listener = match tokio::net::TcpListener::bind(&listen_address).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!(error = %e, address = %listen_address, "failed to bind metrics listener");
            return;
        }
    };
    info!(address = %listen_address, "metrics endpoint listening");

    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await;
    if let Err(e) = serve_result {
        warn!(error = %e, "metrics server exited with an error");
    }
}
