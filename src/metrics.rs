//! # Global Metrics Registry
//!
//! All Prometheus metrics for the engine are defined and registered here so
//! the observability surface has a single point of reference. The telemetry
//! sink mirrors its structured events into these series; the warp server
//! exposes them on `/metrics`.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge_vec, Encoder,
    HistogramVec, IntCounterVec, IntGaugeVec, TextEncoder,
};
use std::net::SocketAddr;
use tokio::task::JoinHandle;
use tracing::{error, info};
use warp::{Filter, Reply};

// --- Pipeline metrics ---

pub static OPPORTUNITIES_DETECTED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "arb_opportunities_detected_total",
        "Profitable opportunities produced by the scanner.",
        &["chain"]
    )
    .expect("Failed to register arb_opportunities_detected_total")
});

pub static OPPORTUNITIES_ENQUEUED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "arb_opportunities_enqueued_total",
        "Opportunities accepted into a chain lane.",
        &["chain"]
    )
    .expect("Failed to register arb_opportunities_enqueued_total")
});

pub static OPPORTUNITIES_DROPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "arb_opportunities_dropped_total",
        "Opportunities evicted from a full lane.",
        &["chain"]
    )
    .expect("Failed to register arb_opportunities_dropped_total")
});

pub static EXECUTIONS_COMPLETED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "arb_executions_completed_total",
        "Terminal executions, labeled by outcome.",
        &["chain", "outcome"]
    )
    .expect("Failed to register arb_executions_completed_total")
});

pub static EXECUTIONS_ABANDONED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "arb_executions_abandoned_total",
        "Abandoned executions, labeled by reason.",
        &["chain", "reason"]
    )
    .expect("Failed to register arb_executions_abandoned_total")
});

pub static REALIZED_MARGIN: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "arb_realized_margin",
        "Realized margin per completed execution, reference units.",
        &["chain"]
    )
    .expect("Failed to register arb_realized_margin")
});

pub static GAS_SPENT_NATIVE: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "arb_gas_spent_native",
        "Gas spend per completed execution, native units.",
        &["chain"]
    )
    .expect("Failed to register arb_gas_spent_native")
});

pub static EXECUTION_STAGE_DURATION_MS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "arb_execution_stage_duration_ms",
        "Wall-clock time per execution stage.",
        &["stage"]
    )
    .expect("Failed to register arb_execution_stage_duration_ms")
});

pub static LATE_INCLUSIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "arb_late_inclusions_total",
        "Transactions mined after their pending deadline expired.",
        &["chain"]
    )
    .expect("Failed to register arb_late_inclusions_total")
});

// --- Coordinator metrics ---

pub static ROUTE_LATENCY_MS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "arb_route_latency_ms",
        "Data provider call latency, labeled by provider and capability.",
        &["provider", "capability"]
    )
    .expect("Failed to register arb_route_latency_ms")
});

pub static ROUTE_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "arb_route_failures_total",
        "Data provider call failures, labeled by kind.",
        &["provider", "kind"]
    )
    .expect("Failed to register arb_route_failures_total")
});

pub static PROVIDER_HEALTHY: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "arb_provider_healthy",
        "Data provider health (1=healthy, 0=unhealthy).",
        &["provider"]
    )
    .expect("Failed to register arb_provider_healthy")
});

pub static BREAKER_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "arb_breaker_events_total",
        "Circuit breaker transitions, labeled by subject and direction.",
        &["subject", "event"]
    )
    .expect("Failed to register arb_breaker_events_total")
});

pub static QUEUE_DEPTH: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "arb_queue_depth",
        "Opportunities currently queued per chain lane.",
        &["chain"]
    )
    .expect("Failed to register arb_queue_depth")
});

/// Starts the Prometheus metrics server on a separate Tokio task.
pub fn start_metrics_server(host: String, port: u16) -> JoinHandle<()> {
    tokio::spawn(async move {
        let addr: SocketAddr = match format!("{}:{}", host, port).parse() {
            Ok(addr) => addr,
            Err(e) => {
                error!(target: "metrics", "Invalid metrics server address: {}", e);
                return;
            }
        };

        info!(target: "metrics", "Prometheus metrics server starting on http://{}", addr);

        let metrics_route = warp::path("metrics").and_then(metrics_handler);
        warp::serve(metrics_route).run(addr).await;
    })
}

async fn metrics_handler() -> Result<warp::reply::Response, warp::Rejection> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(target: "metrics", "Failed to encode metrics: {}", e);
        let response = warp::reply::with_status(
            "Failed to encode metrics".to_string(),
            warp::http::StatusCode::INTERNAL_SERVER_ERROR,
        );
        return Ok(response.into_response());
    }

    let response = warp::reply::with_header(
        String::from_utf8_lossy(&buffer).to_string(),
        "Content-Type",
        encoder.format_type(),
    );
    Ok(response.into_response())
}
