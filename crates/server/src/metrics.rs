//! Prometheus metrics for the polestar gateway.
//!
//! Served on the dedicated metrics listener, separate from the public
//! finder routes.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    self, Encoder, Gauge, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Find latency, tagged by inbound method and what the merged response
/// contained.
pub static FIND_LATENCY: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "polestar_find_latency_ms",
            "Time to respond to a find request in milliseconds",
        )
        .buckets(vec![
            1.0, 10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0, 90.0, 100.0, 200.0, 300.0, 400.0,
            500.0, 1000.0, 2000.0, 5000.0,
        ]),
        &["method", "found", "found_caskade", "found_regular"],
    )
    .expect("metric creation failed")
});

/// Find calls by source protocol.
pub static FIND_LOAD: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("polestar_find_load_total", "Amount of calls to find"),
        &["method"],
    )
    .expect("metric creation failed")
});

/// Backends reached by the most recent find.
pub static FIND_BACKENDS: LazyLock<Gauge> = LazyLock::new(|| {
    Gauge::new(
        "polestar_find_backends",
        "Backends reached in a find request",
    )
    .expect("metric creation failed")
});

/// Result records by transport protocol.
pub static FIND_RESPONSE: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("polestar_find_response_total", "Find response stats"),
        &["method", "transport"],
    )
    .expect("metric creation failed")
});

/// Most frequently returned providers.
pub static TOP_PROVIDER: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    IntGaugeVec::new(
        Opts::new("polestar_top_provider", "Top providers in responses"),
        &["provider"],
    )
    .expect("metric creation failed")
});

/// Delegated-routing calls by HTTP method.
pub static DELEGATED_ROUTING_METHOD: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "polestar_http_delegated_routing_total",
            "Amount of HTTP delegated routing calls by method",
        ),
        &["method"],
    )
    .expect("metric creation failed")
});

/// Guard to ensure metrics are only registered once.
static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry. Idempotent.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        REGISTRY
            .register(Box::new(FIND_LATENCY.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(FIND_LOAD.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(FIND_BACKENDS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(FIND_RESPONSE.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(TOP_PROVIDER.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(DELEGATED_ROUTING_METHOD.clone()))
            .expect("metric registration failed");
    });
}

/// GET /metrics - Prometheus metrics endpoint.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Failed to encode metrics: {e}").into_bytes(),
        ),
    }
}

pub fn yesno(v: bool) -> &'static str {
    if v { "yes" } else { "no" }
}
