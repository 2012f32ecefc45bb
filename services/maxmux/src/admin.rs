//! Admin listener
//!
//! Runs on its own port (`metrics_port`) so the proxy listener keeps every
//! path free for forwarding. Endpoints:
//! - GET /health  - liveness plus request counters
//! - GET /metrics - Prometheus text exposition

use std::sync::Arc;
use std::sync::atomic::Ordering;

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;

use crate::metrics::ServiceMetrics;

/// Shared state for admin handlers.
#[derive(Clone)]
pub struct AdminState {
    pub metrics: ServiceMetrics,
    pub prometheus: PrometheusHandle,
    pub upstream: Arc<str>,
    pub virtual_keys: usize,
}

/// Build the admin axum router.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthReport {
    status: &'static str,
    upstream: String,
    virtual_keys: usize,
    uptime_seconds: u64,
    requests_served: u64,
    requests_rejected: u64,
    errors_total: u64,
    in_flight: u64,
}

/// GET /health - always 200 while the process is serving.
async fn health_handler(State(state): State<AdminState>) -> impl IntoResponse {
    let m = &state.metrics;
    let report = HealthReport {
        status: "healthy",
        upstream: state.upstream.to_string(),
        virtual_keys: state.virtual_keys,
        uptime_seconds: m.started_at.elapsed().as_secs(),
        requests_served: m.requests_total.load(Ordering::Relaxed),
        requests_rejected: m.rejected_total.load(Ordering::Relaxed),
        errors_total: m.errors_total.load(Ordering::Relaxed),
        in_flight: m.in_flight.load(Ordering::Relaxed),
    };
    (StatusCode::OK, axum::Json(report))
}

/// GET /metrics - Prometheus text exposition format.
async fn metrics_handler(State(state): State<AdminState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}
