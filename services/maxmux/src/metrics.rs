//! Prometheus metrics and in-process counters
//!
//! Exposed on the admin listener's `/metrics`:
//!
//! - `proxy_requests_total` (counter): labels `status`, `method`
//! - `proxy_request_duration_seconds` (histogram): label `status`
//! - `proxy_upstream_errors_total` (counter): label `error_type`
//! - `proxy_auth_rejections_total` (counter)
//!
//! `ServiceMetrics` keeps plain atomic counters for the `/health` report and
//! for drain logging at shutdown.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

const DURATION_METRIC: &str = "proxy_request_duration_seconds";

/// Buckets from 5ms to 10 minutes; streamed completions routinely run for
/// minutes.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
    600.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        metrics_exporter_prometheus::Matcher::Full(DURATION_METRIC.to_string()),
        DURATION_BUCKETS,
    )
}

/// Install the global Prometheus recorder and return a handle for rendering.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

/// Build an isolated recorder; only one global recorder can exist per process.
#[cfg(test)]
pub fn build_recorder() -> metrics_exporter_prometheus::PrometheusRecorder {
    builder()
        .expect("failed to set histogram buckets")
        .build_recorder()
}

/// Record a finished proxied request (status is what the client received).
pub fn record_request(status: u16, method: &str, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!("proxy_requests_total", "status" => status_str.clone(), "method" => method.to_string())
        .increment(1);
    metrics::histogram!(DURATION_METRIC, "status" => status_str).record(duration_secs);
}

/// Record an upstream transport failure with a classification label.
pub fn record_upstream_error(error_type: &str) {
    metrics::counter!("proxy_upstream_errors_total", "error_type" => error_type.to_string())
        .increment(1);
}

/// Record a request rejected for a missing or unknown virtual key.
pub fn record_rejection() {
    metrics::counter!("proxy_auth_rejections_total").increment(1);
}

/// Counters read by `/health` and the shutdown path.
#[derive(Debug, Clone)]
pub struct ServiceMetrics {
    /// Requests that passed authentication and were forwarded.
    pub requests_total: Arc<AtomicU64>,
    pub rejected_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    /// Forwarded requests whose response body has not finished yet.
    pub in_flight: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self {
            requests_total: Arc::new(AtomicU64::new(0)),
            rejected_total: Arc::new(AtomicU64::new(0)),
            errors_total: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }

    /// Count a forwarded request and hold an in-flight slot until the guard drops.
    pub fn begin_request(&self) -> InFlightGuard {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            in_flight: self.in_flight.clone(),
        }
    }
}

impl Default for ServiceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight gauge when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
