//! Prometheus metrics.
//!
//! - HTTP request count and latency, labelled by route template
//! - Admission outcomes
//! - Response cache hits, misses and writes
//! - Shared store failures by caller

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::MatchedPath,
    http::Request,
    middleware::Next,
    response::Response,
};
use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metric names as constants for consistency.
pub mod names {
    pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";

    pub const RATE_LIMIT_DECISIONS_TOTAL: &str = "rate_limit_decisions_total";

    pub const CACHE_HITS_TOTAL: &str = "response_cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "response_cache_misses_total";
    pub const CACHE_STORES_TOTAL: &str = "response_cache_stores_total";

    pub const STORE_ERRORS_TOTAL: &str = "shared_store_errors_total";
}

/// Install the Prometheus recorder.
///
/// Returns `true` if initialization succeeded, `false` if already initialized.
pub fn init_metrics() -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        tracing::debug!("Prometheus metrics already initialized");
        return false;
    }

    // Pull-based: /metrics renders the handle directly.
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if PROMETHEUS_HANDLE.set(handle).is_err() {
                tracing::warn!("Failed to store Prometheus handle (already set)");
                return false;
            }
            tracing::info!("Prometheus metrics initialized");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to install Prometheus recorder");
            false
        }
    }
}

/// Render all metrics in Prometheus text format.
///
/// Returns `None` if metrics were not initialized.
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|handle| handle.render())
}

// =============================================================================
// HTTP
// =============================================================================

pub fn record_http_request(method: &str, route: &str, status: u16, duration: Duration) {
    let status_class = match status {
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "other",
    };

    counter!(
        names::HTTP_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "route" => route.to_string(),
        "status" => status.to_string(),
        "status_class" => status_class
    )
    .increment(1);

    histogram!(
        names::HTTP_REQUEST_DURATION_SECONDS,
        "method" => method.to_string(),
        "route" => route.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Middleware recording [`record_http_request`] for every request.
///
/// Unmatched paths share one label so scanners cannot inflate cardinality.
pub async fn track_http(req: Request<Body>, next: Next) -> Response {
    let method = req.method().as_str().to_string();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let started = Instant::now();

    let res = next.run(req).await;
    record_http_request(&method, &route, res.status().as_u16(), started.elapsed());
    res
}

// =============================================================================
// Admission and cache
// =============================================================================

/// `outcome` is one of `allowed`, `rejected`, `unchecked` (fail-open) or
/// `refused` (fail-closed).
pub fn record_admission(outcome: &'static str) {
    counter!(names::RATE_LIMIT_DECISIONS_TOTAL, "outcome" => outcome).increment(1);
}

pub fn record_cache_hit() {
    counter!(names::CACHE_HITS_TOTAL).increment(1);
}

pub fn record_cache_miss() {
    counter!(names::CACHE_MISSES_TOTAL).increment(1);
}

pub fn record_cache_store() {
    counter!(names::CACHE_STORES_TOTAL).increment(1);
}

/// A shared store operation failed; `component` is the caller.
pub fn record_store_error(component: &'static str) {
    counter!(names::STORE_ERRORS_TOTAL, "component" => component).increment(1);
}
