use crate::error::{AppError, Result};
use axum::{
    body::Body,
    extract::{Request, State},
    http::{Response, StatusCode},
    middleware::Next,
    response::IntoResponse,
};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Metrics service for collecting and exposing Prometheus metrics
#[derive(Clone)]
pub struct MetricsService {
    handle: Arc<PrometheusHandle>,
}

impl MetricsService {
    /// Create a new metrics service
    pub fn new() -> Result<Self> {
        let handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
            AppError::Internal(format!("Failed to install metrics recorder: {}", e))
        })?;

        Self::register_metrics();

        info!("Metrics service initialized successfully");

        Ok(Self {
            handle: Arc::new(handle),
        })
    }

    /// Register all metrics with descriptions
    fn register_metrics() {
        describe_counter!(
            "clubguard_requests_total",
            "Total number of HTTP requests received"
        );
        describe_histogram!(
            "clubguard_request_duration_seconds",
            "HTTP request latencies in seconds"
        );

        describe_counter!(
            "clubguard_rate_limit_decisions_total",
            "Rate limit decisions by policy and outcome"
        );
        describe_counter!(
            "clubguard_rate_limit_store_errors_total",
            "Rate limit checks that failed open because the store errored"
        );

        describe_counter!(
            "clubguard_cache_lookups_total",
            "Response cache lookups by tier and result"
        );
        describe_counter!(
            "clubguard_cache_store_errors_total",
            "Response cache store errors by operation"
        );
        describe_counter!(
            "clubguard_cache_invalidated_keys_total",
            "Cache keys removed by invalidation"
        );

        debug!("All metrics registered with descriptions");
    }

    /// Render metrics in Prometheus format
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// Metrics endpoint handler
pub async fn metrics_handler(State(service): State<Option<MetricsService>>) -> impl IntoResponse {
    match service {
        Some(service) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "text/plain; version=0.0.4")
            .body(Body::from(service.render()))
            .unwrap_or_else(|_| Response::new(Body::empty())),
        None => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::from("metrics disabled"))
            .unwrap_or_else(|_| Response::new(Body::empty())),
    }
}

/// Middleware timing every request
pub async fn metrics_middleware(req: Request, next: Next) -> axum::response::Response {
    let timer = Timer::new(req.method().to_string(), req.uri().path().to_string());
    let response = next.run(req).await;
    timer.record(response.status().as_u16());
    response
}

/// Record a request metric
pub fn record_request(method: &str, path: &str, status: u16, duration: f64) {
    let labels = [
        ("method", method.to_string()),
        ("path", sanitize_path(path)),
        ("status", status.to_string()),
    ];

    counter!("clubguard_requests_total", &labels).increment(1);
    histogram!("clubguard_request_duration_seconds", &labels).record(duration);
}

/// Record a rate limit decision
pub fn record_rate_limit_decision(policy: &str, allowed: bool) {
    let labels = [
        ("policy", policy.to_string()),
        (
            "outcome",
            if allowed { "allowed" } else { "rejected" }.to_string(),
        ),
    ];
    counter!("clubguard_rate_limit_decisions_total", &labels).increment(1);
}

/// Record a rate limit check that failed open
pub fn record_rate_limit_store_error(policy: &str) {
    let labels = [("policy", policy.to_string())];
    counter!("clubguard_rate_limit_store_errors_total", &labels).increment(1);
}

/// Record a response cache lookup (`hit`, `miss`, `not_modified`)
pub fn record_cache_lookup(tier: &str, result: &str) {
    let labels = [("tier", tier.to_string()), ("result", result.to_string())];
    counter!("clubguard_cache_lookups_total", &labels).increment(1);
}

/// Record a response cache store error
pub fn record_cache_store_error(op: &str) {
    let labels = [("op", op.to_string())];
    counter!("clubguard_cache_store_errors_total", &labels).increment(1);
}

/// Record keys removed by invalidation
pub fn record_cache_invalidation(removed: u64) {
    counter!("clubguard_cache_invalidated_keys_total").increment(removed);
}

/// Sanitize path for metrics to avoid cardinality explosion
/// Replaces path parameters with placeholders
fn sanitize_path(path: &str) -> String {
    path.split('/')
        .map(|seg| {
            if seg.is_empty() {
                String::new()
            } else if is_likely_id(seg) {
                ":id".to_string()
            } else {
                seg.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Check if a path segment is likely an ID (numeric, UUID, etc.)
fn is_likely_id(segment: &str) -> bool {
    // Telegram ids and database ids
    if segment.chars().all(|c| c.is_numeric()) {
        return true;
    }

    if segment.len() >= 32 && segment.contains('-') {
        return segment.chars().all(|c| c.is_ascii_hexdigit() || c == '-');
    }

    false
}

/// Timer for measuring request duration
pub struct Timer {
    start: Instant,
    method: String,
    path: String,
}

impl Timer {
    /// Start a new timer for a request
    pub fn new(method: String, path: String) -> Self {
        Self {
            start: Instant::now(),
            method,
            path,
        }
    }

    /// Record the elapsed time with the given status code
    pub fn record(self, status: u16) {
        let duration = self.start.elapsed().as_secs_f64();
        record_request(&self.method, &self.path, status, duration);
    }
}
