//! Probes and Prometheus metrics.
//!
//! Provides:
//! - `/health` - Liveness probe (always returns 200 if the server is running)
//! - `/ready` - Readiness probe (returns 200 once substitutions are loaded)
//! - `/metrics` - Prometheus metrics endpoint

use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use tokio::sync::RwLock;

/// Labels for admission request metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct AdmissionLabels {
    pub kind: String,
    pub operation: String,
    pub outcome: String,
}

/// Labels for admission errors (`decode` or `encode`)
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub reason: String,
}

/// Labels for certificate reloads (`success` or `failure`)
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReloadLabels {
    pub result: String,
}

/// Shared metrics for the webhook
pub struct Metrics {
    /// Admission reviews answered, by kind, operation and outcome
    pub admission_requests_total: Family<AdmissionLabels, Counter>,
    /// Admission reviews that failed to decode or encode
    pub admission_errors_total: Family<ErrorLabels, Counter>,
    /// Time spent answering an admission review
    pub admission_duration_seconds: Histogram,
    /// Requests rejected by the rate limiter
    pub rate_limited_total: Counter,
    /// Certificate reload attempts
    pub certificate_reloads_total: Family<ReloadLabels, Counter>,
    /// Number of substitutions loaded at startup
    pub substitutions: Gauge,
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Create a new metrics instance with registered metrics
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("substitute_webhook");

        let admission_requests_total = Family::<AdmissionLabels, Counter>::default();
        registry.register(
            "admission_requests",
            "Total number of admission reviews answered",
            admission_requests_total.clone(),
        );

        let admission_errors_total = Family::<ErrorLabels, Counter>::default();
        registry.register(
            "admission_errors",
            "Total number of admission reviews that could not be decoded or encoded",
            admission_errors_total.clone(),
        );

        // 10us .. ~160ms
        let admission_duration_seconds = Histogram::new(exponential_buckets(0.00001, 2.0, 15));
        registry.register(
            "admission_duration_seconds",
            "Time spent answering an admission review in seconds",
            admission_duration_seconds.clone(),
        );

        let rate_limited_total = Counter::default();
        registry.register(
            "rate_limited",
            "Total number of requests rejected by the rate limiter",
            rate_limited_total.clone(),
        );

        let certificate_reloads_total = Family::<ReloadLabels, Counter>::default();
        registry.register(
            "certificate_reloads",
            "Total number of TLS certificate reload attempts",
            certificate_reloads_total.clone(),
        );

        let substitutions = Gauge::default();
        registry.register(
            "substitutions",
            "Number of substitutions loaded at startup",
            substitutions.clone(),
        );

        Self {
            admission_requests_total,
            admission_errors_total,
            admission_duration_seconds,
            rate_limited_total,
            certificate_reloads_total,
            substitutions,
            registry,
        }
    }

    /// Record an answered admission review
    pub fn record_admission(&self, kind: &str, operation: &str, outcome: &str, duration_secs: f64) {
        let labels = AdmissionLabels {
            kind: kind.to_string(),
            operation: operation.to_string(),
            outcome: outcome.to_string(),
        };
        self.admission_requests_total.get_or_create(&labels).inc();
        self.admission_duration_seconds.observe(duration_secs);
    }

    /// Record a review that failed to decode (`decode`) or encode (`encode`)
    pub fn record_admission_error(&self, reason: &'static str) {
        let labels = ErrorLabels {
            reason: reason.to_string(),
        };
        self.admission_errors_total.get_or_create(&labels).inc();
    }

    /// Record a rate-limited request
    pub fn record_rate_limited(&self) {
        self.rate_limited_total.inc();
    }

    /// Record a certificate reload attempt
    pub fn record_certificate_reload(&self, success: bool) {
        let labels = ReloadLabels {
            result: if success { "success" } else { "failure" }.to_string(),
        };
        self.certificate_reloads_total.get_or_create(&labels).inc();
    }

    pub fn set_substitutions(&self, count: usize) {
        self.substitutions.set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    /// Encode metrics to Prometheus text format
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if encode(&mut buffer, &self.registry).is_err() {
            tracing::error!("Failed to encode metrics");
            return "# Error encoding metrics".to_string();
        }
        buffer
    }
}

/// Shared state for the probe and metrics handlers
pub struct HealthState {
    /// Whether a non-empty substitution map is loaded and the server is not shutting down
    ready: RwLock<bool>,
    /// Metrics registry
    pub metrics: Metrics,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Create a new health state (starts as not ready)
    pub fn new() -> Self {
        Self {
            ready: RwLock::new(false),
            metrics: Metrics::new(),
        }
    }

    /// Mark the webhook as ready or not ready
    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    /// Check if the webhook is ready
    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }
}

/// Liveness probe handler
///
/// Returns 200 OK if the process is alive.
async fn health() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Readiness probe handler
///
/// Returns 200 OK once substitutions are loaded.
/// Returns 503 Service Unavailable otherwise.
async fn ready(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready().await {
        (StatusCode::OK, "Ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Configuration not loaded").into_response()
    }
}

async fn metrics_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let body = state.metrics.encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Create the probe and metrics router
pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}
