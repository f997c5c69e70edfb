//! Admission webhook server.
//!
//! Serves `POST /mutate` together with the probe and metrics routes on a
//! single TLS listener. The listener reads its certificate from a
//! [`CertificateStore`], so rotations take effect on the next handshake.
//!
//! To enable the webhook:
//! 1. Issue a serving certificate (e.g. with cert-manager)
//! 2. Mount it at /etc/webhook/certs/
//! 3. Create a MutatingWebhookConfiguration pointing at `/mutate`

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    Router,
    body::Bytes,
    extract::State,
    http::{StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::post,
};
use axum_server::Handle;
use kube::core::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionReview, Operation};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::middleware::{RateLimit, enforce_timeout, limit_rate, log_requests};
use super::mutation::{MutationError, SubstitutionMutator};
use super::rate_limit::RateLimiter;
use crate::error::Error;
use crate::health::{self, HealthState};
use crate::tls::CertificateStore;

/// Default listen address
pub const DEFAULT_SERVER_ADDRESS: &str = ":8443";
/// Default token bucket rate and burst for `/mutate`
pub const DEFAULT_RATE_LIMIT: u32 = 100;
/// Default per-request timeout
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared state for webhook handlers
pub struct WebhookState {
    pub mutator: SubstitutionMutator,
    pub health: Arc<HealthState>,
}

impl WebhookState {
    pub fn new(mutator: SubstitutionMutator, health: Arc<HealthState>) -> Self {
        Self { mutator, health }
    }
}

/// Router tuning that does not belong in handler state
#[derive(Clone, Copy, Debug)]
pub struct RouterOptions {
    /// Requests per second (and burst) allowed on `/mutate`; 0 disables limiting
    pub rate_limit: u32,
    pub request_timeout: Duration,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            rate_limit: DEFAULT_RATE_LIMIT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Create the webhook router, probes and metrics included
pub fn create_webhook_router(state: Arc<WebhookState>, options: RouterOptions) -> Router {
    let health = state.health.clone();

    let mut router = Router::new()
        .route("/mutate", post(mutate))
        .with_state(state);

    if options.rate_limit > 0 {
        let limiter = Arc::new(RateLimiter::new(options.rate_limit, options.rate_limit));
        router = router.route_layer(middleware::from_fn_with_state(
            RateLimit::new(limiter, health.clone()),
            limit_rate,
        ));
    }

    router
        .merge(health::create_router(health))
        .layer(middleware::from_fn_with_state(
            options.request_timeout,
            enforce_timeout,
        ))
        .layer(middleware::from_fn(log_requests))
}

/// Metric label for an admission operation
fn operation_label(operation: &Operation) -> &'static str {
    match operation {
        Operation::Create => "CREATE",
        Operation::Update => "UPDATE",
        Operation::Delete => "DELETE",
        Operation::Connect => "CONNECT",
    }
}

fn bad_request(state: &WebhookState, message: String) -> Response {
    warn!(error = %message, "Rejecting malformed admission review");
    state.health.metrics.record_admission_error("decode");
    (StatusCode::BAD_REQUEST, message).into_response()
}

fn internal_error(state: &WebhookState, uid: &str, error: MutationError) -> Response {
    let error = Error::from(error);
    error!(uid = %uid, error = %error, "Failed to encode admission response");
    state.health.metrics.record_admission_error("encode");
    (StatusCode::INTERNAL_SERVER_ERROR, error.to_string()).into_response()
}

/// Mutating admission handler.
///
/// The body is decoded by hand so that malformed reviews are answered with
/// 400 and a plain-text reason.
async fn mutate(State(state): State<Arc<WebhookState>>, body: Bytes) -> Response {
    let started = Instant::now();

    let review: AdmissionReview<DynamicObject> = match serde_json::from_slice(&body) {
        Ok(review) => review,
        Err(e) => return bad_request(&state, format!("could not decode admission review: {e}")),
    };

    let request: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(request) => request,
        Err(e) => return bad_request(&state, format!("invalid admission review: {e}")),
    };

    info!(
        uid = %request.uid,
        kind = %request.kind.kind,
        resource = %request.resource.resource,
        name = %request.name,
        namespace = ?request.namespace,
        operation = operation_label(&request.operation),
        "Processing admission request"
    );

    let mutation = match state.mutator.decide(&request) {
        Ok(mutation) => mutation,
        Err(e) => return internal_error(&state, &request.uid, e),
    };

    if let Some(patch) = &mutation.response.patch {
        debug!(
            uid = %request.uid,
            operations = mutation.operations,
            patch = %String::from_utf8_lossy(patch),
            "Generated patch"
        );
    }

    let body = match serde_json::to_vec(&mutation.response.into_review()) {
        Ok(body) => body,
        Err(e) => return internal_error(&state, &request.uid, MutationError::EncodeReview(e)),
    };

    let elapsed = started.elapsed().as_secs_f64();
    state.health.metrics.record_admission(
        &request.kind.kind,
        operation_label(&request.operation),
        mutation.outcome.as_str(),
        elapsed,
    );
    info!(
        uid = %request.uid,
        outcome = %mutation.outcome,
        "Admission request allowed"
    );

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}

/// Errors that can occur when running the webhook server
#[derive(Error, Debug)]
pub enum WebhookError {
    /// The listener could not be bound or failed while serving
    #[error("webhook server on {addr} failed: {source}")]
    Serve {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Run the webhook server with TLS until `handle` is shut down.
pub async fn run_webhook_server(
    addr: SocketAddr,
    store: &CertificateStore,
    app: Router,
    handle: Handle,
) -> Result<(), WebhookError> {
    info!(%addr, "Webhook server listening with TLS");

    axum_server::bind_rustls(addr, store.rustls_config())
        .handle(handle)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .map_err(|source| WebhookError::Serve { addr, source })
}
