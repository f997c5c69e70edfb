//! Request middleware for the webhook listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{info, warn};
use uuid::Uuid;

use super::rate_limit::RateLimiter;
use crate::health::HealthState;

/// Header carrying the request id in both directions
pub const REQUEST_ID_HEADER: &str = "x-request-id";

const REAL_IP_HEADER: &str = "x-real-ip";
const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Best guess at the client address.
///
/// Proxy headers win over the socket peer: `X-Real-IP` first, then the
/// first hop in `X-Forwarded-For`.
pub fn client_address(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    if let Some(ip) = header(REAL_IP_HEADER) {
        return Some(ip.to_string());
    }

    if let Some(first) = header(FORWARDED_FOR_HEADER)
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return Some(first.to_string());
    }

    peer.map(|addr| addr.ip().to_string())
}

/// Request id from the caller, or a fresh UUID v4
pub fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// Log every request once it has been answered and echo its request id.
pub async fn log_requests(request: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let id = request_id(request.headers());
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client = client_address(request.headers(), peer).unwrap_or_else(|| "unknown".to_string());

    let mut response = next.run(request).await;

    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    info!(
        request_id = %id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started.elapsed().as_secs_f64() * 1000.0,
        client = %client,
        "Request handled"
    );

    response
}

/// State for [`limit_rate`]
#[derive(Clone)]
pub struct RateLimit {
    limiter: Arc<RateLimiter>,
    health: Arc<HealthState>,
}

impl RateLimit {
    pub fn new(limiter: Arc<RateLimiter>, health: Arc<HealthState>) -> Self {
        Self { limiter, health }
    }
}

/// Reject with 429 when the token bucket is empty.
pub async fn limit_rate(State(state): State<RateLimit>, request: Request, next: Next) -> Response {
    if state.limiter.try_acquire() {
        return next.run(request).await;
    }

    state.health.metrics.record_rate_limited();
    warn!(path = %request.uri().path(), "Rate limit exceeded");
    (StatusCode::TOO_MANY_REQUESTS, "Too many requests").into_response()
}

/// Abort handlers that run longer than the configured timeout with 503.
pub async fn enforce_timeout(
    State(timeout): State<Duration>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    match tokio::time::timeout(timeout, next.run(request)).await {
        Ok(response) => response,
        Err(_) => {
            warn!(path = %path, timeout_secs = timeout.as_secs_f64(), "Request timed out");
            (StatusCode::SERVICE_UNAVAILABLE, "Request timed out").into_response()
        }
    }
}
