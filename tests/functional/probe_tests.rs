//! Probes, metrics and the middleware stack.

use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::middleware;
use axum::routing::get;
use tower::ServiceExt;

use flux_substitute_webhook::RouterOptions;
use flux_substitute_webhook::webhooks::middleware::{REQUEST_ID_HEADER, enforce_timeout};

use crate::TestWebhook;
use crate::common::fixtures::AdmissionReviewBuilder;

#[tokio::test]
async fn test_health_always_ok() {
    let webhook = TestWebhook::new(&[]).await;
    let (status, _, body) = webhook.get("/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"OK");
}

#[tokio::test]
async fn test_ready_with_substitutions() {
    let webhook = TestWebhook::new(&[("K", "v")]).await;
    let (status, _, body) = webhook.get("/ready").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"Ready");
}

#[tokio::test]
async fn test_not_ready_without_substitutions() {
    let webhook = TestWebhook::new(&[]).await;
    let (status, _, body) = webhook.get("/ready").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(&body[..], b"Configuration not loaded");
}

#[tokio::test]
async fn test_not_ready_after_shutdown_begins() {
    let webhook = TestWebhook::new(&[("K", "v")]).await;
    webhook.health.set_ready(false).await;

    let (status, _, _) = webhook.get("/ready").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_metrics_exposition() {
    let webhook = TestWebhook::new(&[("A", "1"), ("B", "2")]).await;
    let (status, headers, body) = webhook.get("/metrics").await;

    assert_eq!(status, StatusCode::OK);
    assert!(
        headers["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/plain")
    );
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("substitute_webhook_substitutions 2"));
}

#[tokio::test]
async fn test_request_id_is_echoed() {
    let webhook = TestWebhook::new(&[]).await;
    let request = Request::builder()
        .uri("/health")
        .header(REQUEST_ID_HEADER, "req-42")
        .body(Body::empty())
        .unwrap();

    let (_, headers, _) = webhook.send(request).await;
    assert_eq!(headers[REQUEST_ID_HEADER], "req-42");
}

#[tokio::test]
async fn test_request_id_is_generated() {
    let webhook = TestWebhook::new(&[]).await;
    let (_, headers, _) = webhook.get("/health").await;

    let id = headers[REQUEST_ID_HEADER].to_str().unwrap();
    assert!(uuid::Uuid::parse_str(id).is_ok());
}

#[tokio::test]
async fn test_mutate_is_rate_limited() {
    let options = RouterOptions {
        rate_limit: 2,
        ..RouterOptions::default()
    };
    let webhook = TestWebhook::with_options(&[("K", "v")], options).await;
    let body = || AdmissionReviewBuilder::new("uid-rl").body();

    assert_eq!(webhook.mutate(body()).await.0, StatusCode::OK);
    assert_eq!(webhook.mutate(body()).await.0, StatusCode::OK);
    assert_eq!(
        webhook.mutate(body()).await.0,
        StatusCode::TOO_MANY_REQUESTS
    );

    let encoded = webhook.health.metrics.encode();
    assert!(encoded.contains("substitute_webhook_rate_limited_total 1"));
}

#[tokio::test]
async fn test_probes_are_not_rate_limited() {
    let options = RouterOptions {
        rate_limit: 1,
        ..RouterOptions::default()
    };
    let webhook = TestWebhook::with_options(&[("K", "v")], options).await;

    for _ in 0..5 {
        assert_eq!(webhook.get("/health").await.0, StatusCode::OK);
    }
}

#[tokio::test]
async fn test_zero_rate_limit_disables_limiting() {
    let options = RouterOptions {
        rate_limit: 0,
        ..RouterOptions::default()
    };
    let webhook = TestWebhook::with_options(&[("K", "v")], options).await;

    for i in 0..5 {
        let body = AdmissionReviewBuilder::new(format!("uid-{i}")).body();
        assert_eq!(webhook.mutate(body).await.0, StatusCode::OK);
    }
}

#[tokio::test(start_paused = true)]
async fn test_slow_handler_times_out() {
    let router = Router::new()
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                "done"
            }),
        )
        .layer(middleware::from_fn_with_state(
            Duration::from_secs(1),
            enforce_timeout,
        ));

    let request = Request::builder().uri("/slow").body(Body::empty()).unwrap();
    let response = router.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}
