//! Admission decisions through the `/mutate` endpoint.

use axum::http::StatusCode;
use serde_json::{Value, json};

use crate::common::fixtures::AdmissionReviewBuilder;
use crate::{TestWebhook, patch_of};

#[tokio::test]
async fn test_scenario_a_empty_spec() {
    let webhook = TestWebhook::new(&[("TEST_KEY", "test_value")]).await;
    let body = AdmissionReviewBuilder::new("uid-a").body();

    let response = webhook.review(body).await;

    assert_eq!(response.uid, "uid-a");
    assert!(response.allowed);
    assert_eq!(
        patch_of(&response),
        Some(json!([
            {"op": "add", "path": "/spec/postBuild", "value": {}},
            {"op": "add", "path": "/spec/postBuild/substitute", "value": {}},
            {"op": "add", "path": "/spec/postBuild/substitute/TEST_KEY", "value": "test_value"}
        ]))
    );
}

#[tokio::test]
async fn test_scenario_b_other_kind_passes_through() {
    let webhook = TestWebhook::new(&[("TEST_KEY", "test_value")]).await;
    let body = AdmissionReviewBuilder::new("uid-b")
        .core_kind("ConfigMap", "configmaps")
        .without_spec()
        .body();

    let response = webhook.review(body).await;

    assert_eq!(response.uid, "uid-b");
    assert!(response.allowed);
    assert!(response.patch.is_none());
}

#[tokio::test]
async fn test_scenario_c_delete_passes_through() {
    let webhook = TestWebhook::new(&[("TEST_KEY", "test_value")]).await;
    let body = AdmissionReviewBuilder::new("uid-c")
        .operation("DELETE")
        .without_object()
        .body();

    let response = webhook.review(body).await;

    assert_eq!(response.uid, "uid-c");
    assert!(response.allowed);
    assert!(response.patch.is_none());
}

#[tokio::test]
async fn test_scenario_d_slash_in_key_is_escaped() {
    let webhook = TestWebhook::new(&[("a/b", "x")]).await;
    let body = AdmissionReviewBuilder::new("uid-d")
        .spec(json!({"postBuild": {"substitute": {}}}))
        .body();

    let response = webhook.review(body).await;

    assert_eq!(
        patch_of(&response),
        Some(json!([
            {"op": "add", "path": "/spec/postBuild/substitute/a~1b", "value": "x"}
        ]))
    );
}

#[tokio::test]
async fn test_terminating_object_passes_through() {
    let webhook = TestWebhook::new(&[("TEST_KEY", "test_value")]).await;
    let body = AdmissionReviewBuilder::new("uid-term")
        .operation("UPDATE")
        .deleting()
        .body();

    let response = webhook.review(body).await;

    assert!(response.allowed);
    assert!(response.patch.is_none());
}

#[tokio::test]
async fn test_connect_without_object_passes_through() {
    let webhook = TestWebhook::new(&[("TEST_KEY", "test_value")]).await;
    let body = AdmissionReviewBuilder::new("uid-connect")
        .operation("CONNECT")
        .without_object()
        .body();

    let response = webhook.review(body).await;

    assert!(response.allowed);
    assert!(response.patch.is_none());
}

#[tokio::test]
async fn test_existing_substitutions_are_kept_and_extended() {
    let webhook = TestWebhook::new(&[("CLUSTER", "prod")]).await;
    let body = AdmissionReviewBuilder::new("uid-update")
        .operation("UPDATE")
        .spec(json!({"postBuild": {"substitute": {"APP": "web"}}}))
        .body();

    let response = webhook.review(body).await;

    assert_eq!(
        patch_of(&response),
        Some(json!([
            {"op": "add", "path": "/spec/postBuild/substitute/CLUSTER", "value": "prod"}
        ]))
    );
}

#[tokio::test]
async fn test_empty_map_with_containers_present_yields_no_patch() {
    let webhook = TestWebhook::new(&[]).await;
    let body = AdmissionReviewBuilder::new("uid-empty")
        .spec(json!({"postBuild": {"substitute": {}}}))
        .body();

    let response = webhook.review(body).await;

    assert!(response.allowed);
    assert!(response.patch.is_none());
}

#[tokio::test]
async fn test_patch_type_is_json_patch() {
    let webhook = TestWebhook::new(&[("K", "v")]).await;
    let (status, _, bytes) = webhook
        .mutate(AdmissionReviewBuilder::new("uid-pt").body())
        .await;

    assert_eq!(status, StatusCode::OK);
    let review: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(review["apiVersion"], "admission.k8s.io/v1");
    assert_eq!(review["kind"], "AdmissionReview");
    assert_eq!(review["response"]["patchType"], "JSONPatch");
    assert_eq!(review["response"]["uid"], "uid-pt");
}

#[tokio::test]
async fn test_malformed_json_is_bad_request() {
    let webhook = TestWebhook::new(&[("K", "v")]).await;
    let (status, _, body) = webhook.mutate("{not json").await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(!body.is_empty());
}

#[tokio::test]
async fn test_review_without_request_is_bad_request() {
    let webhook = TestWebhook::new(&[("K", "v")]).await;
    let body = json!({"apiVersion": "admission.k8s.io/v1", "kind": "AdmissionReview"});

    let (status, _, _) = webhook.mutate(body.to_string()).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_object_that_is_not_a_document_is_bad_request() {
    let webhook = TestWebhook::new(&[("K", "v")]).await;
    let mut review = AdmissionReviewBuilder::new("uid-bad").build();
    review["request"]["object"] = json!("not an object");

    let (status, _, _) = webhook.mutate(review.to_string()).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_decode_errors_are_counted() {
    let webhook = TestWebhook::new(&[("K", "v")]).await;
    webhook.mutate("garbage").await;

    let encoded = webhook.health.metrics.encode();
    assert!(encoded.contains("reason=\"decode\""));
}

#[tokio::test]
async fn test_admissions_are_counted_by_outcome() {
    let webhook = TestWebhook::new(&[("K", "v")]).await;
    webhook
        .review(AdmissionReviewBuilder::new("uid-1").body())
        .await;
    webhook
        .review(
            AdmissionReviewBuilder::new("uid-2")
                .core_kind("ConfigMap", "configmaps")
                .body(),
        )
        .await;

    let encoded = webhook.health.metrics.encode();
    assert!(encoded.contains("outcome=\"patched\""));
    assert!(encoded.contains("outcome=\"skipped_kind\""));
    assert!(encoded.contains("operation=\"CREATE\""));
}

#[tokio::test]
async fn test_get_on_mutate_is_not_allowed() {
    let webhook = TestWebhook::new(&[("K", "v")]).await;
    let (status, _, _) = webhook.get("/mutate").await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
}
