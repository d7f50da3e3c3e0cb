//! Endpoint tests driven through the router without binding a socket.

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use pageperf::scoring::Thresholds;
use pageperf::OptimizerConfig;
use pageperf_server::{router, AppState};

// ─────────────────────── helpers ───────────────────────

fn state() -> Arc<AppState> {
    Arc::new(AppState::new(OptimizerConfig::default()))
}

fn vitals_body(lcp: Value, device: &str) -> String {
    json!({
        "lcp": lcp,
        "inp": null,
        "cls": 0.05,
        "fcp": 1200.0,
        "ttfb": null,
        "deviceType": device,
        "connection": "4g",
        "timestamp": 1_700_000_000_000_i64,
        "userAgent": "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) Mobile",
        "viewport": { "width": 390, "height": 844 }
    })
    .to_string()
}

async fn post_vitals(state: Arc<AppState>, body: String, content_type: &str) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri("/api/performance/vitals")
        .header("content-type", content_type)
        .body(Body::from(body))
        .unwrap();
    let response = router(state).oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

async fn get_health(state: Arc<AppState>) -> Value {
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let response = router(state).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

// ─────────────────────── vitals ───────────────────────

#[tokio::test]
async fn test_poor_lcp_scores_70() {
    let (status, body) =
        post_vitals(state(), vitals_body(json!(5000.0), "mobile"), "application/json").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["score"], json!(70.0));
    assert_eq!(body["issues"], json!(["LCP is poor (5000ms > 4000ms)"]));
}

#[tokio::test]
async fn test_good_page_scores_100() {
    let (status, body) =
        post_vitals(state(), vitals_body(json!(2000.0), "tablet"), "application/json").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["score"], json!(100.0));
    assert_eq!(body["issues"], json!([]));
}

#[tokio::test]
async fn test_beacon_text_plain_is_accepted() {
    let (status, body) =
        post_vitals(state(), vitals_body(json!(null), "mobile"), "text/plain;charset=UTF-8").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["score"], json!(100.0));
}

#[tokio::test]
async fn test_negative_metric_is_rejected() {
    let (status, body) =
        post_vitals(state(), vitals_body(json!(-5.0), "mobile"), "application/json").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("lcp"));
}

#[tokio::test]
async fn test_malformed_body_is_rejected() {
    let (status, body) = post_vitals(state(), "{\"lcp\":".to_string(), "application/json").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().starts_with("Invalid payload"));
}

#[tokio::test]
async fn test_unknown_device_type_is_rejected() {
    let (status, _) =
        post_vitals(state(), vitals_body(json!(1000.0), "watch"), "application/json").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_desktop_threshold_override_applies_to_desktop_only() {
    let mut table = Thresholds::default();
    table.lcp.poor = 6000.0;
    table.lcp.needs_improvement = 5500.0;
    let config = OptimizerConfig {
        desktop_thresholds: Some(table),
        ..OptimizerConfig::default()
    };
    let shared = Arc::new(AppState::new(config));

    let (_, desktop) =
        post_vitals(shared.clone(), vitals_body(json!(5000.0), "desktop"), "application/json").await;
    assert_eq!(desktop["score"], json!(100.0));

    let (_, mobile) =
        post_vitals(shared, vitals_body(json!(5000.0), "mobile"), "application/json").await;
    assert_eq!(mobile["score"], json!(70.0));
}

// ─────────────────────── health ───────────────────────

#[tokio::test]
async fn test_health_counts_accepted_reports() {
    let shared = state();
    let before = get_health(shared.clone()).await;
    assert_eq!(before["status"], "ok");
    assert_eq!(before["reports"], 0);

    post_vitals(shared.clone(), vitals_body(json!(2000.0), "mobile"), "application/json").await;
    post_vitals(shared.clone(), vitals_body(json!(-1.0), "mobile"), "application/json").await;

    let after = get_health(shared.clone()).await;
    assert_eq!(after["reports"], 1);
    assert_eq!(shared.reports(), 1);
}
