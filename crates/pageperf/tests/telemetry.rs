//! Observer -> reporter -> HTTP endpoint, against a mock server.

use std::time::Duration;

use assert_json_diff::assert_json_include;
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use pageperf::observer::{ChannelTimeline, UnsupportedTimeline};
use pageperf::reporter::{PageInfo, ReportOutcome, VITALS_PATH};
use pageperf::*;

fn signals() -> EnvironmentSignals {
    let mut signals = EnvironmentSignals::viewport(390.0, 844.0);
    signals.user_agent_string = "Mozilla/5.0 (Linux; Android 14) Mobile".to_string();
    signals.touch_points_available = 5;
    signals.connection_effective_type = Some("4g".to_string());
    signals
}

fn reporter_for(server: &MockServer) -> Reporter<HttpTransport> {
    let endpoint = format!("{}{VITALS_PATH}", server.uri());
    Reporter::new(
        HttpTransport::new(&endpoint, Duration::from_secs(5)).unwrap(),
        PageInfo::from_signals(&signals()),
    )
}

fn page_load(timeline: &ChannelTimeline) {
    timeline.emit(PerformanceEntry::Navigation {
        request_start: 20.0,
        response_start: 180.0,
    });
    timeline.emit(PerformanceEntry::Paint {
        name: "first-paint".to_string(),
        start_time: 900.0,
    });
    timeline.emit(PerformanceEntry::Paint {
        name: "first-contentful-paint".to_string(),
        start_time: 1200.0,
    });
    timeline.emit(PerformanceEntry::LayoutShift {
        value: 0.03,
        had_recent_input: false,
    });
    timeline.emit(PerformanceEntry::LargestContentfulPaint { start_time: 1800.0 });
    timeline.emit(PerformanceEntry::LargestContentfulPaint { start_time: 5000.0 });
}

async fn posted_bodies(server: &MockServer) -> Vec<Value> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .map(|request| serde_json::from_slice(&request.body).unwrap())
        .collect()
}

#[tokio::test]
async fn test_observed_vitals_are_posted_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(VITALS_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "score": 70,
            "issues": ["LCP is poor (5000ms > 4000ms)"]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let ctx = classify(&signals());
    let reporter = reporter_for(&server);
    let timeline = ChannelTimeline::new();
    let mut stream = observe(&timeline);
    page_load(&timeline);

    // Let the final LCP candidate land so the reported value is deterministic.
    let mut settled = stream.subscribe();
    tokio::time::timeout(
        Duration::from_secs(1),
        settled.wait_for(|r| r.lcp_ms == Some(5000.0) && r.ttfb_ms.is_some() && r.cls_score.is_some()),
    )
    .await
    .expect("timed out")
    .expect("stream closed");

    let outcome = reporter.report_when_ready(stream.subscribe(), &ctx).await;
    let ReportOutcome::Dispatched(handle) = outcome else {
        panic!("expected a dispatched report, got {outcome:?}");
    };
    handle.await.unwrap();
    assert!(reporter.has_sent());

    // Later entries do not trigger a second report.
    timeline.emit(PerformanceEntry::Event {
        interaction_id: 7,
        duration: 140.0,
    });
    let again = reporter.report(&stream.snapshot(), &ctx);
    assert!(matches!(again, ReportOutcome::AlreadySent));
    stream.unsubscribe().await;

    let bodies = posted_bodies(&server).await;
    assert_eq!(bodies.len(), 1);
    assert_json_include!(
        actual: bodies[0].clone(),
        expected: json!({
            "lcp": 5000.0,
            "fcp": 1200.0,
            "cls": 0.03,
            "ttfb": 160.0,
            "deviceType": "mobile",
            "connection": "4g",
            "userAgent": "Mozilla/5.0 (Linux; Android 14) Mobile",
            "viewport": { "width": 390, "height": 844 }
        })
    );
    assert!(bodies[0]["timestamp"].as_i64().unwrap() > 0);
}

#[tokio::test]
async fn test_endpoint_failure_is_swallowed_and_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(VITALS_PATH))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;

    let ctx = classify(&signals());
    let reporter = reporter_for(&server);
    let record = VitalsRecord {
        lcp_ms: Some(2100.0),
        fcp_ms: Some(800.0),
        ..VitalsRecord::now()
    };

    match reporter.report(&record, &ctx) {
        ReportOutcome::Dispatched(handle) => handle.await.unwrap(),
        other => panic!("expected dispatch, got {other:?}"),
    }
    assert!(matches!(
        reporter.report(&record, &ctx),
        ReportOutcome::AlreadySent
    ));
}

#[tokio::test]
async fn test_transport_surfaces_error_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(VITALS_PATH))
        .respond_with(ResponseTemplate::new(400))
        .mount(&server)
        .await;

    let endpoint = format!("{}{VITALS_PATH}", server.uri());
    let transport = HttpTransport::new(&endpoint, Duration::from_secs(5)).unwrap();
    let payload = VitalsPayload::new(
        &VitalsRecord::empty(1),
        &classify(&signals()),
        &PageInfo::from_signals(&signals()),
    );
    let err = transport.send(&payload).await.unwrap_err();
    assert!(matches!(err, PerfError::Telemetry(_)));
}

#[tokio::test]
async fn test_unsupported_timeline_never_reports() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let reporter = reporter_for(&server);
    let mut stream = observe(&UnsupportedTimeline);
    assert!(!stream.is_active());

    let outcome = reporter
        .report_when_ready(stream.subscribe(), &classify(&signals()))
        .await;
    assert!(matches!(outcome, ReportOutcome::Insufficient));
    assert!(!reporter.has_sent());
}
