//! Telemetry reporter: best-effort, at-most-once delivery of the page's vitals.
//!
//! A report is sent once LCP and FCP are known, never more than once per
//! page load. Transport failures are logged and dropped: no retry, nothing
//! surfaced to the page.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::classifier::EnvironmentSignals;
use crate::scoring;
use crate::types::{ConnectionTier, DeviceContext, DeviceTier, PerfError, PerfResult, VitalsRecord};

/// Path of the vitals endpoint on the site's backend.
pub const VITALS_PATH: &str = "/api/performance/vitals";

/// Viewport dimensions in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// Per-page facts included in every report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub user_agent: String,
    pub viewport: Viewport,
}

impl PageInfo {
    pub fn from_signals(signals: &EnvironmentSignals) -> Self {
        let px = |v: f64| if v.is_finite() && v > 0.0 { v.round() as u32 } else { 0 };
        Self {
            user_agent: signals.user_agent_string.clone(),
            viewport: Viewport {
                width: px(signals.viewport_width),
                height: px(signals.viewport_height),
            },
        }
    }
}

/// JSON body of `POST /api/performance/vitals`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VitalsPayload {
    pub lcp: Option<f64>,
    pub inp: Option<f64>,
    pub cls: Option<f64>,
    pub fcp: Option<f64>,
    pub ttfb: Option<f64>,
    pub device_type: DeviceTier,
    pub connection: ConnectionTier,
    pub timestamp: i64,
    pub user_agent: String,
    pub viewport: Viewport,
}

impl VitalsPayload {
    pub fn new(record: &VitalsRecord, ctx: &DeviceContext, page: &PageInfo) -> Self {
        Self {
            lcp: record.lcp_ms,
            inp: record.inp_ms,
            cls: record.cls_score,
            fcp: record.fcp_ms,
            ttfb: record.ttfb_ms,
            device_type: ctx.device_tier,
            connection: ctx.connection_tier,
            timestamp: record.captured_at_epoch_ms,
            user_agent: page.user_agent.clone(),
            viewport: page.viewport,
        }
    }

    /// The vitals carried by this payload.
    pub fn to_record(&self) -> VitalsRecord {
        VitalsRecord {
            lcp_ms: self.lcp,
            inp_ms: self.inp,
            cls_score: self.cls,
            fcp_ms: self.fcp,
            ttfb_ms: self.ttfb,
            captured_at_epoch_ms: self.timestamp,
        }
    }
}

/// Successful endpoint response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryResponse {
    pub score: f64,
    #[serde(default)]
    pub issues: Vec<String>,
}

/// Delivers payloads to the telemetry endpoint.
#[async_trait]
pub trait TelemetryTransport: Send + Sync {
    async fn send(&self, payload: &VitalsPayload) -> PerfResult<TelemetryResponse>;
}

/// `reqwest`-backed transport posting JSON to the endpoint.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(endpoint: &str, timeout: Duration) -> PerfResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PerfError::Telemetry(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl TelemetryTransport for HttpTransport {
    async fn send(&self, payload: &VitalsPayload) -> PerfResult<TelemetryResponse> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(payload)
            .send()
            .await
            .map_err(|e| PerfError::Telemetry(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(PerfError::Telemetry(format!(
                "endpoint answered {}",
                status.as_u16()
            )));
        }

        resp.json::<TelemetryResponse>()
            .await
            .map_err(|e| PerfError::Telemetry(format!("invalid response body: {e}")))
    }
}

/// Result of a report attempt.
#[derive(Debug)]
pub enum ReportOutcome {
    /// Sent in the background; the handle resolves when delivery finished or failed.
    Dispatched(JoinHandle<()>),
    /// A report already went out for this page load.
    AlreadySent,
    /// LCP or FCP is still missing.
    Insufficient,
}

/// Sends at most one report per page load.
pub struct Reporter<T: TelemetryTransport + 'static> {
    transport: Arc<T>,
    page: PageInfo,
    sent: AtomicBool,
}

impl<T: TelemetryTransport + 'static> Reporter<T> {
    pub fn new(transport: T, page: PageInfo) -> Self {
        Self {
            transport: Arc::new(transport),
            page,
            sent: AtomicBool::new(false),
        }
    }

    /// Whether the one report of this page load has been dispatched.
    pub fn has_sent(&self) -> bool {
        self.sent.load(Ordering::SeqCst)
    }

    /// Fire-and-forget report. Must be called inside a tokio runtime.
    pub fn report(&self, record: &VitalsRecord, ctx: &DeviceContext) -> ReportOutcome {
        if !record.is_reportable() {
            tracing::debug!("vitals not reportable yet (need LCP and FCP)");
            return ReportOutcome::Insufficient;
        }
        if self.sent.swap(true, Ordering::SeqCst) {
            return ReportOutcome::AlreadySent;
        }

        let local = scoring::score(record);
        tracing::debug!(score = local.value, issues = local.deductions.len(), "reporting vitals");

        let payload = VitalsPayload::new(record, ctx, &self.page);
        let transport = Arc::clone(&self.transport);
        let handle = tokio::spawn(async move {
            match transport.send(&payload).await {
                Ok(resp) => {
                    tracing::debug!(score = resp.score, issues = ?resp.issues, "vitals accepted");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "vitals report dropped");
                }
            }
        });
        ReportOutcome::Dispatched(handle)
    }

    /// Wait until the observed record is reportable, then report once.
    ///
    /// The report carries the record as it stood at that moment: the LCP is
    /// the candidate present when FCP and LCP first both existed, and later
    /// candidates are not sent. If the stream ends first, whatever was
    /// recorded is offered as-is.
    pub async fn report_when_ready(
        &self,
        mut vitals: watch::Receiver<VitalsRecord>,
        ctx: &DeviceContext,
    ) -> ReportOutcome {
        let ready = vitals
            .wait_for(VitalsRecord::is_reportable)
            .await
            .map(|record| record.clone());
        let record = match ready {
            Ok(record) => record,
            Err(_) => vitals.borrow().clone(),
        };
        self.report(&record, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::classify;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<VitalsPayload>>,
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl TelemetryTransport for RecordingTransport {
        async fn send(&self, payload: &VitalsPayload) -> PerfResult<TelemetryResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(PerfError::Telemetry("connection refused".to_string()));
            }
            self.sent.lock().await.push(payload.clone());
            Ok(TelemetryResponse {
                score: 100.0,
                issues: Vec::new(),
            })
        }
    }

    fn signals() -> EnvironmentSignals {
        let mut s = EnvironmentSignals::viewport(375.0, 667.0);
        s.user_agent_string = "Mozilla/5.0 (iPhone)".to_string();
        s.connection_effective_type = Some("4g".to_string());
        s
    }

    fn ready_record() -> VitalsRecord {
        VitalsRecord {
            lcp_ms: Some(2100.0),
            inp_ms: None,
            cls_score: Some(0.02),
            fcp_ms: Some(900.0),
            ttfb_ms: Some(120.0),
            captured_at_epoch_ms: 1_760_000_000_000,
        }
    }

    #[test]
    fn test_http_transport_keeps_endpoint() {
        let transport =
            HttpTransport::new("https://harbour.example/api/performance/vitals", Duration::from_secs(3))
                .unwrap();
        assert_eq!(transport.endpoint(), "https://harbour.example/api/performance/vitals");
    }

    #[test]
    fn test_payload_shape() {
        let ctx = classify(&signals());
        let payload = VitalsPayload::new(&ready_record(), &ctx, &PageInfo::from_signals(&signals()));
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["deviceType"], "mobile");
        assert_eq!(json["connection"], "4g");
        assert_eq!(json["viewport"]["width"], 375);
        assert_eq!(json["userAgent"], "Mozilla/5.0 (iPhone)");
        assert!(json["inp"].is_null());
        assert_eq!(payload.to_record(), ready_record());
    }

    #[tokio::test]
    async fn test_insufficient_record_not_sent() {
        let reporter = Reporter::new(RecordingTransport::default(), PageInfo::from_signals(&signals()));
        let ctx = classify(&signals());
        let mut record = ready_record();
        record.fcp_ms = None;

        assert!(matches!(reporter.report(&record, &ctx), ReportOutcome::Insufficient));
        assert!(!reporter.has_sent());
    }

    #[tokio::test]
    async fn test_reports_at_most_once() {
        let reporter = Reporter::new(RecordingTransport::default(), PageInfo::from_signals(&signals()));
        let ctx = classify(&signals());

        match reporter.report(&ready_record(), &ctx) {
            ReportOutcome::Dispatched(handle) => handle.await.unwrap(),
            other => panic!("expected dispatch, got {other:?}"),
        }
        assert!(matches!(
            reporter.report(&ready_record(), &ctx),
            ReportOutcome::AlreadySent
        ));
        assert_eq!(reporter.transport.calls.load(Ordering::SeqCst), 1);
        assert_eq!(reporter.transport.sent.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_failure_is_swallowed_and_not_retried() {
        let transport = RecordingTransport {
            fail: true,
            ..Default::default()
        };
        let reporter = Reporter::new(transport, PageInfo::from_signals(&signals()));
        let ctx = classify(&signals());

        if let ReportOutcome::Dispatched(handle) = reporter.report(&ready_record(), &ctx) {
            handle.await.unwrap();
        }
        assert!(matches!(
            reporter.report(&ready_record(), &ctx),
            ReportOutcome::AlreadySent
        ));
        assert_eq!(reporter.transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_report_when_ready_waits_for_fcp() {
        let reporter = Reporter::new(RecordingTransport::default(), PageInfo::from_signals(&signals()));
        let ctx = classify(&signals());
        let (tx, rx) = watch::channel(VitalsRecord::empty(0));

        let waiter = reporter.report_when_ready(rx, &ctx);
        let feeder = async {
            tx.send_modify(|r| r.lcp_ms = Some(1800.0));
            tokio::task::yield_now().await;
            tx.send_modify(|r| r.fcp_ms = Some(700.0));
        };
        let (outcome, ()) = tokio::join!(waiter, feeder);

        match outcome {
            ReportOutcome::Dispatched(handle) => handle.await.unwrap(),
            other => panic!("expected dispatch, got {other:?}"),
        }
        let sent = reporter.transport.sent.lock().await;
        assert_eq!(sent[0].lcp, Some(1800.0));
        assert_eq!(sent[0].fcp, Some(700.0));
    }

    #[tokio::test]
    async fn test_report_when_ready_stream_closed_early() {
        let reporter = Reporter::new(RecordingTransport::default(), PageInfo::from_signals(&signals()));
        let ctx = classify(&signals());
        let (tx, rx) = watch::channel(VitalsRecord::empty(0));
        tx.send_modify(|r| r.lcp_ms = Some(1800.0));
        drop(tx);

        let outcome = reporter.report_when_ready(rx, &ctx).await;
        assert!(matches!(outcome, ReportOutcome::Insufficient));
    }
}
