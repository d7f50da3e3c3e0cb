//! HTTP routes: `POST /api/performance/vitals` and `GET /health`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::Method,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use pageperf::reporter::{TelemetryResponse, VitalsPayload, VITALS_PATH};
use pageperf::{score_with, OptimizerConfig};

use crate::types::{ServerError, ServerResult};

/// Shared state for all handlers.
pub struct AppState {
    pub config: OptimizerConfig,
    pub started_at: DateTime<Utc>,
    reports: AtomicU64,
}

impl AppState {
    pub fn new(config: OptimizerConfig) -> Self {
        Self {
            config,
            started_at: Utc::now(),
            reports: AtomicU64::new(0),
        }
    }

    /// Reports accepted since startup.
    pub fn reports(&self) -> u64 {
        self.reports.load(Ordering::Relaxed)
    }
}

/// Build the application router.
pub fn router(state: Arc<AppState>) -> Router {
    // Pages may post from any of the site's hostnames, and beacons skip preflight.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route(VITALS_PATH, post(handle_vitals))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

/// Bind and serve until the process is stopped.
pub async fn serve(addr: &str, state: Arc<AppState>) -> ServerResult<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Telemetry endpoint listening on {addr}");

    axum::serve(listener, router(state))
        .await
        .map_err(|e| ServerError::Internal(e.to_string()))
}

/// Score one page load. The body is parsed by hand because `sendBeacon`
/// posts JSON as `text/plain`.
async fn handle_vitals(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> ServerResult<Json<TelemetryResponse>> {
    let request_id = Uuid::new_v4();
    let payload: VitalsPayload = serde_json::from_slice(&body)
        .map_err(|e| ServerError::InvalidPayload(e.to_string()))?;
    validate(&payload)?;

    let thresholds = state.config.thresholds_for(payload.device_type);
    let result = score_with(&payload.to_record(), &thresholds);
    state.reports.fetch_add(1, Ordering::Relaxed);

    tracing::info!(
        %request_id,
        device = %payload.device_type,
        connection = %payload.connection,
        score = result.value,
        lcp = ?payload.lcp,
        fcp = ?payload.fcp,
        "Vitals received"
    );
    for issue in result.issues() {
        tracing::debug!(%request_id, "{issue}");
    }

    Ok(Json(TelemetryResponse {
        score: f64::from(result.value),
        issues: result.issues(),
    }))
}

fn validate(payload: &VitalsPayload) -> ServerResult<()> {
    let metrics = [
        ("lcp", payload.lcp),
        ("inp", payload.inp),
        ("cls", payload.cls),
        ("fcp", payload.fcp),
        ("ttfb", payload.ttfb),
    ];
    for (name, value) in metrics {
        if let Some(v) = value {
            if !v.is_finite() || v < 0.0 {
                return Err(ServerError::InvalidPayload(format!(
                    "{name} must be a non-negative number, got {v}"
                )));
            }
        }
    }
    Ok(())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Health {
    status: &'static str,
    version: &'static str,
    reports: u64,
    uptime_seconds: i64,
}

async fn handle_health(State(state): State<Arc<AppState>>) -> Json<Health> {
    let uptime = Utc::now().signed_duration_since(state.started_at);
    Json(Health {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        reports: state.reports(),
        uptime_seconds: uptime.num_seconds(),
    })
}
