use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::calibration::CalibrationPhase;
use crate::confirm::ConfirmationDesk;
use crate::db::Db;
use crate::growth::{Confirmation, GrowthStage};
use crate::scheduler::Scheduler;
use crate::state::{LiveStatus, SharedState};

const INDEX_HTML: &str = include_str!("ui/index.html");

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 500;

/// Everything the handlers read. Channel state is only ever seen through
/// the scheduler's snapshot.
#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    pub scheduler: Scheduler,
    pub desk: ConfirmationDesk,
    pub calibration: watch::Receiver<Option<CalibrationPhase>>,
    pub db: Option<Db>,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/status", get(api_status))
        .route("/api/readings", get(api_readings))
        .route("/api/actuations", get(api_actuations))
        .route("/api/stage/confirm", post(api_confirm))
        .route("/api/stage/reject", post(api_reject))
        .with_state(state)
}

async fn index() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], INDEX_HTML)
}

async fn api_status(State(app): State<AppState>) -> impl IntoResponse {
    let live = LiveStatus {
        pending_stage: app.desk.pending(),
        calibration_phase: *app.calibration.borrow(),
        misting: app.scheduler.misting_policy(),
        channels: app.scheduler.snapshot(),
    };
    let st = app.shared.read().await;
    Json(st.to_status(live))
}

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<i64>,
}

impl LimitQuery {
    fn limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

fn no_history() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "error": "history store not configured" })),
    )
}

fn history<T: Serialize>(key: &str, rows: Result<Vec<T>>) -> (StatusCode, Json<serde_json::Value>) {
    match rows {
        Ok(rows) => (StatusCode::OK, Json(json!({ key: rows }))),
        Err(e) => {
            tracing::warn!(error = %e, key, "history query failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "history query failed" })),
            )
        }
    }
}

async fn api_readings(
    State(app): State<AppState>,
    Query(q): Query<LimitQuery>,
) -> impl IntoResponse {
    let Some(db) = &app.db else {
        return no_history();
    };
    history("readings", db.recent_readings(q.limit()).await)
}

/// Newest first; one row per channel that was switched or failed.
async fn api_actuations(
    State(app): State<AppState>,
    Query(q): Query<LimitQuery>,
) -> impl IntoResponse {
    let Some(db) = &app.db else {
        return no_history();
    };
    history("actuations", db.recent_actuations(q.limit()).await)
}

#[derive(Deserialize)]
struct ConfirmBody {
    stage: i64,
}

async fn api_confirm(
    State(app): State<AppState>,
    Json(body): Json<ConfirmBody>,
) -> impl IntoResponse {
    let stage = GrowthStage::from_number(body.stage);
    if stage == GrowthStage::Unknown {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "error": format!("stage must be 1, 2 or 3, got {}", body.stage) })),
        );
    }
    answer(&app.desk, Confirmation::Confirmed(stage))
}

async fn api_reject(State(app): State<AppState>) -> impl IntoResponse {
    answer(&app.desk, Confirmation::Rejected)
}

fn answer(desk: &ConfirmationDesk, answer: Confirmation) -> (StatusCode, Json<serde_json::Value>) {
    match desk.answer(answer) {
        Ok(()) => {
            tracing::info!(?answer, "operator answered stage proposal");
            (StatusCode::ACCEPTED, Json(json!({ "answered": true })))
        }
        Err(e) => (StatusCode::CONFLICT, Json(json!({ "error": e.to_string() }))),
    }
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    tracing::info!(%addr, "web ui listening");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
