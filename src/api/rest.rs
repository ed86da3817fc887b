// =============================================================================
// HTTP control surface (spec §6) — Axum 0.7
// =============================================================================
//
// `/health` and `/ready` are unauthenticated liveness/readiness probes, the
// same split the teacher's `/api/v1/health` establishes for a route sitting
// next to authenticated ones. Every other route is gated by `AuthBearer`.
// This is a single-tenant control surface today (see `app_state::DEFAULT_USER_ID`):
// every authenticated call acts on behalf of one operator account.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::api::auth::AuthBearer;
use crate::app_state::{AppState, DEFAULT_USER_ID};
use crate::errors::EngineError;
use crate::journal::TradeQuery;
use crate::orchestrator::{StartRunnerRequest, StopRunnerRequest};
use crate::types::{Environment, JobStatus};

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/connect", post(connect))
        .route("/disconnect", post(disconnect))
        .route("/strategy/start", post(strategy_start))
        .route("/strategy/stop", post(strategy_stop))
        .route("/strategy/status", get(strategy_status))
        .route("/strategy/analysis/:id", get(strategy_analysis))
        .route("/strategy/metrics/:id", get(strategy_metrics))
        .route("/killswitch", post(killswitch))
        .route("/trades/history", get(trades_history))
        .route("/trades/stats", get(trades_stats))
        .route("/trades/:id", delete(trades_delete))
        .layer(cors)
        .with_state(state)
}

fn err_response(err: EngineError) -> impl IntoResponse {
    let status = match err.kind() {
        crate::errors::ErrorKind::InvalidParams
        | crate::errors::ErrorKind::AmountTooSmall
        | crate::errors::ErrorKind::LeverageExceeded
        | crate::errors::ErrorKind::SingleStrategyViolation
        | crate::errors::ErrorKind::InvalidStateTransition
        | crate::errors::ErrorKind::PositionAlreadyExists => StatusCode::BAD_REQUEST,
        crate::errors::ErrorKind::AuthenticationError => StatusCode::UNAUTHORIZED,
        crate::errors::ErrorKind::RateLimit => StatusCode::TOO_MANY_REQUESTS,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(json!({
            "kind": err.kind().to_string(),
            "message": err.to_string(),
            "details": err.details(),
        })),
    )
}

// ---------------------------------------------------------------------------
// GET /health, GET /ready
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    services: HealthServices,
    system: HealthSystem,
    uptime: u64,
    version: &'static str,
    timestamp: i64,
}

#[derive(Serialize)]
struct HealthServices {
    websocket: WebsocketHealth,
    strategies: StrategyCounts,
}

#[derive(Serialize)]
struct WebsocketHealth {
    status: &'static str,
    #[serde(rename = "lastHeartbeat")]
    last_heartbeat: Option<i64>,
}

#[derive(Serialize)]
struct StrategyCounts {
    active: u64,
    total: u64,
}

#[derive(Serialize)]
struct HealthSystem {
    memory: serde_json::Value,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let connected = state.is_connected(DEFAULT_USER_ID);
    let stats = state.orchestrator.get_status(None).queue_stats;

    let status = if connected {
        "healthy"
    } else if state.context(DEFAULT_USER_ID).is_some() {
        "degraded"
    } else {
        "unhealthy"
    };

    let resp = HealthResponse {
        status,
        services: HealthServices {
            websocket: WebsocketHealth {
                status: if connected { "connected" } else { "disconnected" },
                last_heartbeat: if connected { Some(now_millis()) } else { None },
            },
            strategies: StrategyCounts { active: stats.running, total: stats.total },
        },
        system: HealthSystem { memory: json!({}) },
        uptime: state.uptime_secs(),
        version: env!("CARGO_PKG_VERSION"),
        timestamp: now_millis(),
    };

    let code = if status == "unhealthy" { StatusCode::SERVICE_UNAVAILABLE } else { StatusCode::OK };
    (code, Json(resp))
}

#[derive(Serialize)]
struct ReadyResponse {
    ready: bool,
    checks: ReadyChecks,
    timestamp: i64,
}

#[derive(Serialize)]
struct ReadyChecks {
    websocket: bool,
    #[serde(rename = "stateManager")]
    state_manager: bool,
    #[serde(rename = "credentialsManager")]
    credentials_manager: bool,
}

async fn ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let websocket = state.is_connected(DEFAULT_USER_ID);
    let state_manager = true;
    let credentials_manager =
        !std::env::var("BROKER_API_KEY").unwrap_or_default().is_empty() && !std::env::var("BROKER_API_SECRET").unwrap_or_default().is_empty();

    let ready = websocket && state_manager && credentials_manager;
    let resp = ReadyResponse { ready, checks: ReadyChecks { websocket, state_manager, credentials_manager }, timestamp: now_millis() };
    let code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (code, Json(resp))
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ---------------------------------------------------------------------------
// POST /connect, POST /disconnect
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ConnectRequest {
    environment: Environment,
}

async fn connect(_auth: AuthBearer, State(state): State<Arc<AppState>>, Json(req): Json<ConnectRequest>) -> impl IntoResponse {
    match state.connect(DEFAULT_USER_ID, req.environment).await {
        Ok(summary) => (StatusCode::OK, Json(json!(summary))).into_response(),
        Err(err) => err_response(err).into_response(),
    }
}

async fn disconnect(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.disconnect(DEFAULT_USER_ID).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "disconnected": true }))).into_response(),
        Err(err) => err_response(err).into_response(),
    }
}

// ---------------------------------------------------------------------------
// POST /strategy/start, POST /strategy/stop, GET /strategy/status
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct StrategyStartRequest {
    #[serde(rename = "strategyName")]
    strategy_name: String,
    instrument: String,
    #[serde(default)]
    config: serde_json::Value,
}

async fn strategy_start(_auth: AuthBearer, State(state): State<Arc<AppState>>, Json(req): Json<StrategyStartRequest>) -> impl IntoResponse {
    let request = StartRunnerRequest {
        user_id: DEFAULT_USER_ID.to_string(),
        strategy_id: req.strategy_name,
        instrument: req.instrument,
        broker_id: "default".to_string(),
        config: req.config,
    };
    match state.orchestrator.start_runner(request) {
        Ok(result) => (StatusCode::OK, Json(json!(result))).into_response(),
        Err(err) => err_response(err).into_response(),
    }
}

async fn strategy_stop(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let running: Vec<_> = state.queue.get_user_jobs(DEFAULT_USER_ID).into_iter().filter(|j| j.status == JobStatus::Running).collect();
    if running.is_empty() {
        return (StatusCode::OK, Json(json!({ "stopped": [] }))).into_response();
    }

    let mut stopped = Vec::new();
    for job in running {
        let job_id = job.job_id.clone();
        let result = state
            .orchestrator
            .stop_runner(StopRunnerRequest { user_id: DEFAULT_USER_ID.to_string(), job_id: job_id.clone(), flatten_positions: false })
            .await;
        match result {
            Ok(()) => stopped.push(job_id),
            Err(err) => warn!(job_id, error = %err, "failed to stop runner"),
        }
    }
    (StatusCode::OK, Json(json!({ "stopped": stopped }))).into_response()
}

async fn strategy_status(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let report = state.orchestrator.get_status(Some(DEFAULT_USER_ID));
    let lifecycle = state.context(DEFAULT_USER_ID).map(|ctx| ctx.lifecycle.current());
    (StatusCode::OK, Json(json!({ "jobs": report.workers, "queueStats": report.queue_stats, "lifecycle": lifecycle })))
}

async fn strategy_analysis(_auth: AuthBearer, State(state): State<Arc<AppState>>, Path(id): Path<String>) -> impl IntoResponse {
    let Some(job) = state.queue.get_job(&id).filter(|j| j.user_id == DEFAULT_USER_ID) else {
        return (StatusCode::NOT_FOUND, Json(json!({ "kind": "INVALID_PARAMS", "message": "unknown job id" }))).into_response();
    };
    let lifecycle = state.context(&job.user_id).map(|ctx| ctx.lifecycle.current());
    (
        StatusCode::OK,
        Json(json!({
            "jobId": job.job_id,
            "strategyId": job.strategy_id,
            "instrument": lifecycle.as_ref().and_then(|s| s.instrument.clone()),
            "status": job.status,
            "lifecycleState": lifecycle.map(|s| s.state),
        })),
    )
        .into_response()
}

async fn strategy_metrics(_auth: AuthBearer, State(state): State<Arc<AppState>>, Path(id): Path<String>) -> impl IntoResponse {
    let Some(job) = state.queue.get_job(&id).filter(|j| j.user_id == DEFAULT_USER_ID) else {
        return (StatusCode::NOT_FOUND, Json(json!({ "kind": "INVALID_PARAMS", "message": "unknown job id" }))).into_response();
    };
    let Some(ctx) = state.context(&job.user_id) else {
        return (StatusCode::OK, Json(json!({ "jobId": job.job_id, "guard": null, "trades": null }))).into_response();
    };
    let guard = ctx.guard.get_state();
    let trades = ctx.journal.stats(&TradeQuery { strategy: Some(job.strategy_id.clone()), ..Default::default() });
    (StatusCode::OK, Json(json!({ "jobId": job.job_id, "guard": guard, "trades": trades }))).into_response()
}

// ---------------------------------------------------------------------------
// POST /killswitch
// ---------------------------------------------------------------------------

async fn killswitch(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stopped = state.orchestrator.killswitch().await;
    (StatusCode::OK, Json(json!({ "stopped": stopped })))
}

// ---------------------------------------------------------------------------
// Trade journal
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct TradeHistoryQuery {
    strategy: Option<String>,
    instrument: Option<String>,
    #[serde(rename = "openOnly")]
    open_only: Option<bool>,
    limit: Option<usize>,
    offset: Option<usize>,
}

async fn trades_history(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    axum::extract::Query(q): axum::extract::Query<TradeHistoryQuery>,
) -> impl IntoResponse {
    let Some(ctx) = state.context(DEFAULT_USER_ID) else {
        return (StatusCode::OK, Json(json!({ "trades": [] }))).into_response();
    };
    let query = TradeQuery { strategy: q.strategy, instrument: q.instrument, open_only: q.open_only, limit: q.limit, offset: q.offset.unwrap_or(0) };
    let trades = ctx.journal.query(&query);
    (StatusCode::OK, Json(json!({ "trades": trades }))).into_response()
}

async fn trades_stats(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let Some(ctx) = state.context(DEFAULT_USER_ID) else {
        return (StatusCode::OK, Json(json!(crate::journal::TradeStats::default()))).into_response();
    };
    let stats = ctx.journal.stats(&TradeQuery::default());
    (StatusCode::OK, Json(json!(stats))).into_response()
}

async fn trades_delete(_auth: AuthBearer, State(state): State<Arc<AppState>>, Path(id): Path<String>) -> impl IntoResponse {
    let Some(ctx) = state.context(DEFAULT_USER_ID) else {
        return (StatusCode::NOT_FOUND, Json(json!({ "kind": "INVALID_PARAMS", "message": "no active session" }))).into_response();
    };
    if ctx.journal.get(&id).is_none() {
        return (StatusCode::NOT_FOUND, Json(json!({ "kind": "INVALID_PARAMS", "message": "unknown trade id" }))).into_response();
    }
    ctx.journal.delete_trade(&id);
    (StatusCode::OK, Json(json!({ "deleted": id }))).into_response()
}
