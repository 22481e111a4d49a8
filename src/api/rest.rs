// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Public endpoints (health) require no
// authentication. All other endpoints require a valid Bearer token checked via
// the `AdminAuth` extractor.
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AdminAuth;
use crate::app_state::AppState;
use crate::types::{Direction, RiskRequest, TradeOutcome};

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/evaluate", post(evaluate))
        .route("/api/v1/outcome", post(submit_outcome))
        .route("/api/v1/state", get(full_state))
        .route(
            "/api/v1/graduation/:instrument/:direction",
            get(graduation_table),
        )
        .route("/api/v1/recompute", post(recompute))
        // ── WebSocket ───────────────────────────────────────────────
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        // ── Middleware & State ──────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health (public)
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    server_time: i64,
    store_unreachable: bool,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let resp = HealthResponse {
        status: "ok",
        state_version: state.current_state_version(),
        server_time: chrono::Utc::now().timestamp_millis(),
        store_unreachable: state.memory.store_unreachable(),
    };
    Json(resp)
}

// =============================================================================
// Risk evaluation
// =============================================================================

async fn evaluate(
    State(state): State<Arc<AppState>>,
    _auth: AdminAuth,
    Json(request): Json<RiskRequest>,
) -> impl IntoResponse {
    match state.coordinator.evaluate(&request).await {
        Ok(response) => {
            state.record_decision(
                &request.instrument,
                &request.direction.to_string(),
                &response,
            );
            (StatusCode::OK, Json(serde_json::json!(response))).into_response()
        }
        Err(failure) => {
            warn!(
                instrument = %request.instrument,
                error = %failure.error,
                "evaluation failed"
            );
            state.record_error(failure.message.clone(), Some(failure.error.clone()));
            (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(serde_json::json!(failure)),
            )
                .into_response()
        }
    }
}

// =============================================================================
// Outcome feedback
// =============================================================================

async fn submit_outcome(
    State(state): State<Arc<AppState>>,
    _auth: AdminAuth,
    Json(outcome): Json<TradeOutcome>,
) -> impl IntoResponse {
    info!(
        entry_signal_id = %outcome.entry_signal_id,
        instrument = %outcome.instrument,
        pnl = outcome.per_contract_pnl(),
        "trade outcome submitted"
    );
    state.coordinator.submit_outcome(&outcome).await;
    state.increment_version();
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "accepted": true })),
    )
}

// =============================================================================
// State & inspection
// =============================================================================

async fn full_state(State(state): State<Arc<AppState>>, _auth: AdminAuth) -> impl IntoResponse {
    Json(state.build_snapshot())
}

async fn graduation_table(
    State(state): State<Arc<AppState>>,
    _auth: AdminAuth,
    Path((instrument, direction)): Path<(String, String)>,
) -> impl IntoResponse {
    let Some(direction) = parse_direction(&direction) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "direction must be 'long' or 'short'" })),
        )
            .into_response();
    };

    match state.memory.lookup_graduation(&instrument, direction) {
        Some(table) => Json(serde_json::json!(*table)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "no graduation table for partition" })),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
struct RecomputeRequest {
    instrument: String,
    direction: String,
}

async fn recompute(
    State(state): State<Arc<AppState>>,
    _auth: AdminAuth,
    Json(body): Json<RecomputeRequest>,
) -> impl IntoResponse {
    let Some(direction) = parse_direction(&body.direction) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "direction must be 'long' or 'short'" })),
        )
            .into_response();
    };

    state.memory.request_recompute(&body.instrument, direction);
    info!(instrument = %body.instrument, direction = %direction, "recompute requested");
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "queued": true })),
    )
        .into_response()
}

fn parse_direction(raw: &str) -> Option<Direction> {
    match raw.to_ascii_lowercase().as_str() {
        "long" => Some(Direction::Long),
        "short" => Some(Direction::Short),
        _ => None,
    }
}
