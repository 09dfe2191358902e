// HTTP control API over a running session.

use std::collections::BTreeSet;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::metrics;
use crate::overlay::blip::CategoryKey;
use crate::overlay::players::PlayerFilter;
use crate::session::{SessionError, SessionHandle};
use crate::synchronizer::SyncError;

// ── Request types ─────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct VisibilityRequest {
    /// Global blip visibility. Left unchanged when absent.
    pub show: Option<bool>,
    /// Categories to hide. Left unchanged when absent.
    pub disabled: Option<BTreeSet<CategoryKey>>,
}

#[derive(Deserialize)]
pub struct PlayerFilterRequest {
    pub filter: Option<PlayerFilter>,
}

// ── Helpers ───────────────────────────────────────────────────────────

fn json_error(status: StatusCode, msg: &str) -> impl IntoResponse {
    (status, Json(json!({ "error": msg })))
}

fn session_error(e: SessionError) -> axum::response::Response {
    match e {
        SessionError::Sync(SyncError::UnknownServer(_)) => {
            json_error(StatusCode::NOT_FOUND, &e.to_string()).into_response()
        }
        SessionError::Closed => {
            tracing::error!("Control request after session shutdown");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "Session is not running").into_response()
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn router(session: SessionHandle) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/api/overlay", get(overlay_status))
        .route("/api/server/{name}", post(switch_server))
        .route("/api/refresh", post(refresh))
        .route("/api/blips/visibility", put(set_visibility))
        .route("/api/players/filter", put(set_player_filter))
        .with_state(session)
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok", "service": "blipmap" }))
}

async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        metrics::gather_metrics(),
    )
}

async fn overlay_status(State(session): State<SessionHandle>) -> impl IntoResponse {
    (StatusCode::OK, Json(json!(session.status()))).into_response()
}

async fn switch_server(
    State(session): State<SessionHandle>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match session.switch_server(&name).await {
        Ok(generation) => (
            StatusCode::ACCEPTED,
            Json(json!({ "server": name, "generation": generation.get() })),
        )
            .into_response(),
        Err(e) => session_error(e),
    }
}

async fn refresh(State(session): State<SessionHandle>) -> impl IntoResponse {
    if session.status().server.is_none() {
        return json_error(StatusCode::CONFLICT, "No server selected").into_response();
    }
    match session.refresh().await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => session_error(e),
    }
}

async fn set_visibility(
    State(session): State<SessionHandle>,
    Json(req): Json<VisibilityRequest>,
) -> impl IntoResponse {
    if req.show.is_none() && req.disabled.is_none() {
        return json_error(StatusCode::BAD_REQUEST, "show or disabled is required").into_response();
    }
    if let Some(disabled) = req.disabled {
        if let Err(e) = session.set_disabled_categories(disabled).await {
            return session_error(e);
        }
    }
    if let Some(show) = req.show {
        if let Err(e) = session.set_show_blips(show).await {
            return session_error(e);
        }
    }
    StatusCode::NO_CONTENT.into_response()
}

async fn set_player_filter(
    State(session): State<SessionHandle>,
    Json(req): Json<PlayerFilterRequest>,
) -> impl IntoResponse {
    match session.set_player_filter(req.filter).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => session_error(e),
    }
}
