use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::state::AppState;

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn ready(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    // Any store round-trip proves liveness; the permit does not exist.
    let _ = state.store.get_status("__ready__").await?;
    Ok(StatusCode::OK)
}

// ── Workspace lookups ─────────────────────────────────────────────────────────

pub async fn workspace_status(
    State(state): State<AppState>,
    Path(permit_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let status = state
        .store
        .get_status(&permit_id)
        .await?
        .ok_or_else(|| ApiError::not_found("workspace not found"))?;
    Ok(Json(json!({ "status": status })))
}

pub async fn workspace_connection(
    State(state): State<AppState>,
    Path(permit_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let connection = state
        .store
        .get_connection(&permit_id)
        .await?
        .ok_or_else(|| ApiError::not_found("connection details unavailable"))?;
    Ok(Json(json!({ "connection": connection })))
}
