//! REST API handlers.

use axum::{
    extract::{Path, State},
    Json,
};

use super::router::AppState;
use super::types::{
    ApiError, ErrorResponse, ListProcessesResponse, ListSessionsResponse, StopProcessResponse,
};
use crate::kernel::ProcessId;

/// Health check endpoint.
pub async fn health() -> &'static str {
    "OK"
}

/// Service information endpoint.
pub async fn api_info(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": "knoboo",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "processes": state.sessions.processes().count(),
        "sessions": state.sessions.session_count(),
    }))
}

/// List running kernel processes.
pub async fn list_processes(State(state): State<AppState>) -> Json<ListProcessesResponse> {
    let processes = state.sessions.processes().infos();
    Json(ListProcessesResponse {
        count: processes.len(),
        processes,
    })
}

/// Stop a kernel process.
pub async fn stop_process(
    State(state): State<AppState>,
    Path(process_id): Path<String>,
) -> Result<Json<StopProcessResponse>, ApiError> {
    let id: ProcessId = process_id
        .parse()
        .map_err(|e| ErrorResponse::from_error(&e))?;

    let final_state = state
        .sessions
        .processes()
        .stop_process(id)
        .await
        .map_err(|e| ErrorResponse::from_error(&e))?;

    tracing::info!(process = %id, state = ?final_state, "process stopped via API");
    Ok(Json(StopProcessResponse {
        process_id: id,
        state: final_state,
    }))
}

/// List open sessions.
pub async fn list_sessions(
    State(state): State<AppState>,
) -> Result<Json<ListSessionsResponse>, ApiError> {
    let sessions = state
        .sessions
        .sessions()
        .await
        .map_err(|e| ErrorResponse::from_error(&e))?;

    Ok(Json(ListSessionsResponse {
        count: sessions.len(),
        sessions,
    }))
}
