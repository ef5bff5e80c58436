//! HTTP API endpoints for state inspection and snapshots.
//!
//! Used by the host UI and by operators restoring a show after a restart.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::app::AppState;
use crate::error::HubError;
use crate::state::HubSnapshot;

fn unavailable(e: HubError) -> Response {
    tracing::error!("Hub request failed: {}", e);
    (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
}

/// Current broadcast state.
///
/// GET /api/state
pub async fn current_state(State(state): State<AppState>) -> Response {
    match state.hub.snapshot().await {
        Ok(view) => Json(view).into_response(),
        Err(e) => unavailable(e),
    }
}

/// Export the persistent part of the game as JSON.
///
/// GET /api/export
pub async fn export_state(State(state): State<AppState>) -> Response {
    match state.hub.export().await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => unavailable(e),
    }
}

/// Import a snapshot.
///
/// POST /api/import
///
/// Refused while a round is running. Connected clients get the new state
/// through the regular broadcast.
pub async fn import_state(
    State(state): State<AppState>,
    Json(snapshot): Json<HubSnapshot>,
) -> Response {
    match state.hub.import(snapshot).await {
        Ok(()) => (StatusCode::OK, "State imported successfully").into_response(),
        Err(HubError::HubUnavailable) => unavailable(HubError::HubUnavailable),
        Err(e) => {
            tracing::error!("State import failed: {}", e);
            (StatusCode::BAD_REQUEST, format!("Import failed: {}", e)).into_response()
        }
    }
}

/// GET /healthz
pub async fn healthz(State(state): State<AppState>) -> Response {
    match state.hub.snapshot().await {
        Ok(_) => (StatusCode::OK, "ok").into_response(),
        Err(e) => unavailable(e),
    }
}
