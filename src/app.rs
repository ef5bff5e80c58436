//! Router assembly and shared handler state

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::auth::{self, AuthConfig};
use crate::config::HubConfig;
use crate::hub::HubHandle;
use crate::{api, ws};

/// State shared by every HTTP and WebSocket handler
#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
    pub config: Arc<HubConfig>,
    pub auth: Arc<AuthConfig>,
}

pub fn router(state: AppState) -> Router {
    // Snapshot export/import require host credentials
    let protected = Router::new()
        .route("/api/export", get(api::export_state))
        .route("/api/import", post(api::import_state))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::host_auth_middleware,
        ));

    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/api/state", get(api::current_state))
        .route("/healthz", get(api::healthz))
        .merge(protected)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
