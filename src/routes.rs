use axum::routing::get;
use axum::Router;

use crate::state::AppState;
use crate::transport::ws;

/// Liveness probe for deployment checks.
async fn healthz() -> &'static str {
    "ok"
}

/// Build the axum Router: the WebSocket endpoint plus a health check.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_upgrade))
        .route("/healthz", get(healthz))
        .with_state(state)
}
