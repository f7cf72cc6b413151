//! Client-facing HTTP surface.
//!
//! - `GET /ws` and `GET {server.path}`: WebSocket upgrade, registered with the hub
//! - `GET /health`: connection count and consumer state

pub mod websocket;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use crate::config::{HEALTH_PATH, WS_PATH};
use crate::hub::BroadcastHub;
use crate::services::ConsumerState;

pub use websocket::websocket_handler;

/// Shared state for axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<BroadcastHub>,
    pub consumer_state: watch::Receiver<ConsumerState>,
    /// Deadline for writing one frame to a client socket.
    pub write_timeout: Duration,
}

/// Build the axum router (separated for testing).
///
/// `path` is served in addition to `/ws`.
pub fn router(state: AppState, path: &str) -> Router {
    let mut router = Router::new()
        .route(WS_PATH, get(websocket_handler))
        .route(HEALTH_PATH, get(health));

    if path != WS_PATH && path != HEALTH_PATH {
        router = router.route(path, get(websocket_handler));
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Health probe body.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub connections: usize,
    pub consumer: ConsumerState,
}

/// `200` while the consumer is running, `503` otherwise.
///
/// Clients can still connect while the consumer is down; the status only
/// reports whether broadcasts are flowing.
async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let consumer = *state.consumer_state.borrow();
    let connections = state.hub.len().await;

    let (code, status) = match consumer {
        ConsumerState::Running => (StatusCode::OK, "ok"),
        _ => (StatusCode::SERVICE_UNAVAILABLE, "degraded"),
    };

    (
        code,
        Json(HealthResponse {
            status,
            connections,
            consumer,
        }),
    )
}

#[cfg(test)]
mod tests;
