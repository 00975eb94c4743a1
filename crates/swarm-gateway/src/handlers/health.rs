//! Health check endpoint.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::state::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Always "ok" when the process answers.
    pub status: &'static str,
    /// Number of live event-stream subscribers.
    pub bus_subscribers: usize,
}

/// `GET /health` — liveness probe.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        bus_subscribers: state.bus.subscriber_count(),
    })
}
