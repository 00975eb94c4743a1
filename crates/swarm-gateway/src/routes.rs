//! Router configuration.

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{agent, events, health, sessions};
use crate::state::AppState;

/// Create the gateway router with all routes and middleware.
///
/// # Routes
///
/// ## Public
/// - `GET /health` - Health check
/// - `GET /v1/events/ws` - Event stream (WebSocket)
///
/// ## HITL sessions (tenant-scoped)
/// - `POST /v1/sessions` - Create session
/// - `GET /v1/sessions/{id}` / `/messages` / `/tickets`
/// - `POST /v1/sessions/{id}/respond` - Clarification turn
/// - `POST /v1/sessions/{id}/skip-clarification`
/// - `POST /v1/sessions/{id}/generate-spec` / `update-spec`
/// - `POST /v1/sessions/{id}/approve` / `request-revision`
/// - `POST /v1/sessions/{id}/start-build` / `cancel`
///
/// ## Agents (lease-authenticated)
/// - `POST /v1/agents/claim` - Atomic claim, 204 when idle
/// - `POST /v1/tickets/{id}/heartbeat` / `complete` / `release`
/// - `POST /v1/tickets/{id}/cancel` - tenant-scoped cancellation
pub fn create_router(state: AppState) -> Router {
    let cors = build_cors_layer(&state.config.cors_origins);
    let max_body_bytes = state.config.max_body_bytes;
    let request_timeout = state.config.request_timeout();

    Router::new()
        // Health (public)
        .route("/health", get(health::health))
        // Sessions
        .route("/v1/sessions", post(sessions::create_session))
        .route("/v1/sessions/{session_id}", get(sessions::get_session))
        .route(
            "/v1/sessions/{session_id}/messages",
            get(sessions::list_messages),
        )
        .route(
            "/v1/sessions/{session_id}/tickets",
            get(sessions::list_tickets),
        )
        .route("/v1/sessions/{session_id}/respond", post(sessions::respond))
        .route(
            "/v1/sessions/{session_id}/skip-clarification",
            post(sessions::skip_clarification),
        )
        .route(
            "/v1/sessions/{session_id}/generate-spec",
            post(sessions::generate_spec),
        )
        .route(
            "/v1/sessions/{session_id}/update-spec",
            post(sessions::update_spec),
        )
        .route("/v1/sessions/{session_id}/approve", post(sessions::approve))
        .route(
            "/v1/sessions/{session_id}/request-revision",
            post(sessions::request_revision),
        )
        .route(
            "/v1/sessions/{session_id}/start-build",
            post(sessions::start_build),
        )
        .route(
            "/v1/sessions/{session_id}/cancel",
            post(sessions::cancel_session),
        )
        // Agents
        .route("/v1/agents/claim", post(agent::claim))
        .route("/v1/tickets/{ticket_id}/heartbeat", post(agent::heartbeat))
        .route("/v1/tickets/{ticket_id}/complete", post(agent::complete))
        .route("/v1/tickets/{ticket_id}/release", post(agent::release))
        .route("/v1/tickets/{ticket_id}/cancel", post(agent::cancel))
        // Event stream
        .route("/v1/events/ws", get(events::websocket_handler))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(TimeoutLayer::new(request_timeout))
        .with_state(state)
}

/// Build the CORS layer from configured origins.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}
