//! HTTP and WebSocket gateway for the Swarm execution platform.
//!
//! Exposes the HITL session API, the agent pull API, and the event stream
//! over axum. All domain logic lives in the underlying crates; handlers
//! validate, authorize the tenant boundary, and translate errors.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

pub use config::GatewayConfig;
pub use error::ApiError;
pub use routes::create_router;
pub use state::AppState;
