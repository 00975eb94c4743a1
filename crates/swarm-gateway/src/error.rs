//! API error types and responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use swarm_core::{Classified, FaultClass};
use thiserror::Error;

/// API error type that implements `IntoResponse`.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Invalid request body or parameters.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The requested resource was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// The request conflicts with the current state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Tenant or policy boundary breach.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Deterministic rejection (malformed spec, cyclic plan).
    #[error("unprocessable: {0}")]
    Unprocessable(String),

    /// An upstream dependency is unavailable.
    #[error("upstream unavailable: {0}")]
    Unavailable(String),

    /// An upstream call timed out.
    #[error("upstream timeout: {0}")]
    Timeout(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl ApiError {
    /// Get the HTTP status code for this error.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code string for this error.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Forbidden(_) => "forbidden",
            Self::Unprocessable(_) => "unprocessable",
            Self::Unavailable(_) => "unavailable",
            Self::Timeout(_) => "timeout",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Map a classified domain error into the API surface.
    fn from_fault(class: FaultClass, message: String) -> Self {
        match class {
            FaultClass::InvalidState | FaultClass::Conflict => Self::Conflict(message),
            FaultClass::NotFound => Self::NotFound(message),
            FaultClass::Transient => {
                tracing::error!(error = %message, "Transient upstream failure");
                Self::Unavailable(message)
            }
            FaultClass::Fatal => Self::Unprocessable(message),
            FaultClass::Timeout => Self::Timeout(message),
            FaultClass::PolicyViolation => Self::Forbidden(message),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.code(),
                message: self.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}

impl From<swarm_hitl::HitlError> for ApiError {
    fn from(err: swarm_hitl::HitlError) -> Self {
        Self::from_fault(err.class(), err.to_string())
    }
}

impl From<swarm_dispatch::DispatchError> for ApiError {
    fn from(err: swarm_dispatch::DispatchError) -> Self {
        Self::from_fault(err.class(), err.to_string())
    }
}

impl From<swarm_store::StoreError> for ApiError {
    fn from(err: swarm_store::StoreError) -> Self {
        Self::from_fault(err.class(), err.to_string())
    }
}
