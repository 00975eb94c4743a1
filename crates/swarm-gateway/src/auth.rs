//! Tenant boundary extraction.
//!
//! Full authentication (tokens, cookies, rate limits) lives in the
//! transport layer in front of this service. The gateway itself enforces
//! only the tenant boundary: every HITL route resolves a tenant from the
//! `x-swarm-tenant` header, and cross-tenant access is rejected and
//! audited.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use chrono::Utc;
use swarm_core::TenantId;
use swarm_hitl::ApprovalContext;
use swarm_store::{Actor, Event, Session, Store};

use crate::error::ApiError;
use crate::state::AppState;

/// Header carrying the caller's tenant.
pub const TENANT_HEADER: &str = "x-swarm-tenant";

/// Header carrying the caller's identity for approval records.
pub const USER_HEADER: &str = "x-swarm-user";

/// Tenant-scoped request context.
#[derive(Debug, Clone)]
pub struct TenantContext {
    /// The caller's tenant.
    pub tenant_id: TenantId,
    /// The caller's identity, for approval records.
    pub user: String,
    /// Source IP as reported by the front proxy.
    pub ip: Option<String>,
    /// User agent string.
    pub user_agent: Option<String>,
}

impl TenantContext {
    /// Approval context derived from this request.
    #[must_use]
    pub fn approval(&self) -> ApprovalContext {
        ApprovalContext {
            approver: self.user.clone(),
            ip: self.ip.clone(),
            user_agent: self.user_agent.clone(),
        }
    }

    /// Verify the session belongs to this tenant.
    ///
    /// A mismatch is a policy violation: the request is rejected and an
    /// audit event is appended.
    ///
    /// # Errors
    ///
    /// Returns `ApiError::Forbidden` on a cross-tenant access attempt.
    pub fn authorize(&self, state: &AppState, session: &Session) -> Result<(), ApiError> {
        if session.tenant_id == self.tenant_id {
            return Ok(());
        }

        let audit = Event {
            event_id: uuid::Uuid::new_v4(),
            ticket_id: None,
            session_id: Some(session.session_id),
            from_state: None,
            to_state: None,
            action: "policy_violation".to_string(),
            actor: Actor::User,
            actor_id: Some(self.user.clone()),
            metadata: serde_json::json!({
                "requested_tenant": self.tenant_id,
                "owning_tenant": session.tenant_id,
            }),
            created_at: Utc::now(),
        };
        if let Err(err) = state.store.insert_event(&audit) {
            tracing::error!(error = %err, "Failed to record policy violation");
        }

        tracing::warn!(
            session_id = %session.session_id,
            tenant_id = %self.tenant_id,
            user = %self.user,
            "Cross-tenant access rejected"
        );
        Err(ApiError::Forbidden("tenant boundary violation".to_string()))
    }
}

fn header_string(parts: &Parts, name: &str) -> Option<String> {
    parts
        .headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

impl<S: Send + Sync> FromRequestParts<S> for TenantContext {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let tenant = header_string(parts, TENANT_HEADER)
            .ok_or_else(|| ApiError::Forbidden(format!("missing {TENANT_HEADER} header")))?;
        let tenant_id: TenantId = tenant
            .parse()
            .map_err(|_| ApiError::BadRequest(format!("invalid tenant id: {tenant}")))?;

        Ok(Self {
            tenant_id,
            user: header_string(parts, USER_HEADER).unwrap_or_else(|| "anonymous".to_string()),
            ip: header_string(parts, "x-forwarded-for"),
            user_agent: header_string(parts, "user-agent"),
        })
    }
}
