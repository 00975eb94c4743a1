//! Agent-facing endpoints (pull model).
//!
//! Agents authenticate by holding the lease: every operation checks the
//! caller's `agent_id` against the ticket's assignee.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use swarm_core::{Json as JsonBlob, ProjectId, TicketId};
use swarm_dispatch::AgentResult;
use swarm_store::{AcceptanceCriterion, Store, Ticket};

use crate::error::ApiError;
use crate::state::AppState;

// =============================================================================
// Request / response types
// =============================================================================

/// Claim request body.
#[derive(Debug, Deserialize)]
pub struct ClaimRequestBody {
    /// The claiming agent's identity.
    pub agent_id: String,
    /// Restrict the claim to one project.
    #[serde(default)]
    pub project_id: Option<ProjectId>,
}

/// The job handed to an agent on claim.
#[derive(Debug, Serialize)]
pub struct TicketJob {
    /// Ticket ID for subsequent heartbeats and completion.
    pub ticket_id: TicketId,
    /// Title.
    pub title: String,
    /// Full work description.
    pub description: String,
    /// Acceptance criteria the agent must address.
    pub acceptance_criteria: Vec<AcceptanceCriterion>,
    /// Branch to work on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    /// Attempt number; above 1 the outputs carry prior feedback.
    pub attempt: u32,
    /// Prior outputs, including verifier feedback for retries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<JsonBlob>,
    /// Lease deadline; heartbeat before this or lose the ticket.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_expires: Option<DateTime<Utc>>,
}

impl From<Ticket> for TicketJob {
    fn from(ticket: Ticket) -> Self {
        Self {
            ticket_id: ticket.ticket_id,
            title: ticket.title,
            description: ticket.description,
            acceptance_criteria: ticket.acceptance_criteria,
            branch_name: ticket.branch_name,
            attempt: ticket.attempt,
            outputs: ticket.outputs,
            lease_expires: ticket.lease_expires_at,
        }
    }
}

/// Project settings handed along with a claim so the agent needs no second
/// round trip.
#[derive(Debug, Serialize)]
pub struct ProjectSettings {
    /// Repository to clone, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo_url: Option<String>,
    /// Base branch for PRs.
    pub base_branch: String,
}

/// Claim response body.
#[derive(Debug, Serialize)]
pub struct ClaimResponse {
    /// The claimed job.
    pub ticket: TicketJob,
    /// Settings of the owning project.
    pub project_settings: ProjectSettings,
}

/// Heartbeat request body.
#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    /// The reporting agent.
    pub agent_id: String,
}

/// Heartbeat response body.
#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {
    /// The extended lease deadline.
    pub lease_expires: DateTime<Utc>,
}

/// Completion request body (the structured agent result).
pub type CompleteRequest = AgentResult;

/// Release request body.
#[derive(Debug, Deserialize)]
pub struct ReleaseRequest {
    /// The releasing agent.
    pub agent_id: String,
}

// =============================================================================
// Handlers
// =============================================================================

fn parse_ticket_id(s: &str) -> Result<TicketId, ApiError> {
    s.parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid ticket ID: {s}")))
}

/// `POST /v1/agents/claim` — atomically claim the next ready ticket.
///
/// Returns 204 when no eligible work exists; concurrent callers never
/// receive the same ticket.
pub async fn claim(
    State(state): State<AppState>,
    Json(request): Json<ClaimRequestBody>,
) -> Result<Response, ApiError> {
    if request.agent_id.trim().is_empty() {
        return Err(ApiError::BadRequest("agent_id is required".into()));
    }

    let Some(ticket) = state
        .dispatcher
        .claim_for_agent(&request.agent_id, request.project_id)?
    else {
        return Ok(StatusCode::NO_CONTENT.into_response());
    };

    let repo_url = state
        .store
        .get_session(&ticket.session_id)?
        .and_then(|session| session.repo_url);

    let response = ClaimResponse {
        ticket: TicketJob::from(ticket),
        project_settings: ProjectSettings {
            repo_url,
            base_branch: "main".to_string(),
        },
    };
    Ok(Json(response).into_response())
}

/// `POST /v1/tickets/{id}/heartbeat` — refresh the lease.
pub async fn heartbeat(
    State(state): State<AppState>,
    Path(ticket_id): Path<String>,
    Json(request): Json<HeartbeatRequest>,
) -> Result<Json<HeartbeatResponse>, ApiError> {
    let ticket_id = parse_ticket_id(&ticket_id)?;

    let lease_expires = state.store.extend_lease(
        &ticket_id,
        &request.agent_id,
        state.core_config.lease_duration(),
    )?;
    Ok(Json(HeartbeatResponse { lease_expires }))
}

/// `POST /v1/tickets/{id}/complete` — post the structured result.
pub async fn complete(
    State(state): State<AppState>,
    Path(ticket_id): Path<String>,
    Json(result): Json<CompleteRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let ticket_id = parse_ticket_id(&ticket_id)?;

    let outcome = state
        .pipeline
        .process_agent_result(&ticket_id, &result)
        .await?;
    Ok(Json(serde_json::json!({ "outcome": format!("{outcome:?}").to_lowercase() })))
}

/// `POST /v1/tickets/{id}/release` — voluntary return without completion.
pub async fn release(
    State(state): State<AppState>,
    Path(ticket_id): Path<String>,
    Json(request): Json<ReleaseRequest>,
) -> Result<StatusCode, ApiError> {
    let ticket_id = parse_ticket_id(&ticket_id)?;

    state
        .dispatcher
        .release_ticket(&ticket_id, &request.agent_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /v1/tickets/{id}/cancel` — user-initiated cancellation.
pub async fn cancel(
    State(state): State<AppState>,
    ctx: crate::auth::TenantContext,
    Path(ticket_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let ticket_id = parse_ticket_id(&ticket_id)?;

    // Tenant boundary check against the owning session.
    let ticket = state
        .store
        .get_ticket(&ticket_id)?
        .ok_or_else(|| ApiError::NotFound(format!("ticket {ticket_id}")))?;
    let session = state
        .store
        .get_session(&ticket.session_id)?
        .ok_or_else(|| ApiError::NotFound(format!("session {}", ticket.session_id)))?;
    ctx.authorize(&state, &session)?;

    let cancelled = state.dispatcher.cancel_ticket(&ticket_id, &ctx.user).await?;
    Ok(Json(serde_json::json!({
        "ticket_id": cancelled.ticket_id,
        "state": cancelled.state,
    })))
}
