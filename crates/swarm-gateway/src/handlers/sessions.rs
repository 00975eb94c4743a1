//! HITL session endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use swarm_core::{ProjectId, SessionId};
use swarm_store::{
    Message, Session, SessionState, SourceType, SpecDoc, Store, Ticket, TicketState,
};

use crate::auth::TenantContext;
use crate::error::ApiError;
use crate::state::AppState;

// =============================================================================
// Request / response types
// =============================================================================

/// Request to create a session.
#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    /// Project name.
    pub project_name: String,
    /// Natural-language description of the work.
    pub description: String,
    /// How the session entered the system.
    #[serde(default)]
    pub source: Option<SourceType>,
    /// Repository under analysis, if any.
    #[serde(default)]
    pub repo_url: Option<String>,
}

/// A session as returned by the API.
#[derive(Debug, Serialize)]
pub struct SessionResponse {
    /// Session ID.
    pub session_id: SessionId,
    /// Current lifecycle state.
    pub state: SessionState,
    /// Project name.
    pub project_name: String,
    /// Description.
    pub description: String,
    /// Coverage progress percentage.
    pub progress: u8,
    /// Clarification turns consumed.
    pub clarification_turns: u32,
    /// Assigned project, once building.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<ProjectId>,
    /// The current spec blob.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spec: Option<SpecDoc>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

impl From<Session> for SessionResponse {
    fn from(session: Session) -> Self {
        Self {
            session_id: session.session_id,
            state: session.state,
            project_name: session.project_name,
            description: session.description,
            progress: session.progress,
            clarification_turns: session.clarification_turns,
            project_id: session.project_id,
            spec: session.spec,
            created_at: session.created_at,
            updated_at: session.updated_at,
        }
    }
}

/// Request for a clarification turn.
#[derive(Debug, Deserialize)]
pub struct RespondRequest {
    /// The user's message.
    pub message: String,
}

/// Response for a clarification turn.
#[derive(Debug, Serialize)]
pub struct RespondResponse {
    /// The assistant's reply.
    pub reply: MessageResponse,
    /// The session after the turn.
    pub session: SessionResponse,
}

/// A chat message as returned by the API.
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    /// Message ID.
    pub message_id: uuid::Uuid,
    /// Role.
    pub role: swarm_store::MessageRole,
    /// Body.
    pub content: String,
    /// Message type tag.
    pub message_type: String,
    /// Timestamp.
    pub created_at: DateTime<Utc>,
}

impl From<Message> for MessageResponse {
    fn from(message: Message) -> Self {
        Self {
            message_id: message.message_id,
            role: message.role,
            content: message.content,
            message_type: message.message_type,
            created_at: message.created_at,
        }
    }
}

/// Request to replace the spec.
#[derive(Debug, Deserialize)]
pub struct UpdateSpecRequest {
    /// The edited spec blob.
    pub spec: SpecDoc,
}

/// Request for a spec revision.
#[derive(Debug, Deserialize)]
pub struct RevisionRequest {
    /// User feedback driving the revision.
    pub feedback: String,
}

/// Request to start the build.
#[derive(Debug, Deserialize)]
pub struct StartBuildRequest {
    /// Must be `true`; guards against accidental activation.
    #[serde(default)]
    pub confirmed: bool,
}

/// Response for build activation.
#[derive(Debug, Serialize)]
pub struct StartBuildResponse {
    /// The assigned project.
    pub project_id: ProjectId,
    /// Total tickets created.
    pub total: u32,
    /// Tickets immediately eligible.
    pub eligible: u32,
}

/// A ticket as returned by the API.
#[derive(Debug, Serialize)]
pub struct TicketResponse {
    /// Ticket ID.
    pub ticket_id: swarm_core::TicketId,
    /// Title.
    pub title: String,
    /// Lifecycle state.
    pub state: TicketState,
    /// Ticket category.
    pub kind: swarm_store::TicketKind,
    /// Scheduling priority.
    pub priority: i32,
    /// Attempt counter.
    pub attempt: u32,
    /// Dependencies.
    pub depends_on: Vec<swarm_core::TicketId>,
    /// PR URL once opened.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    /// Failure reason, if failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl From<Ticket> for TicketResponse {
    fn from(ticket: Ticket) -> Self {
        Self {
            ticket_id: ticket.ticket_id,
            title: ticket.title,
            state: ticket.state,
            kind: ticket.kind,
            priority: ticket.priority,
            attempt: ticket.attempt,
            depends_on: ticket.depends_on,
            pr_url: ticket.pr_url,
            error_message: ticket.error_message,
        }
    }
}

// =============================================================================
// Handlers
// =============================================================================

fn parse_session_id(s: &str) -> Result<SessionId, ApiError> {
    s.parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid session ID: {s}")))
}

fn load_authorized(
    state: &AppState,
    ctx: &TenantContext,
    session_id: &SessionId,
) -> Result<Session, ApiError> {
    let session = state
        .store
        .get_session(session_id)?
        .ok_or_else(|| ApiError::NotFound(format!("session {session_id}")))?;
    ctx.authorize(state, &session)?;
    Ok(session)
}

/// `POST /v1/sessions` — create a session in `input`.
pub async fn create_session(
    State(state): State<AppState>,
    ctx: TenantContext,
    Json(request): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if request.project_name.trim().is_empty() {
        return Err(ApiError::BadRequest("project_name is required".into()));
    }

    let mut session = state.hitl.create_session(
        ctx.tenant_id,
        request.project_name,
        request.description,
        request.source.unwrap_or(SourceType::Direct),
    )?;

    if let Some(repo_url) = request.repo_url {
        session.repo_url = Some(repo_url);
        state.store.put_session(&session)?;
    }

    Ok((StatusCode::CREATED, Json(SessionResponse::from(session))))
}

/// `GET /v1/sessions/{id}` — session details.
pub async fn get_session(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path(session_id): Path<String>,
) -> Result<Json<SessionResponse>, ApiError> {
    let session_id = parse_session_id(&session_id)?;
    let session = load_authorized(&state, &ctx, &session_id)?;
    Ok(Json(SessionResponse::from(session)))
}

/// `GET /v1/sessions/{id}/messages` — chat history in order.
pub async fn list_messages(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session_id = parse_session_id(&session_id)?;
    load_authorized(&state, &ctx, &session_id)?;

    let messages: Vec<MessageResponse> = state
        .store
        .list_messages(&session_id)?
        .into_iter()
        .map(MessageResponse::from)
        .collect();
    Ok(Json(serde_json::json!({ "messages": messages })))
}

/// `GET /v1/sessions/{id}/tickets` — build progress view.
pub async fn list_tickets(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session_id = parse_session_id(&session_id)?;
    load_authorized(&state, &ctx, &session_id)?;

    let tickets: Vec<TicketResponse> = state
        .store
        .list_tickets_by_session(&session_id)?
        .into_iter()
        .map(TicketResponse::from)
        .collect();
    Ok(Json(serde_json::json!({ "tickets": tickets })))
}

/// `POST /v1/sessions/{id}/respond` — one clarification turn.
pub async fn respond(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path(session_id): Path<String>,
    Json(request): Json<RespondRequest>,
) -> Result<Json<RespondResponse>, ApiError> {
    let session_id = parse_session_id(&session_id)?;
    load_authorized(&state, &ctx, &session_id)?;

    let outcome = state.hitl.respond(&session_id, &request.message).await?;
    Ok(Json(RespondResponse {
        reply: MessageResponse::from(outcome.reply),
        session: SessionResponse::from(outcome.session),
    }))
}

/// `POST /v1/sessions/{id}/skip-clarification` — user skip, floor-gated.
pub async fn skip_clarification(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path(session_id): Path<String>,
) -> Result<Json<SessionResponse>, ApiError> {
    let session_id = parse_session_id(&session_id)?;
    load_authorized(&state, &ctx, &session_id)?;

    let session = state.hitl.skip_clarification(&session_id)?;
    Ok(Json(SessionResponse::from(session)))
}

/// `POST /v1/sessions/{id}/generate-spec`.
pub async fn generate_spec(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path(session_id): Path<String>,
) -> Result<Json<SessionResponse>, ApiError> {
    let session_id = parse_session_id(&session_id)?;
    load_authorized(&state, &ctx, &session_id)?;

    let session = state.hitl.generate_spec(&session_id).await?;
    Ok(Json(SessionResponse::from(session)))
}

/// `POST /v1/sessions/{id}/update-spec`.
pub async fn update_spec(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path(session_id): Path<String>,
    Json(request): Json<UpdateSpecRequest>,
) -> Result<Json<SessionResponse>, ApiError> {
    let session_id = parse_session_id(&session_id)?;
    load_authorized(&state, &ctx, &session_id)?;

    let session = state.hitl.update_spec(&session_id, request.spec)?;
    Ok(Json(SessionResponse::from(session)))
}

/// `POST /v1/sessions/{id}/approve`.
pub async fn approve(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path(session_id): Path<String>,
) -> Result<Json<SessionResponse>, ApiError> {
    let session_id = parse_session_id(&session_id)?;
    load_authorized(&state, &ctx, &session_id)?;

    let session = state.hitl.approve(&session_id, &ctx.approval())?;
    Ok(Json(SessionResponse::from(session)))
}

/// `POST /v1/sessions/{id}/request-revision`.
pub async fn request_revision(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path(session_id): Path<String>,
    Json(request): Json<RevisionRequest>,
) -> Result<Json<SessionResponse>, ApiError> {
    let session_id = parse_session_id(&session_id)?;
    load_authorized(&state, &ctx, &session_id)?;

    let session = state
        .hitl
        .request_revision(&session_id, &request.feedback, &ctx.approval())
        .await?;
    Ok(Json(SessionResponse::from(session)))
}

/// `POST /v1/sessions/{id}/start-build` — activate tickets.
pub async fn start_build(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path(session_id): Path<String>,
    Json(request): Json<StartBuildRequest>,
) -> Result<Json<StartBuildResponse>, ApiError> {
    let session_id = parse_session_id(&session_id)?;
    load_authorized(&state, &ctx, &session_id)?;

    let summary = state
        .hitl
        .start_build(&session_id, request.confirmed, &ctx.approval())?;
    Ok(Json(StartBuildResponse {
        project_id: summary.project_id,
        total: summary.total,
        eligible: summary.eligible,
    }))
}

/// `POST /v1/sessions/{id}/cancel`.
pub async fn cancel_session(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path(session_id): Path<String>,
) -> Result<Json<SessionResponse>, ApiError> {
    let session_id = parse_session_id(&session_id)?;
    load_authorized(&state, &ctx, &session_id)?;

    let session = state.hitl.cancel_session(&session_id, &ctx.approval())?;
    Ok(Json(SessionResponse::from(session)))
}
