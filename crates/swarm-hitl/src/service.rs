//! The HITL session service.
//!
//! Drives a session from the initial description through clarification,
//! spec review, approval, and build activation. Every state change is
//! validated against the lifecycle table, appended to the event log, and
//! published on the bus.

use std::sync::Arc;

use chrono::Utc;
use swarm_adapters::{retry_with_backoff, BackoffPolicy, LlmClient};
use swarm_bus::{BusEvent, EventBus, EventKind, Room};
use swarm_core::{CoreConfig, Json, ProjectId, SessionId, TenantId};
use swarm_store::{
    Actor, Approval, ApprovalKind, Event, GatheredContext, Message, MessageRole, Session,
    SessionState, SourceType, SpecDoc, Store, Ticket, TicketPatch, TicketState,
};

use crate::clarify;
use crate::coverage;
use crate::error::{HitlError, Result};
use crate::generator;
use crate::lifecycle;
use crate::specgen;

/// Minimum description length before clarification can start.
const MIN_DESCRIPTION_LEN: usize = 10;

/// Coverage floor for a user-initiated skip to spec generation.
const SKIP_COVERAGE_FLOOR: u8 = 50;

/// Coverage floor for backlog-promoted sessions to proceed.
const BACKLOG_COVERAGE_FLOOR: u8 = 30;

/// Render a state in the wire vocabulary for the event log.
fn wire_name<T: serde::Serialize + std::fmt::Debug>(state: T) -> String {
    serde_json::to_value(&state)
        .ok()
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_else(|| format!("{state:?}"))
}

/// Transport-level context recorded with a human decision.
#[derive(Debug, Clone, Default)]
pub struct ApprovalContext {
    /// Identity of the approver.
    pub approver: String,
    /// Source IP, when known.
    pub ip: Option<String>,
    /// User agent, when known.
    pub user_agent: Option<String>,
}

/// Result of one clarification turn.
#[derive(Debug, Clone)]
pub struct RespondOutcome {
    /// The assistant's reply message.
    pub reply: Message,
    /// The session after the turn.
    pub session: Session,
}

/// Result of build activation.
#[derive(Debug, Clone, Copy)]
pub struct ActivationSummary {
    /// The project assigned to the build.
    pub project_id: ProjectId,
    /// Total tickets created.
    pub total: u32,
    /// Tickets immediately eligible (`ready`).
    pub eligible: u32,
}

/// The HITL session service.
pub struct HitlService<S: Store, L: LlmClient + ?Sized> {
    store: Arc<S>,
    llm: Arc<L>,
    bus: EventBus,
    config: CoreConfig,
    model: String,
    backoff: BackoffPolicy,
}

impl<S: Store, L: LlmClient + ?Sized> HitlService<S, L> {
    /// Create a new service.
    #[must_use]
    pub fn new(store: Arc<S>, llm: Arc<L>, bus: EventBus, config: CoreConfig) -> Self {
        Self {
            store,
            llm,
            bus,
            config,
            model: "claude-sonnet-4-5".to_string(),
            backoff: BackoffPolicy::default(),
        }
    }

    /// Override the clarifier/spec model.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    fn load(&self, session_id: &SessionId) -> Result<Session> {
        self.store
            .get_session(session_id)?
            .ok_or(HitlError::SessionNotFound(*session_id))
    }

    fn session_rooms(session: &Session) -> Vec<Room> {
        let mut rooms = vec![
            Room::Session(session.session_id),
            Room::Tenant(session.tenant_id),
        ];
        if let Some(project_id) = session.project_id {
            rooms.push(Room::Project(project_id));
        }
        rooms
    }

    fn record_session_event(
        &self,
        session: &Session,
        from: Option<SessionState>,
        to: Option<SessionState>,
        action: &str,
        actor: Actor,
        metadata: Json,
    ) -> Result<()> {
        self.store.insert_event(&Event {
            event_id: uuid::Uuid::new_v4(),
            ticket_id: None,
            session_id: Some(session.session_id),
            from_state: from.map(wire_name),
            to_state: to.map(wire_name),
            action: action.to_string(),
            actor,
            actor_id: None,
            metadata,
            created_at: Utc::now(),
        })?;
        Ok(())
    }

    /// Validate, apply, persist, and announce a session transition.
    fn transition(
        &self,
        session: &mut Session,
        to: SessionState,
        action: &str,
        actor: Actor,
    ) -> Result<()> {
        let from = session.state;
        lifecycle::validate_transition(&session.session_id, from, to)?;

        session.state = to;
        session.updated_at = Utc::now();
        if to.is_terminal() && session.completed_at.is_none() {
            session.completed_at = Some(session.updated_at);
        }
        self.store.put_session(session)?;
        self.record_session_event(session, Some(from), Some(to), action, actor, Json::Null)?;

        self.bus.publish(
            &Self::session_rooms(session),
            &BusEvent::new(
                EventKind::SessionState,
                serde_json::json!({
                    "session_id": session.session_id,
                    "from": from,
                    "to": to,
                    "action": action,
                }),
            ),
        );

        tracing::info!(
            session_id = %session.session_id,
            from = ?from,
            to = ?to,
            action,
            "Session transition"
        );
        Ok(())
    }

    fn record_approval(
        &self,
        session: &Session,
        kind: ApprovalKind,
        ctx: &ApprovalContext,
        data: Json,
    ) -> Result<()> {
        self.store.insert_approval(&Approval {
            approval_id: uuid::Uuid::new_v4(),
            session_id: session.session_id,
            kind,
            approver: ctx.approver.clone(),
            ip: ctx.ip.clone(),
            user_agent: ctx.user_agent.clone(),
            data,
            created_at: Utc::now(),
        })?;
        Ok(())
    }

    fn append_message(
        &self,
        session: &Session,
        role: MessageRole,
        content: String,
        message_type: &str,
    ) -> Result<Message> {
        let message = Message {
            message_id: uuid::Uuid::new_v4(),
            session_id: session.session_id,
            role,
            content,
            message_type: message_type.to_string(),
            metadata: serde_json::json!({}),
            created_at: Utc::now(),
        };
        self.store.insert_message(&message)?;

        self.bus.publish(
            &Self::session_rooms(session),
            &BusEvent::new(
                EventKind::MessageNew,
                serde_json::json!({
                    "session_id": session.session_id,
                    "message_id": message.message_id,
                    "role": role,
                }),
            ),
        );
        Ok(message)
    }

    fn publish_session_update(&self, session: &Session) {
        self.bus.publish(
            &Self::session_rooms(session),
            &BusEvent::new(
                EventKind::SessionUpdate,
                serde_json::json!({
                    "session_id": session.session_id,
                    "state": session.state,
                    "progress": session.progress,
                    "clarification_turns": session.clarification_turns,
                }),
            ),
        );
    }

    // =========================================================================
    // Session operations
    // =========================================================================

    /// Create a session in `input` from a project description.
    ///
    /// # Errors
    ///
    /// Returns an error if the store write fails.
    pub fn create_session(
        &self,
        tenant_id: TenantId,
        project_name: impl Into<String>,
        description: impl Into<String>,
        source: SourceType,
    ) -> Result<Session> {
        let now = Utc::now();
        let session = Session {
            session_id: SessionId::generate(),
            tenant_id,
            project_id: None,
            state: SessionState::Input,
            project_name: project_name.into(),
            description: description.into(),
            gathered: GatheredContext::default(),
            spec: None,
            progress: 0,
            source,
            repo_url: None,
            analysis: None,
            clarification_turns: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };

        self.store.insert_session(&session)?;
        self.record_session_event(
            &session,
            None,
            Some(SessionState::Input),
            "create",
            Actor::User,
            serde_json::json!({ "source": session.source }),
        )?;
        self.publish_session_update(&session);

        tracing::info!(
            session_id = %session.session_id,
            tenant_id = %tenant_id,
            "Created session"
        );
        Ok(session)
    }

    /// Run one clarification turn on a user response.
    ///
    /// # Errors
    ///
    /// Returns `HitlError::InvalidState` outside `input`/`clarifying`,
    /// `HitlError::Precondition` for a too-short description, or an LLM
    /// error once the retry budget is spent.
    pub async fn respond(&self, session_id: &SessionId, user_message: &str) -> Result<RespondOutcome> {
        let mut session = self.load(session_id)?;

        match session.state {
            SessionState::Input => {
                if session.description.trim().len() < MIN_DESCRIPTION_LEN {
                    return Err(HitlError::Precondition(format!(
                        "description must be at least {MIN_DESCRIPTION_LEN} characters"
                    )));
                }
                self.transition(&mut session, SessionState::Clarifying, "start", Actor::User)?;
            }
            SessionState::Clarifying => {}
            from => {
                return Err(HitlError::InvalidState {
                    session_id: *session_id,
                    from,
                    to: SessionState::Clarifying,
                })
            }
        }

        self.append_message(&session, MessageRole::User, user_message.to_string(), "chat")?;

        // Turn budget exhausted: move on with whatever was gathered.
        if session.clarification_turns >= self.config.max_clarification_turns {
            self.transition(
                &mut session,
                SessionState::ReadyForDocs,
                "clarification_exhausted",
                Actor::System,
            )?;
            let reply = self.append_message(
                &session,
                MessageRole::Assistant,
                "Clarification budget reached; proceeding with the gathered context.".to_string(),
                "clarification",
            )?;
            return Ok(RespondOutcome { reply, session });
        }

        let history = self.store.list_messages(session_id)?;
        let request = clarify::build_turn_request(&session, &history, &self.model);
        let completion =
            retry_with_backoff(&self.backoff, || async { self.llm.complete(&request).await })
                .await?;

        session.clarification_turns += 1;

        let reply_text = match clarify::parse_reply(&completion.text) {
            Some(reply) => {
                coverage::merge_gathered(&mut session.gathered, &reply.gathered);
                let computed = coverage::compute_coverage(&session.gathered);
                session.gathered.coverage = computed;
                session.progress = computed;

                let threshold = match session.source {
                    SourceType::Backlog => BACKLOG_COVERAGE_FLOOR,
                    SourceType::Direct | SourceType::Api => self.config.coverage_ready_threshold,
                };
                if computed >= threshold
                    || (reply.ready_for_spec && computed >= SKIP_COVERAGE_FLOOR)
                {
                    self.transition(
                        &mut session,
                        SessionState::ReadyForDocs,
                        "coverage_reached",
                        Actor::Ai,
                    )?;
                }
                reply.message
            }
            None => {
                // Treat the whole text as the message; coverage stays put.
                self.record_session_event(
                    &session,
                    None,
                    None,
                    "clarifier_parse_error",
                    Actor::Ai,
                    serde_json::json!({ "length": completion.text.len() }),
                )?;
                completion.text
            }
        };

        session.updated_at = Utc::now();
        self.store.put_session(&session)?;

        let reply = self.append_message(&session, MessageRole::Assistant, reply_text, "clarification")?;
        self.publish_session_update(&session);

        Ok(RespondOutcome { reply, session })
    }

    /// Skip the remaining clarification, honoring the coverage floor.
    ///
    /// # Errors
    ///
    /// Returns `HitlError::Precondition` below 50% coverage.
    pub fn skip_clarification(&self, session_id: &SessionId) -> Result<Session> {
        let mut session = self.load(session_id)?;

        if session.state != SessionState::Clarifying {
            return Err(HitlError::InvalidState {
                session_id: *session_id,
                from: session.state,
                to: SessionState::ReadyForDocs,
            });
        }
        if session.progress < SKIP_COVERAGE_FLOOR {
            return Err(HitlError::Precondition(format!(
                "coverage {}% is below the {SKIP_COVERAGE_FLOOR}% skip floor",
                session.progress
            )));
        }

        self.transition(&mut session, SessionState::ReadyForDocs, "skip", Actor::User)?;
        Ok(session)
    }

    /// Generate the spec blob from the gathered context.
    ///
    /// # Errors
    ///
    /// Returns `HitlError::Precondition` when no context was gathered and
    /// `HitlError::SpecParse` when the reply is not a valid spec.
    pub async fn generate_spec(&self, session_id: &SessionId) -> Result<Session> {
        let mut session = self.load(session_id)?;

        if session.state != SessionState::ReadyForDocs {
            return Err(HitlError::InvalidState {
                session_id: *session_id,
                from: session.state,
                to: SessionState::Reviewing,
            });
        }
        if session.gathered.is_empty() {
            return Err(HitlError::Precondition(
                "cannot generate a spec from empty context".into(),
            ));
        }

        let request = specgen::build_generation_request(&session, &self.model);
        let completion =
            retry_with_backoff(&self.backoff, || async { self.llm.complete(&request).await })
                .await?;

        let spec = match specgen::parse_spec(&completion.text) {
            Ok(spec) => spec,
            Err(err) => {
                self.record_session_event(
                    &session,
                    None,
                    None,
                    "spec_parse_error",
                    Actor::Ai,
                    serde_json::json!({ "error": err.to_string() }),
                )?;
                return Err(err);
            }
        };

        session.spec = Some(spec);
        self.transition(&mut session, SessionState::Reviewing, "generate_spec", Actor::Ai)?;

        self.bus.publish(
            &Self::session_rooms(&session),
            &BusEvent::new(
                EventKind::SpecGenerated,
                serde_json::json!({ "session_id": session.session_id }),
            ),
        );
        self.bus.publish(
            &Self::session_rooms(&session),
            &BusEvent::new(
                EventKind::ApprovalRequired,
                serde_json::json!({
                    "session_id": session.session_id,
                    "kind": ApprovalKind::SpecApproval,
                }),
            ),
        );

        Ok(session)
    }

    /// Replace the spec with a user-edited blob.
    ///
    /// # Errors
    ///
    /// Returns `HitlError::InvalidState` outside `reviewing`.
    pub fn update_spec(&self, session_id: &SessionId, spec: SpecDoc) -> Result<Session> {
        let mut session = self.load(session_id)?;

        if session.state != SessionState::Reviewing {
            return Err(HitlError::InvalidState {
                session_id: *session_id,
                from: session.state,
                to: SessionState::Reviewing,
            });
        }

        session.spec = Some(spec);
        session.updated_at = Utc::now();
        self.store.put_session(&session)?;
        self.record_session_event(&session, None, None, "update_spec", Actor::User, Json::Null)?;

        self.bus.publish(
            &Self::session_rooms(&session),
            &BusEvent::new(
                EventKind::SpecGenerated,
                serde_json::json!({ "session_id": session.session_id, "edited": true }),
            ),
        );
        Ok(session)
    }

    /// Regenerate the spec from user feedback.
    ///
    /// # Errors
    ///
    /// Returns `HitlError::InvalidState` outside `reviewing` and
    /// `HitlError::SpecParse` when the reply is not a valid spec.
    pub async fn request_revision(
        &self,
        session_id: &SessionId,
        feedback: &str,
        ctx: &ApprovalContext,
    ) -> Result<Session> {
        let mut session = self.load(session_id)?;

        if session.state != SessionState::Reviewing {
            return Err(HitlError::InvalidState {
                session_id: *session_id,
                from: session.state,
                to: SessionState::Reviewing,
            });
        }
        let Some(current) = session.spec.clone() else {
            return Err(HitlError::Precondition("no spec to revise".into()));
        };

        self.record_approval(
            &session,
            ApprovalKind::RevisionRequest,
            ctx,
            serde_json::json!({ "feedback": feedback }),
        )?;

        let history = self.store.list_messages(session_id)?;
        let request =
            specgen::build_revision_request(&session, &current, feedback, &history, &self.model);
        let completion =
            retry_with_backoff(&self.backoff, || async { self.llm.complete(&request).await })
                .await?;
        let spec = specgen::parse_spec(&completion.text)?;

        session.spec = Some(spec);
        session.updated_at = Utc::now();
        self.store.put_session(&session)?;
        self.record_session_event(
            &session,
            None,
            None,
            "request_revision",
            Actor::User,
            serde_json::json!({ "feedback": feedback }),
        )?;

        self.bus.publish(
            &Self::session_rooms(&session),
            &BusEvent::new(
                EventKind::SpecGenerated,
                serde_json::json!({ "session_id": session.session_id, "revised": true }),
            ),
        );
        Ok(session)
    }

    /// Approve the spec.
    ///
    /// # Errors
    ///
    /// Returns `HitlError::Precondition` when no spec is present.
    pub fn approve(&self, session_id: &SessionId, ctx: &ApprovalContext) -> Result<Session> {
        let mut session = self.load(session_id)?;

        if session.state != SessionState::Reviewing {
            return Err(HitlError::InvalidState {
                session_id: *session_id,
                from: session.state,
                to: SessionState::Approved,
            });
        }
        if session.spec.is_none() {
            return Err(HitlError::Precondition("no spec to approve".into()));
        }

        self.record_approval(&session, ApprovalKind::SpecApproval, ctx, Json::Null)?;
        self.transition(&mut session, SessionState::Approved, "approve", Actor::User)?;
        Ok(session)
    }

    /// Activate the build: generate tickets, validate the DAG, and open
    /// dependency-free tickets for claiming.
    ///
    /// # Errors
    ///
    /// Returns `HitlError::Precondition` without explicit confirmation or a
    /// usable spec, and `HitlError::DependencyCycle` when the generated
    /// plan is cyclic.
    pub fn start_build(
        &self,
        session_id: &SessionId,
        confirmed: bool,
        ctx: &ApprovalContext,
    ) -> Result<ActivationSummary> {
        let mut session = self.load(session_id)?;

        if !confirmed {
            return Err(HitlError::Precondition(
                "build start requires explicit confirmation".into(),
            ));
        }
        if session.state != SessionState::Approved {
            return Err(HitlError::InvalidState {
                session_id: *session_id,
                from: session.state,
                to: SessionState::Building,
            });
        }
        let Some(spec) = session.spec.clone() else {
            return Err(HitlError::Precondition("no spec to build".into()));
        };
        if spec.features.is_empty() {
            return Err(HitlError::Precondition("spec has no features".into()));
        }

        self.record_approval(&session, ApprovalKind::BuildStart, ctx, Json::Null)?;

        let project_id = session.project_id.unwrap_or_else(ProjectId::generate);
        session.project_id = Some(project_id);

        let tickets = generator::plan_tickets(&session, &spec, project_id);
        if let Err(err) = generator::validate_dag(&tickets) {
            self.record_session_event(
                &session,
                None,
                None,
                "activation_failed",
                Actor::System,
                serde_json::json!({ "error": err.to_string() }),
            )?;
            return Err(err);
        }

        for ticket in &tickets {
            self.store.insert_ticket(ticket)?;
        }

        // Activation: dependency-free drafts open as ready, the rest block.
        let mut eligible = 0u32;
        for ticket in &tickets {
            let target = if ticket.depends_on.is_empty() {
                eligible += 1;
                TicketState::Ready
            } else {
                TicketState::Blocked
            };
            let updated = self.store.update_ticket(
                &ticket.ticket_id,
                TicketPatch {
                    state: Some(target),
                    ..TicketPatch::default()
                },
                Some(TicketState::Draft),
            )?;
            self.record_ticket_activation(&updated)?;
        }

        self.transition(&mut session, SessionState::Building, "start_build", Actor::User)?;

        self.bus.publish(
            &Self::session_rooms(&session),
            &BusEvent::new(
                EventKind::BuildProgress,
                serde_json::json!({
                    "session_id": session.session_id,
                    "total": tickets.len(),
                    "eligible": eligible,
                }),
            ),
        );

        tracing::info!(
            session_id = %session.session_id,
            total = tickets.len(),
            eligible,
            "Build activated"
        );

        Ok(ActivationSummary {
            project_id,
            total: u32::try_from(tickets.len()).unwrap_or(u32::MAX),
            eligible,
        })
    }

    fn record_ticket_activation(&self, ticket: &Ticket) -> Result<()> {
        self.store.insert_event(&Event {
            event_id: uuid::Uuid::new_v4(),
            ticket_id: Some(ticket.ticket_id),
            session_id: Some(ticket.session_id),
            from_state: Some("draft".to_string()),
            to_state: Some(wire_name(ticket.state)),
            action: "activate".to_string(),
            actor: Actor::System,
            actor_id: None,
            metadata: Json::Null,
            created_at: Utc::now(),
        })?;

        self.bus.publish(
            &[
                Room::Ticket(ticket.ticket_id),
                Room::Session(ticket.session_id),
                Room::Project(ticket.project_id),
            ],
            &BusEvent::new(
                EventKind::TicketUpdate,
                serde_json::json!({
                    "ticket_id": ticket.ticket_id,
                    "state": ticket.state,
                }),
            ),
        );
        Ok(())
    }

    /// Cancel the session and every ticket that has not finished.
    ///
    /// # Errors
    ///
    /// Returns `HitlError::InvalidState` for a terminal session.
    pub fn cancel_session(&self, session_id: &SessionId, _ctx: &ApprovalContext) -> Result<Session> {
        let mut session = self.load(session_id)?;

        self.transition(&mut session, SessionState::Cancelled, "cancel", Actor::User)?;

        for ticket in self.store.list_tickets_by_session(session_id)? {
            if ticket.state.is_terminal() {
                continue;
            }
            let updated = self.store.update_ticket(
                &ticket.ticket_id,
                TicketPatch {
                    state: Some(TicketState::Cancelled),
                    ..TicketPatch::default()
                },
                None,
            )?;
            self.store.insert_event(&Event {
                event_id: uuid::Uuid::new_v4(),
                ticket_id: Some(updated.ticket_id),
                session_id: Some(*session_id),
                from_state: Some(wire_name(ticket.state)),
                to_state: Some("cancelled".to_string()),
                action: "session_cancel".to_string(),
                actor: Actor::User,
                actor_id: None,
                metadata: Json::Null,
                created_at: Utc::now(),
            })?;
        }

        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarm_adapters::ScriptedLlmClient;
    use swarm_store::RocksStore;
    use tempfile::TempDir;

    struct Harness {
        service: HitlService<RocksStore, ScriptedLlmClient>,
        llm: Arc<ScriptedLlmClient>,
        tenant: TenantId,
        _dir: TempDir,
    }

    fn setup() -> Harness {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RocksStore::open(dir.path()).unwrap());
        let llm = Arc::new(ScriptedLlmClient::new());
        let service = HitlService::new(
            Arc::clone(&store),
            Arc::clone(&llm),
            EventBus::with_defaults(),
            CoreConfig::default(),
        );
        Harness {
            service,
            llm,
            tenant: TenantId::generate(),
            _dir: dir,
        }
    }

    fn full_coverage_reply() -> &'static str {
        r#"{"message": "All set.", "gathered": {
            "project_type": {"kind": "api", "platform": "web", "audience": "devs"},
            "tech_stack": {"language": "rust", "framework": "axum", "storage": "rocksdb"},
            "scale": {"users": "100", "availability": "99.9"},
            "features": {"core": "health endpoint", "integrations": "none"},
            "constraints": {"timeline": "1 week", "compliance": "none"}
        }, "progress": 100, "ready_for_spec": true, "next_category": null}"#
    }

    fn spec_reply() -> &'static str {
        r#"{
            "title": "Health endpoint",
            "summary": "Add /health returning 200",
            "goals": ["observability"],
            "features": [{"name": "health", "description": "GET /health returns 200", "acceptance": ["returns 200"]}],
            "non_goals": [],
            "risks": [],
            "acceptance": ["service responds"]
        }"#
    }

    async fn session_in_reviewing(h: &Harness) -> Session {
        let session = h
            .service
            .create_session(h.tenant, "demo", "Add /health endpoint returning 200", SourceType::Direct)
            .unwrap();
        h.llm.push_reply(full_coverage_reply());
        h.service
            .respond(&session.session_id, "please build it")
            .await
            .unwrap();
        h.llm.push_reply(spec_reply());
        h.service.generate_spec(&session.session_id).await.unwrap()
    }

    #[tokio::test]
    async fn create_starts_in_input() {
        let h = setup();
        let session = h
            .service
            .create_session(h.tenant, "demo", "Add /health endpoint returning 200", SourceType::Direct)
            .unwrap();
        assert_eq!(session.state, SessionState::Input);
        assert_eq!(session.progress, 0);
    }

    #[tokio::test]
    async fn respond_rejects_short_description() {
        let h = setup();
        let session = h
            .service
            .create_session(h.tenant, "demo", "short", SourceType::Direct)
            .unwrap();
        let result = h.service.respond(&session.session_id, "go").await;
        assert!(matches!(result, Err(HitlError::Precondition(_))));
    }

    #[tokio::test]
    async fn full_coverage_reaches_ready_for_docs() {
        let h = setup();
        let session = h
            .service
            .create_session(h.tenant, "demo", "Add /health endpoint returning 200", SourceType::Direct)
            .unwrap();

        h.llm.push_reply(full_coverage_reply());
        let outcome = h
            .service
            .respond(&session.session_id, "rust, axum, tiny service")
            .await
            .unwrap();

        assert_eq!(outcome.session.state, SessionState::ReadyForDocs);
        assert_eq!(outcome.session.progress, 100);
        assert_eq!(outcome.reply.content, "All set.");
        assert_eq!(outcome.session.clarification_turns, 1);
    }

    #[tokio::test]
    async fn partial_coverage_stays_clarifying() {
        let h = setup();
        let session = h
            .service
            .create_session(h.tenant, "demo", "Add /health endpoint returning 200", SourceType::Direct)
            .unwrap();

        h.llm.push_reply(
            r#"{"message": "What stack?", "gathered": {"project_type": {"kind": "api"}}, "progress": 10, "ready_for_spec": false, "next_category": "tech_stack"}"#,
        );
        let outcome = h
            .service
            .respond(&session.session_id, "an api")
            .await
            .unwrap();

        assert_eq!(outcome.session.state, SessionState::Clarifying);
        assert!(outcome.session.progress < 50);
    }

    #[tokio::test]
    async fn parse_error_keeps_coverage_and_uses_raw_text() {
        let h = setup();
        let session = h
            .service
            .create_session(h.tenant, "demo", "Add /health endpoint returning 200", SourceType::Direct)
            .unwrap();

        h.llm.push_reply("Sure, tell me more about your stack!");
        let outcome = h
            .service
            .respond(&session.session_id, "hello")
            .await
            .unwrap();

        assert_eq!(outcome.session.progress, 0);
        assert_eq!(outcome.reply.content, "Sure, tell me more about your stack!");

        let events = h
            .service
            .store()
            .list_events_by_session(&session.session_id)
            .unwrap();
        assert!(events.iter().any(|e| e.action == "clarifier_parse_error"));
    }

    #[tokio::test]
    async fn skip_enforces_floor() {
        let h = setup();
        let session = h
            .service
            .create_session(h.tenant, "demo", "Add /health endpoint returning 200", SourceType::Direct)
            .unwrap();

        // Get into clarifying with low coverage.
        h.llm.push_reply(
            r#"{"message": "ok", "gathered": {"project_type": {"kind": "api"}}, "ready_for_spec": false}"#,
        );
        h.service.respond(&session.session_id, "go").await.unwrap();

        let result = h.service.skip_clarification(&session.session_id);
        assert!(matches!(result, Err(HitlError::Precondition(_))));
    }

    #[tokio::test]
    async fn generate_spec_requires_context() {
        let h = setup();
        let session = h
            .service
            .create_session(h.tenant, "demo", "Add /health endpoint returning 200", SourceType::Direct)
            .unwrap();
        let result = h.service.generate_spec(&session.session_id).await;
        // Still in input.
        assert!(matches!(result, Err(HitlError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn generate_spec_enters_reviewing() {
        let h = setup();
        let session = session_in_reviewing(&h).await;
        assert_eq!(session.state, SessionState::Reviewing);
        assert_eq!(session.spec.as_ref().unwrap().title, "Health endpoint");
    }

    #[tokio::test]
    async fn revision_replaces_spec() {
        let h = setup();
        let session = session_in_reviewing(&h).await;

        h.llm.push_reply(
            r#"{
                "title": "Health endpoint",
                "summary": "Add /health returning 200 with rate limiting",
                "features": [
                    {"name": "health", "description": "GET /health", "acceptance": ["returns 200"]},
                    {"name": "rate-limit", "description": "limit requests", "acceptance": ["429 over budget"]}
                ]
            }"#,
        );
        let revised = h
            .service
            .request_revision(
                &session.session_id,
                "add rate limiting",
                &ApprovalContext::default(),
            )
            .await
            .unwrap();

        assert_eq!(revised.state, SessionState::Reviewing);
        assert_eq!(revised.spec.as_ref().unwrap().features.len(), 2);

        let approvals = h
            .service
            .store()
            .list_approvals(&session.session_id)
            .unwrap();
        assert!(approvals
            .iter()
            .any(|a| a.kind == ApprovalKind::RevisionRequest));
    }

    #[tokio::test]
    async fn approve_then_build_activates_dag() {
        let h = setup();
        let session = session_in_reviewing(&h).await;

        h.service
            .approve(&session.session_id, &ApprovalContext::default())
            .unwrap();

        let summary = h
            .service
            .start_build(&session.session_id, true, &ApprovalContext::default())
            .unwrap();

        // 1 feature + verification + packaging + epic.
        assert_eq!(summary.total, 4);
        // Only the dependency-free feature is immediately eligible.
        assert_eq!(summary.eligible, 1);

        let tickets = h
            .service
            .store()
            .list_tickets_by_session(&session.session_id)
            .unwrap();
        let ready: Vec<_> = tickets
            .iter()
            .filter(|t| t.state == TicketState::Ready)
            .collect();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].kind, swarm_store::TicketKind::Feature);
        assert!(tickets
            .iter()
            .filter(|t| t.state == TicketState::Blocked)
            .count()
            >= 3);

        let reloaded = h
            .service
            .store()
            .get_session(&session.session_id)
            .unwrap()
            .unwrap();
        assert_eq!(reloaded.state, SessionState::Building);
    }

    #[tokio::test]
    async fn build_requires_confirmation_flag() {
        let h = setup();
        let session = session_in_reviewing(&h).await;
        h.service
            .approve(&session.session_id, &ApprovalContext::default())
            .unwrap();

        let result = h
            .service
            .start_build(&session.session_id, false, &ApprovalContext::default());
        assert!(matches!(result, Err(HitlError::Precondition(_))));
    }

    #[tokio::test]
    async fn cancel_cancels_pending_tickets() {
        let h = setup();
        let session = session_in_reviewing(&h).await;
        h.service
            .approve(&session.session_id, &ApprovalContext::default())
            .unwrap();
        h.service
            .start_build(&session.session_id, true, &ApprovalContext::default())
            .unwrap();

        let cancelled = h
            .service
            .cancel_session(&session.session_id, &ApprovalContext::default())
            .unwrap();
        assert_eq!(cancelled.state, SessionState::Cancelled);

        let tickets = h
            .service
            .store()
            .list_tickets_by_session(&session.session_id)
            .unwrap();
        assert!(tickets.iter().all(|t| t.state == TicketState::Cancelled));
    }

    #[tokio::test]
    async fn turn_budget_exhaustion_moves_on() {
        let h = setup();
        let mut config = CoreConfig::default();
        config.max_clarification_turns = 1;
        let service = HitlService::new(
            Arc::new(RocksStore::open(h._dir.path().join("turns")).unwrap()),
            Arc::clone(&h.llm),
            EventBus::with_defaults(),
            config,
        );

        let session = service
            .create_session(h.tenant, "demo", "Add /health endpoint returning 200", SourceType::Direct)
            .unwrap();

        h.llm.push_reply(
            r#"{"message": "more?", "gathered": {"project_type": {"kind": "api"}}, "ready_for_spec": false}"#,
        );
        service.respond(&session.session_id, "turn 1").await.unwrap();

        let outcome = service.respond(&session.session_id, "turn 2").await.unwrap();
        assert_eq!(outcome.session.state, SessionState::ReadyForDocs);
    }
}
