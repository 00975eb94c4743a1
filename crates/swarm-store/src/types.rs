//! Domain types persisted by the store.
//!
//! These records are the authoritative state of the execution core. All
//! other components hold ids only and read or mutate rows through the
//! `Store` trait.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use swarm_core::{Json, ProjectId, SessionId, TenantId, TicketId, VmId};

// =============================================================================
// Tickets
// =============================================================================

/// Lifecycle states for a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum TicketState {
    /// Created by the generator, not yet activated.
    Draft = 1,
    /// Waiting on incomplete dependencies.
    Blocked = 2,
    /// Eligible for claiming.
    Ready = 3,
    /// Claimed by an agent, VM binding established.
    Claimed = 4,
    /// Agent acknowledged readiness and is executing.
    InProgress = 5,
    /// Agent result received, verifier running.
    Review = 6,
    /// Parked for a human decision.
    Hold = 7,
    /// Verified and merged. Absorbing.
    Completed = 8,
    /// Attempts exhausted or a fatal fault. Terminal.
    Failed = 9,
    /// Cancelled by a user. Terminal.
    Cancelled = 10,
}

impl TicketState {
    /// Numeric representation used in index keys.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Convert a numeric value back to a state.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Draft),
            2 => Some(Self::Blocked),
            3 => Some(Self::Ready),
            4 => Some(Self::Claimed),
            5 => Some(Self::InProgress),
            6 => Some(Self::Review),
            7 => Some(Self::Hold),
            8 => Some(Self::Completed),
            9 => Some(Self::Failed),
            10 => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Whether this state is terminal.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the ticket currently occupies fleet capacity.
    #[must_use]
    pub const fn is_in_flight(self) -> bool {
        matches!(self, Self::Claimed | Self::InProgress)
    }

    /// Check whether a transition is legal.
    ///
    /// `completed` is absorbing; `failed` and `cancelled` are terminal.
    /// `ready` is re-enterable from the claimed/in-progress/review states so
    /// that reclamation, voluntary release, and verifier-rejected attempts
    /// can requeue. `ready → completed` is the roll-up edge: epic tickets
    /// are never executed, they complete as soon as their dependencies do.
    #[must_use]
    pub const fn can_transition(from: Self, to: Self) -> bool {
        use TicketState::{
            Blocked, Cancelled, Claimed, Completed, Draft, Failed, Hold, InProgress, Ready, Review,
        };

        matches!(
            (from, to),
            (Draft, Ready | Blocked)
                | (Blocked | Hold, Ready)
                | (Ready, Claimed | Hold | Completed)
                | (Claimed, InProgress | Ready | Failed)
                | (InProgress, Review | Ready | Failed)
                | (Review, Completed | Ready | Failed)
                | (
                    Draft | Blocked | Ready | Hold | Claimed | InProgress | Review,
                    Cancelled
                )
        )
    }
}

/// Category of a generated ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketKind {
    /// Backlog-tracking roll-up over the whole plan. Never blocks work.
    Epic,
    /// Implements one spec feature.
    Feature,
    /// Runs after every feature ticket completes.
    Verification,
    /// Produces the packaged output, after verification.
    Packaging,
}

/// Who is expected to execute a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssigneeKind {
    /// An AI coding agent in a VM.
    Agent,
    /// A human operator.
    Human,
}

/// Verifier outcome recorded on the ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    /// Not verified yet.
    Pending,
    /// Verifier accepted the result.
    Passed,
    /// Verifier rejected the result.
    Failed,
    /// Verification was bypassed (e.g. a blocked criterion short-circuit).
    Skipped,
}

/// Status of a single acceptance criterion, as reported by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriterionStatus {
    /// The criterion is met.
    Satisfied,
    /// Partially met.
    Partial,
    /// The agent could not make progress on it.
    Blocked,
}

/// One acceptance criterion attached to a ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptanceCriterion {
    /// Stable identifier, e.g. `AC-1`.
    pub id: String,
    /// The criterion text copied from the spec.
    pub text: String,
    /// Latest reported status.
    pub status: CriterionStatus,
}

/// A unit of agent work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    /// Unique identifier.
    pub ticket_id: TicketId,
    /// Owning session.
    pub session_id: SessionId,
    /// Owning project.
    pub project_id: ProjectId,
    /// Tenant boundary.
    pub tenant_id: TenantId,
    /// Short title.
    pub title: String,
    /// Full work description handed to the agent.
    pub description: String,
    /// Optional parent (the epic, for generated plans).
    pub parent_id: Option<TicketId>,
    /// Scheduling priority; lower runs earlier.
    pub priority: i32,
    /// Current lifecycle state.
    pub state: TicketState,
    /// Ticket category.
    pub kind: TicketKind,
    /// Expected executor kind.
    pub assignee_kind: AssigneeKind,
    /// Identity of the current assignee, if claimed.
    pub assignee: Option<String>,
    /// Bound VM identity, if claimed.
    pub vm_id: Option<VmId>,
    /// Lease deadline; work past this point is reclaimable.
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Last heartbeat received from the executor.
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// Tickets that must complete before this one may run.
    pub depends_on: Vec<TicketId>,
    /// Count of dependencies not yet completed. Derived, maintained on
    /// cascade.
    pub blocked_by: u32,
    /// Working branch name, once execution starts.
    pub branch_name: Option<String>,
    /// Pull request URL, once opened.
    pub pr_url: Option<String>,
    /// Ordered acceptance criteria.
    pub acceptance_criteria: Vec<AcceptanceCriterion>,
    /// Pass number, starting at 1. Incremented on every requeue.
    pub attempt: u32,
    /// Latest verifier outcome.
    pub verification: VerificationStatus,
    /// Count of verifier-negative verdicts over the ticket's lifetime.
    pub rejection_count: u32,
    /// Agent output blob, including verifier feedback for the next attempt.
    pub outputs: Option<Json>,
    /// Human-readable failure reason, if failed.
    pub error_message: Option<String>,
    /// Backoff deadline; not claimable before this instant.
    pub retry_after: Option<DateTime<Utc>>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
    /// When execution first started.
    pub started_at: Option<DateTime<Utc>>,
    /// When a terminal state was reached.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Ticket {
    /// The in-flight lease view, if the ticket currently holds one.
    #[must_use]
    pub fn lease(&self) -> Option<Lease> {
        match (self.vm_id, self.lease_expires_at) {
            (Some(vm_id), Some(expires_at)) if self.state.is_in_flight() => Some(Lease {
                ticket_id: self.ticket_id,
                vm_id,
                expires_at,
                last_heartbeat: self.last_heartbeat_at,
            }),
            _ => None,
        }
    }
}

/// A partial update applied to a ticket under the store's write lock.
///
/// Outer `Option` = "change this field"; inner `Option` = the new value for
/// nullable columns.
#[derive(Debug, Default, Clone)]
pub struct TicketPatch {
    /// New lifecycle state; validated against the transition table.
    pub state: Option<TicketState>,
    /// New assignee.
    pub assignee: Option<Option<String>>,
    /// New VM binding.
    pub vm_id: Option<Option<VmId>>,
    /// New lease deadline.
    pub lease_expires_at: Option<Option<DateTime<Utc>>>,
    /// New heartbeat timestamp.
    pub last_heartbeat_at: Option<Option<DateTime<Utc>>>,
    /// New branch name.
    pub branch_name: Option<Option<String>>,
    /// New PR URL.
    pub pr_url: Option<Option<String>>,
    /// Replacement acceptance criteria (status updates).
    pub acceptance_criteria: Option<Vec<AcceptanceCriterion>>,
    /// New attempt counter.
    pub attempt: Option<u32>,
    /// New verification status.
    pub verification: Option<VerificationStatus>,
    /// New rejection count.
    pub rejection_count: Option<u32>,
    /// New outputs blob.
    pub outputs: Option<Option<Json>>,
    /// New error message.
    pub error_message: Option<Option<String>>,
    /// New backoff deadline.
    pub retry_after: Option<Option<DateTime<Utc>>>,
    /// New blocked-by counter.
    pub blocked_by: Option<u32>,
}

impl TicketPatch {
    /// Apply the patch to a ticket in place. Does not validate transitions;
    /// the store does that before calling.
    pub fn apply(&self, ticket: &mut Ticket, now: DateTime<Utc>) {
        if let Some(state) = self.state {
            ticket.state = state;
            if state == TicketState::InProgress && ticket.started_at.is_none() {
                ticket.started_at = Some(now);
            }
            if state.is_terminal() && ticket.completed_at.is_none() {
                ticket.completed_at = Some(now);
            }
        }
        if let Some(assignee) = &self.assignee {
            ticket.assignee.clone_from(assignee);
        }
        if let Some(vm_id) = self.vm_id {
            ticket.vm_id = vm_id;
        }
        if let Some(lease) = self.lease_expires_at {
            ticket.lease_expires_at = lease;
        }
        if let Some(heartbeat) = self.last_heartbeat_at {
            ticket.last_heartbeat_at = heartbeat;
        }
        if let Some(branch) = &self.branch_name {
            ticket.branch_name.clone_from(branch);
        }
        if let Some(pr) = &self.pr_url {
            ticket.pr_url.clone_from(pr);
        }
        if let Some(criteria) = &self.acceptance_criteria {
            ticket.acceptance_criteria.clone_from(criteria);
        }
        if let Some(attempt) = self.attempt {
            ticket.attempt = attempt;
        }
        if let Some(verification) = self.verification {
            ticket.verification = verification;
        }
        if let Some(rejections) = self.rejection_count {
            ticket.rejection_count = rejections;
        }
        if let Some(outputs) = &self.outputs {
            ticket.outputs.clone_from(outputs);
        }
        if let Some(error) = &self.error_message {
            ticket.error_message.clone_from(error);
        }
        if let Some(retry_after) = self.retry_after {
            ticket.retry_after = retry_after;
        }
        if let Some(blocked_by) = self.blocked_by {
            ticket.blocked_by = blocked_by;
        }
        ticket.updated_at = now;
    }
}

/// Parameters for an atomic claim of the next ready ticket.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    /// Identity of the claiming executor.
    pub assignee: String,
    /// Executor kind.
    pub assignee_kind: AssigneeKind,
    /// VM identity to bind; allocated by the store when absent.
    pub vm_id: Option<VmId>,
    /// Lease duration granted on claim.
    pub lease: std::time::Duration,
    /// Restrict the claim to one tenant.
    pub tenant: Option<TenantId>,
    /// Restrict the claim to one project.
    pub project: Option<ProjectId>,
    /// Per-tenant in-flight cap enforced during candidate selection.
    pub tenant_cap: Option<u32>,
}

/// The in-flight lease view derived from a claimed ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// The leased ticket.
    pub ticket_id: TicketId,
    /// The VM bound to it.
    pub vm_id: VmId,
    /// Deadline after which the lease is reclaimable.
    pub expires_at: DateTime<Utc>,
    /// Last heartbeat observed.
    pub last_heartbeat: Option<DateTime<Utc>>,
}

// =============================================================================
// Sessions
// =============================================================================

/// Lifecycle states for a HITL session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SessionState {
    /// Description submitted, clarification not yet started.
    Input = 1,
    /// Clarification turns in progress.
    Clarifying = 2,
    /// Enough context gathered; spec generation available.
    ReadyForDocs = 3,
    /// Draft spec produced and under human review.
    Reviewing = 4,
    /// Spec approved; build not yet started.
    Approved = 5,
    /// Tickets activated, agents executing.
    Building = 6,
    /// Every ticket terminal with at least one completed.
    Completed = 7,
    /// Build could make no further progress.
    Failed = 8,
    /// Cancelled by a user. Terminal.
    Cancelled = 9,
}

impl SessionState {
    /// Numeric representation used in index keys.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether this state is terminal.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// How a session entered the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    /// Created interactively by a user.
    Direct,
    /// Promoted from the backlog.
    Backlog,
    /// Created programmatically.
    Api,
}

/// Clarification context gathered across turns.
///
/// `categories` maps each known category (`project_type`, `tech_stack`,
/// `scale`, `features`, `constraints`) to the subfields filled so far.
/// Merges are additive; a turn can refine a subfield but never drops one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatheredContext {
    /// Filled subfields per category.
    #[serde(default)]
    pub categories: BTreeMap<String, BTreeMap<String, Json>>,
    /// Weighted coverage percentage, recomputed after every merge.
    #[serde(default)]
    pub coverage: u8,
}

impl GatheredContext {
    /// Whether any context has been gathered at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.categories.values().all(BTreeMap::is_empty)
    }
}

/// One feature of a generated specification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecFeature {
    /// Feature name.
    pub name: String,
    /// What the feature does.
    pub description: String,
    /// Acceptance criteria for the feature.
    #[serde(default)]
    pub acceptance: Vec<String>,
}

/// The structured specification artifact produced for review and approval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecDoc {
    /// Title of the work.
    pub title: String,
    /// One-paragraph summary.
    pub summary: String,
    /// Project goals.
    #[serde(default)]
    pub goals: Vec<String>,
    /// Features to build.
    #[serde(default)]
    pub features: Vec<SpecFeature>,
    /// Explicit non-goals.
    #[serde(default)]
    pub non_goals: Vec<String>,
    /// Known risks.
    #[serde(default)]
    pub risks: Vec<String>,
    /// Project-level acceptance criteria.
    #[serde(default)]
    pub acceptance: Vec<String>,
}

/// A human-approved unit of work producing a DAG of tickets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Unique identifier.
    pub session_id: SessionId,
    /// Tenant boundary.
    pub tenant_id: TenantId,
    /// Owning project; assigned when the build starts.
    pub project_id: Option<ProjectId>,
    /// Current lifecycle state.
    pub state: SessionState,
    /// Project name supplied at creation.
    pub project_name: String,
    /// Natural-language description supplied at creation.
    pub description: String,
    /// Clarification context gathered so far.
    pub gathered: GatheredContext,
    /// The current spec blob, draft or approved.
    pub spec: Option<SpecDoc>,
    /// Coverage progress percentage (mirrors `gathered.coverage`).
    pub progress: u8,
    /// How the session entered the system.
    pub source: SourceType,
    /// Optional repository under analysis.
    pub repo_url: Option<String>,
    /// Opaque repository analysis blob.
    pub analysis: Option<Json>,
    /// Number of clarification turns consumed.
    pub clarification_turns: u32,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
    /// When a terminal state was reached.
    pub completed_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Messages, events, approvals
// =============================================================================

/// Role of a chat message within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    /// Sent by the human.
    User,
    /// Sent by the clarifier/spec LLM.
    Assistant,
    /// Injected by the platform.
    System,
}

/// One chat turn within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier.
    pub message_id: uuid::Uuid,
    /// Owning session.
    pub session_id: SessionId,
    /// Who sent it.
    pub role: MessageRole,
    /// Message body.
    pub content: String,
    /// Free-form message type tag (`chat`, `clarification`, `spec`, ...).
    pub message_type: String,
    /// Opaque metadata.
    pub metadata: Json,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// Who performed an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    /// A human user.
    User,
    /// The platform itself (dispatcher, reclaimer, cascade).
    System,
    /// The clarifier/spec LLM.
    Ai,
    /// A coding agent inside a VM.
    Agent,
}

/// Append-only audit record. The event log is the source of truth for
/// recovery and observability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier.
    pub event_id: uuid::Uuid,
    /// Subject ticket, when ticket-scoped.
    pub ticket_id: Option<TicketId>,
    /// Subject session, when session-scoped.
    pub session_id: Option<SessionId>,
    /// State before the change, if the event records a transition.
    pub from_state: Option<String>,
    /// State after the change, if the event records a transition.
    pub to_state: Option<String>,
    /// What happened (`claim`, `heartbeat`, `cascade`, `approve`, ...).
    pub action: String,
    /// Who did it.
    pub actor: Actor,
    /// Identity of the actor, when known.
    pub actor_id: Option<String>,
    /// Opaque detail blob.
    pub metadata: Json,
    /// Creation timestamp; also the log ordering key.
    pub created_at: DateTime<Utc>,
}

/// Kind of a recorded human decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalKind {
    /// Approval of the generated spec.
    SpecApproval,
    /// Confirmation to start the build.
    BuildStart,
    /// Request to revise the spec.
    RevisionRequest,
}

/// A recorded human decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    /// Unique identifier.
    pub approval_id: uuid::Uuid,
    /// Owning session.
    pub session_id: SessionId,
    /// Decision kind.
    pub kind: ApprovalKind,
    /// Identity of the approver.
    pub approver: String,
    /// Source IP, when captured at the transport layer.
    pub ip: Option<String>,
    /// User agent, when captured at the transport layer.
    pub user_agent: Option<String>,
    /// Opaque decision payload (e.g. revision feedback).
    pub data: Json,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_is_absorbing() {
        for to in [
            TicketState::Draft,
            TicketState::Ready,
            TicketState::Claimed,
            TicketState::Failed,
            TicketState::Cancelled,
        ] {
            assert!(!TicketState::can_transition(TicketState::Completed, to));
        }
    }

    #[test]
    fn cancel_from_any_non_terminal() {
        for from in [
            TicketState::Draft,
            TicketState::Blocked,
            TicketState::Ready,
            TicketState::Hold,
            TicketState::Claimed,
            TicketState::InProgress,
            TicketState::Review,
        ] {
            assert!(TicketState::can_transition(from, TicketState::Cancelled));
        }
        assert!(!TicketState::can_transition(
            TicketState::Failed,
            TicketState::Cancelled
        ));
    }

    #[test]
    fn requeue_paths() {
        assert!(TicketState::can_transition(
            TicketState::Claimed,
            TicketState::Ready
        ));
        assert!(TicketState::can_transition(
            TicketState::InProgress,
            TicketState::Ready
        ));
        assert!(TicketState::can_transition(
            TicketState::Review,
            TicketState::Ready
        ));
        assert!(!TicketState::can_transition(
            TicketState::Draft,
            TicketState::Claimed
        ));
    }

    #[test]
    fn state_u8_roundtrip() {
        for state in [
            TicketState::Draft,
            TicketState::Blocked,
            TicketState::Ready,
            TicketState::Claimed,
            TicketState::InProgress,
            TicketState::Review,
            TicketState::Hold,
            TicketState::Completed,
            TicketState::Failed,
            TicketState::Cancelled,
        ] {
            assert_eq!(TicketState::from_u8(state.as_u8()), Some(state));
        }
        assert_eq!(TicketState::from_u8(0), None);
    }

    #[test]
    fn gathered_context_empty() {
        let mut gathered = GatheredContext::default();
        assert!(gathered.is_empty());

        gathered
            .categories
            .entry("tech_stack".to_string())
            .or_default()
            .insert("language".to_string(), serde_json::json!("rust"));
        assert!(!gathered.is_empty());
    }

    #[test]
    fn spec_doc_serde() {
        let json = serde_json::json!({
            "title": "Health endpoint",
            "summary": "Add /health returning 200",
            "features": [
                {"name": "health", "description": "endpoint", "acceptance": ["returns 200"]}
            ]
        });
        let spec: SpecDoc = serde_json::from_value(json).unwrap();
        assert_eq!(spec.features.len(), 1);
        assert!(spec.goals.is_empty());
    }
}
