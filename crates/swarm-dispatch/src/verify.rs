//! Verification of agent results and the completion path.
//!
//! An agent result moves the ticket to `review`, runs the verifier, and
//! either opens a PR and completes, requeues with feedback, or fails the
//! ticket out. A verifier rejection is a normal path, never an error.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use swarm_adapters::{
    retry_with_backoff, BackoffPolicy, PrRequest, VcsClient, Verdict, VerdictStatus, Verifier,
    VerifyRequest, VmBackend,
};
use swarm_bus::{BusEvent, EventBus, EventKind, Room};
use swarm_core::{Classified, CoreConfig, FaultClass, TicketId};
use swarm_store::{
    Actor, CriterionStatus, Store, Ticket, TicketPatch, TicketState, VerificationStatus,
};
use tokio::sync::mpsc;

use crate::cascade::CompletionSignal;
use crate::error::{DispatchError, Result};
use crate::registry::VmRegistry;
use crate::transitions::{publish_ticket_update, record_ticket_event, requeue_or_fail};

/// Per-criterion status reported by the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriterionUpdate {
    /// Criterion identifier (`AC-1`, ...).
    pub id: String,
    /// Reported status.
    pub status: CriterionStatus,
}

/// A structured agent result, posted on completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    /// The reporting agent.
    pub agent_id: String,
    /// Whether the agent believes it succeeded.
    pub success: bool,
    /// Human-readable summary of the change.
    #[serde(default)]
    pub summary: Option<String>,
    /// PR URL, when the agent opened one itself.
    #[serde(default)]
    pub pr_url: Option<String>,
    /// Fatal error reported by the agent.
    #[serde(default)]
    pub error: Option<String>,
    /// Acceptance criterion statuses.
    #[serde(default)]
    pub criteria_status: Vec<CriterionUpdate>,
    /// Files the agent changed.
    #[serde(default)]
    pub files_changed: Vec<String>,
}

/// Outcome of processing one agent result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultOutcome {
    /// Verified, PR opened, ticket completed.
    Completed,
    /// Attempt failed; ticket requeued with feedback.
    Requeued,
    /// Attempts exhausted or fatal fault; ticket failed.
    Failed,
    /// The ticket was cancelled before the result arrived; discarded.
    Discarded,
}

/// The verification + completion pipeline.
pub struct ResultPipeline<S: Store + ?Sized> {
    store: Arc<S>,
    bus: EventBus,
    verifier: Arc<dyn Verifier>,
    vcs: Arc<dyn VcsClient>,
    vm: Arc<dyn VmBackend>,
    registry: Arc<VmRegistry>,
    config: CoreConfig,
    completions: mpsc::UnboundedSender<CompletionSignal>,
    backoff: BackoffPolicy,
}

impl<S: Store + ?Sized> ResultPipeline<S> {
    /// Create a pipeline.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<S>,
        bus: EventBus,
        verifier: Arc<dyn Verifier>,
        vcs: Arc<dyn VcsClient>,
        vm: Arc<dyn VmBackend>,
        registry: Arc<VmRegistry>,
        config: CoreConfig,
        completions: mpsc::UnboundedSender<CompletionSignal>,
    ) -> Self {
        Self {
            store,
            bus,
            verifier,
            vcs,
            vm,
            registry,
            config,
            completions,
            backoff: BackoffPolicy::default(),
        }
    }

    /// Process one agent result end to end.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::NotLeaseHolder` for a foreign agent and
    /// `DispatchError::WrongState` when the ticket is not executing.
    pub async fn process_agent_result(
        &self,
        ticket_id: &TicketId,
        result: &AgentResult,
    ) -> Result<ResultOutcome> {
        let ticket = self
            .store
            .get_ticket(ticket_id)?
            .ok_or(DispatchError::TicketNotFound(*ticket_id))?;

        // A post-cancel result is acknowledged and discarded.
        if ticket.state == TicketState::Cancelled {
            record_ticket_event(
                &*self.store,
                &ticket,
                None,
                None,
                "result_discarded",
                Actor::Agent,
                serde_json::json!({ "agent_id": result.agent_id }),
            )?;
            self.teardown_vm(ticket_id).await;
            return Ok(ResultOutcome::Discarded);
        }

        if ticket.assignee.as_deref() != Some(result.agent_id.as_str()) {
            return Err(DispatchError::NotLeaseHolder {
                ticket_id: *ticket_id,
                caller: result.agent_id.clone(),
            });
        }
        if !ticket.state.is_in_flight() {
            return Err(DispatchError::WrongState {
                ticket_id: *ticket_id,
                state: ticket.state,
            });
        }

        // Record the agent's outputs and criterion statuses.
        let mut criteria = ticket.acceptance_criteria.clone();
        for update in &result.criteria_status {
            if let Some(criterion) = criteria.iter_mut().find(|c| c.id == update.id) {
                criterion.status = update.status;
            }
        }
        let outputs = serde_json::json!({
            "summary": result.summary,
            "files_changed": result.files_changed,
            "criteria_status": result.criteria_status,
        });

        // Agent-reported fatal error: a failed attempt, not a verdict.
        if !result.success {
            let reason = result
                .error
                .clone()
                .unwrap_or_else(|| "agent reported failure".to_string());
            let updated = self.fail_attempt(&ticket, &reason, Some(criteria), Some(outputs))?;
            self.teardown_vm(ticket_id).await;
            return Ok(self.outcome_for(&updated));
        }

        // A blocked criterion short-circuits verification as a failed
        // attempt.
        if criteria
            .iter()
            .any(|c| c.status == CriterionStatus::Blocked)
        {
            let blocked: Vec<&str> = criteria
                .iter()
                .filter(|c| c.status == CriterionStatus::Blocked)
                .map(|c| c.id.as_str())
                .collect();
            let reason = format!("blocked acceptance criteria: {}", blocked.join(", "));

            self.store.update_ticket(
                ticket_id,
                TicketPatch {
                    acceptance_criteria: Some(criteria.clone()),
                    verification: Some(VerificationStatus::Skipped),
                    outputs: Some(Some(outputs)),
                    ..TicketPatch::default()
                },
                None,
            )?;
            let reloaded = self
                .store
                .get_ticket(ticket_id)?
                .ok_or(DispatchError::TicketNotFound(*ticket_id))?;
            let updated = requeue_or_fail(
                &*self.store,
                &self.bus,
                &self.config,
                &reloaded,
                &reason,
                Actor::System,
            )?;
            self.signal_terminal(&updated);
            self.teardown_vm(ticket_id).await;
            return Ok(self.outcome_for(&updated));
        }

        // Move to review and run the verifier.
        let from = ticket.state;
        let in_review = self.store.update_ticket(
            ticket_id,
            TicketPatch {
                state: Some(TicketState::Review),
                acceptance_criteria: Some(criteria),
                outputs: Some(Some(outputs)),
                ..TicketPatch::default()
            },
            Some(from),
        )?;
        record_ticket_event(
            &*self.store,
            &in_review,
            Some(from),
            Some(TicketState::Review),
            "agent_result",
            Actor::Agent,
            serde_json::json!({ "files_changed": result.files_changed.len() }),
        )?;
        publish_ticket_update(&self.bus, &in_review);

        let verdict = self.run_verifier(&in_review).await;
        let outcome = match verdict {
            Ok(verdict) => self.apply_verdict(&in_review, &verdict, result).await?,
            Err(err) if err.class() == FaultClass::Fatal => {
                // Deterministic verifier failure: fail fast.
                let failed = self.store.update_ticket(
                    ticket_id,
                    TicketPatch {
                        state: Some(TicketState::Failed),
                        verification: Some(VerificationStatus::Failed),
                        error_message: Some(Some(err.to_string())),
                        ..TicketPatch::default()
                    },
                    Some(TicketState::Review),
                )?;
                record_ticket_event(
                    &*self.store,
                    &failed,
                    Some(TicketState::Review),
                    Some(TicketState::Failed),
                    "verifier_fatal",
                    Actor::System,
                    serde_json::json!({ "error": err.to_string() }),
                )?;
                publish_ticket_update(&self.bus, &failed);
                self.signal_terminal(&failed);
                ResultOutcome::Failed
            }
            Err(err) => {
                // Transient budget spent: a failed attempt, not a failed
                // ticket.
                let updated = requeue_or_fail(
                    &*self.store,
                    &self.bus,
                    &self.config,
                    &in_review,
                    &format!("verifier unreachable: {err}"),
                    Actor::System,
                )?;
                self.signal_terminal(&updated);
                self.outcome_for(&updated)
            }
        };

        self.teardown_vm(ticket_id).await;
        Ok(outcome)
    }

    async fn run_verifier(
        &self,
        ticket: &Ticket,
    ) -> std::result::Result<Verdict, swarm_adapters::AdapterError> {
        let repo_url = self
            .store
            .get_session(&ticket.session_id)
            .ok()
            .flatten()
            .and_then(|session| session.repo_url);

        let request = VerifyRequest {
            ticket_id: ticket.ticket_id,
            branch: ticket
                .branch_name
                .clone()
                .unwrap_or_else(|| format!("swarm/{}", ticket.ticket_id)),
            repo_url,
            attempt: ticket.attempt,
            phases: vec!["static".to_string(), "automated".to_string()],
        };

        retry_with_backoff(&self.backoff, || async {
            self.verifier.verify(&request).await
        })
        .await
    }

    async fn apply_verdict(
        &self,
        ticket: &Ticket,
        verdict: &Verdict,
        result: &AgentResult,
    ) -> Result<ResultOutcome> {
        match verdict.status {
            VerdictStatus::Passed => self.complete_ticket(ticket, result).await,
            VerdictStatus::Failed => {
                let feedback = verdict
                    .feedback_for_agent
                    .clone()
                    .unwrap_or_else(|| "verification failed".to_string());

                record_ticket_event(
                    &*self.store,
                    ticket,
                    None,
                    None,
                    "verifier_rejected",
                    Actor::System,
                    serde_json::json!({ "feedback": feedback }),
                )?;

                // Attach the feedback so the next claim surfaces it to the
                // agent.
                let mut outputs = ticket
                    .outputs
                    .clone()
                    .unwrap_or_else(|| serde_json::json!({}));
                if let Some(map) = outputs.as_object_mut() {
                    map.insert(
                        "verifier_feedback".to_string(),
                        serde_json::Value::String(feedback.clone()),
                    );
                }
                self.store.update_ticket(
                    &ticket.ticket_id,
                    TicketPatch {
                        verification: Some(VerificationStatus::Failed),
                        rejection_count: Some(ticket.rejection_count + 1),
                        outputs: Some(Some(outputs)),
                        ..TicketPatch::default()
                    },
                    None,
                )?;

                let reloaded = self
                    .store
                    .get_ticket(&ticket.ticket_id)?
                    .ok_or(DispatchError::TicketNotFound(ticket.ticket_id))?;
                let updated = requeue_or_fail(
                    &*self.store,
                    &self.bus,
                    &self.config,
                    &reloaded,
                    &feedback,
                    Actor::System,
                )?;
                self.signal_terminal(&updated);
                Ok(self.outcome_for(&updated))
            }
        }
    }

    async fn complete_ticket(
        &self,
        ticket: &Ticket,
        result: &AgentResult,
    ) -> Result<ResultOutcome> {
        // Open the PR unless the agent already did.
        let pr_url = match &result.pr_url {
            Some(url) => Some(url.clone()),
            None => match self.open_pr(ticket, result).await {
                Ok(url) => Some(url),
                Err(err) if err.class() == FaultClass::Fatal => {
                    return self.fail_fatal(ticket, &format!("pr open rejected: {err}"));
                }
                Err(err) => {
                    let updated = requeue_or_fail(
                        &*self.store,
                        &self.bus,
                        &self.config,
                        ticket,
                        &format!("pr open failed: {err}"),
                        Actor::System,
                    )?;
                    self.signal_terminal(&updated);
                    return Ok(self.outcome_for(&updated));
                }
            },
        };

        let completed = self.store.update_ticket(
            &ticket.ticket_id,
            TicketPatch {
                state: Some(TicketState::Completed),
                verification: Some(VerificationStatus::Passed),
                pr_url: Some(pr_url),
                error_message: Some(None),
                ..TicketPatch::default()
            },
            Some(TicketState::Review),
        )?;
        record_ticket_event(
            &*self.store,
            &completed,
            Some(TicketState::Review),
            Some(TicketState::Completed),
            "completed",
            Actor::System,
            serde_json::json!({ "pr_url": completed.pr_url }),
        )?;
        publish_ticket_update(&self.bus, &completed);
        self.signal_terminal(&completed);

        tracing::info!(
            ticket_id = %completed.ticket_id,
            pr_url = ?completed.pr_url,
            "Ticket completed"
        );
        Ok(ResultOutcome::Completed)
    }

    async fn open_pr(
        &self,
        ticket: &Ticket,
        result: &AgentResult,
    ) -> std::result::Result<String, swarm_adapters::AdapterError> {
        let session = self.store.get_session(&ticket.session_id).ok().flatten();
        let repo_url = session
            .and_then(|s| s.repo_url)
            .unwrap_or_else(|| format!("swarm://{}", ticket.project_id));
        let branch = ticket
            .branch_name
            .clone()
            .unwrap_or_else(|| format!("swarm/{}", ticket.ticket_id));

        let request = PrRequest {
            title: ticket.title.clone(),
            body: result
                .summary
                .clone()
                .unwrap_or_else(|| ticket.description.clone()),
            head: branch,
            base: "main".to_string(),
        };

        retry_with_backoff(&self.backoff, || async {
            self.vcs.open_pr(&repo_url, &request).await
        })
        .await
    }

    fn fail_attempt(
        &self,
        ticket: &Ticket,
        reason: &str,
        criteria: Option<Vec<swarm_store::AcceptanceCriterion>>,
        outputs: Option<swarm_core::Json>,
    ) -> Result<Ticket> {
        if criteria.is_some() || outputs.is_some() {
            self.store.update_ticket(
                &ticket.ticket_id,
                TicketPatch {
                    acceptance_criteria: criteria,
                    outputs: outputs.map(Some),
                    ..TicketPatch::default()
                },
                None,
            )?;
        }
        let reloaded = self
            .store
            .get_ticket(&ticket.ticket_id)?
            .ok_or(DispatchError::TicketNotFound(ticket.ticket_id))?;
        let updated = requeue_or_fail(
            &*self.store,
            &self.bus,
            &self.config,
            &reloaded,
            reason,
            Actor::Agent,
        )?;
        self.signal_terminal(&updated);
        Ok(updated)
    }

    fn fail_fatal(&self, ticket: &Ticket, reason: &str) -> Result<ResultOutcome> {
        let failed = self.store.update_ticket(
            &ticket.ticket_id,
            TicketPatch {
                state: Some(TicketState::Failed),
                error_message: Some(Some(reason.to_string())),
                ..TicketPatch::default()
            },
            None,
        )?;
        record_ticket_event(
            &*self.store,
            &failed,
            Some(ticket.state),
            Some(TicketState::Failed),
            "fatal",
            Actor::System,
            serde_json::json!({ "reason": reason }),
        )?;
        publish_ticket_update(&self.bus, &failed);
        self.signal_terminal(&failed);
        Ok(ResultOutcome::Failed)
    }

    fn outcome_for(&self, ticket: &Ticket) -> ResultOutcome {
        match ticket.state {
            TicketState::Failed => ResultOutcome::Failed,
            TicketState::Completed => ResultOutcome::Completed,
            _ => ResultOutcome::Requeued,
        }
    }

    fn signal_terminal(&self, ticket: &Ticket) {
        if ticket.state.is_terminal() {
            let _ = self.completions.send(CompletionSignal {
                ticket_id: ticket.ticket_id,
            });
        }
    }

    async fn teardown_vm(&self, ticket_id: &TicketId) {
        if let Some(handle) = self.registry.remove(ticket_id) {
            if let Err(err) = self.vm.teardown(&handle).await {
                tracing::error!(
                    vm_id = %handle.vm_id,
                    error = %err,
                    "VM teardown failed after result"
                );
            }
            self.bus.publish(
                &[Room::VmFleet],
                &BusEvent::new(
                    EventKind::VmState,
                    serde_json::json!({
                        "vm_id": handle.vm_id,
                        "ticket_id": ticket_id,
                        "state": "terminated",
                    }),
                ),
            );
        }
    }
}
