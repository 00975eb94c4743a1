//! The agent-pull dispatcher.
//!
//! Reconciles ready work with available VM capacity. Claims are atomic in
//! the store; VM spawning happens strictly outside any store lock, with a
//! spawn failure consuming an attempt rather than failing the ticket.

use std::sync::Arc;

use swarm_adapters::{retry_with_backoff, BackoffPolicy, JobContext, VmBackend};
use swarm_bus::{BusEvent, EventBus, EventKind, Room};
use swarm_core::{CoreConfig, TicketId, VmId};
use swarm_store::{
    Actor, AssigneeKind, ClaimRequest, Store, Ticket, TicketPatch, TicketState,
};
use tokio::sync::mpsc;

use crate::cascade::CompletionSignal;
use crate::error::{DispatchError, Result};
use crate::registry::VmRegistry;
use crate::transitions::{publish_ticket_update, record_ticket_event, requeue_or_fail};

/// Assignee recorded at claim time, before the VM identity is bound.
const DISPATCHER_ASSIGNEE: &str = "swarm-dispatcher";

/// Upper bound on claims per poll cycle.
const BATCH_SIZE: u32 = 8;

/// The dispatcher.
pub struct Dispatcher<S: Store + ?Sized> {
    store: Arc<S>,
    vm: Arc<dyn VmBackend>,
    bus: EventBus,
    registry: Arc<VmRegistry>,
    config: CoreConfig,
    completions: mpsc::UnboundedSender<CompletionSignal>,
    backoff: BackoffPolicy,
}

impl<S: Store + ?Sized> Dispatcher<S> {
    /// Create a dispatcher.
    #[must_use]
    pub fn new(
        store: Arc<S>,
        vm: Arc<dyn VmBackend>,
        bus: EventBus,
        registry: Arc<VmRegistry>,
        config: CoreConfig,
        completions: mpsc::UnboundedSender<CompletionSignal>,
    ) -> Self {
        Self {
            store,
            vm,
            bus,
            registry,
            config,
            completions,
            backoff: BackoffPolicy::default(),
        }
    }

    fn signal_terminal(&self, ticket: &Ticket) {
        if ticket.state.is_terminal() {
            let _ = self.completions.send(CompletionSignal {
                ticket_id: ticket.ticket_id,
            });
        }
    }

    /// One poll cycle: claim up to the open capacity and spawn VMs for the
    /// claims. Returns the number of VMs spawned.
    ///
    /// # Errors
    ///
    /// Returns an error only for store failures; individual spawn failures
    /// consume an attempt and never abort the cycle.
    pub async fn dispatch_once(&self) -> Result<u32> {
        let in_flight = self.store.count_in_flight()?;
        let capacity = self.config.max_fleet.saturating_sub(in_flight);
        if capacity == 0 {
            return Ok(0);
        }

        let mut spawned = 0u32;
        for _ in 0..capacity.min(BATCH_SIZE) {
            let Some(claimed) = self.store.claim_next_ready(&ClaimRequest {
                assignee: DISPATCHER_ASSIGNEE.to_string(),
                assignee_kind: AssigneeKind::Agent,
                vm_id: None,
                lease: self.config.lease_duration(),
                tenant: None,
                project: None,
                tenant_cap: Some(self.config.tenant_cap()),
            })?
            else {
                break;
            };

            let Some(vm_id) = claimed.vm_id else {
                // The claim contract always binds a VM identity.
                continue;
            };

            // Rebind the assignee to the VM identity so the agent's calls
            // authenticate against the lease.
            let ticket = self.store.update_ticket(
                &claimed.ticket_id,
                TicketPatch {
                    assignee: Some(Some(vm_id.to_hex())),
                    ..TicketPatch::default()
                },
                Some(TicketState::Claimed),
            )?;

            record_ticket_event(
                &*self.store,
                &ticket,
                Some(TicketState::Ready),
                Some(TicketState::Claimed),
                "claim",
                Actor::System,
                serde_json::json!({ "vm_id": vm_id, "attempt": ticket.attempt }),
            )?;
            publish_ticket_update(&self.bus, &ticket);

            // Spawn outside any store lock; the claim transaction committed
            // above.
            if self.spawn_vm(&ticket, vm_id).await? {
                spawned += 1;
            }
        }

        Ok(spawned)
    }

    async fn spawn_vm(&self, ticket: &Ticket, vm_id: VmId) -> Result<bool> {
        let repo_url = self
            .store
            .get_session(&ticket.session_id)?
            .and_then(|session| session.repo_url);

        let job = JobContext {
            ticket_id: ticket.ticket_id,
            session_id: ticket.session_id,
            tenant_id: ticket.tenant_id,
            attempt: ticket.attempt,
            branch_name: ticket
                .branch_name
                .clone()
                .unwrap_or_else(|| format!("swarm/{}", ticket.ticket_id)),
            repo_url,
            credential_names: vec!["GIT_TOKEN".to_string(), "LLM_API_KEY".to_string()],
        };

        match retry_with_backoff(&self.backoff, || async { self.vm.spawn(&vm_id, &job).await })
            .await
        {
            Ok(handle) => {
                self.registry.insert(ticket.ticket_id, handle);
                self.bus.publish(
                    &[Room::VmFleet, Room::Tenant(ticket.tenant_id)],
                    &BusEvent::new(
                        EventKind::VmState,
                        serde_json::json!({
                            "vm_id": vm_id,
                            "ticket_id": ticket.ticket_id,
                            "state": "spawned",
                        }),
                    ),
                );
                Ok(true)
            }
            Err(err) => {
                tracing::error!(
                    ticket_id = %ticket.ticket_id,
                    vm_id = %vm_id,
                    error = %err,
                    "VM spawn failed"
                );
                let updated = requeue_or_fail(
                    &*self.store,
                    &self.bus,
                    &self.config,
                    ticket,
                    &format!("vm spawn failed: {err}"),
                    Actor::System,
                )?;
                self.signal_terminal(&updated);
                Ok(false)
            }
        }
    }

    /// Serve an agent's pull.
    ///
    /// A VM-bound agent (its id is the VM identity the dispatcher spawned)
    /// receives its bound ticket and acknowledges readiness, moving it to
    /// `in_progress`. Any other agent claims the next ready ticket
    /// atomically. Returns `None` when no work is available.
    ///
    /// # Errors
    ///
    /// Returns an error if a store operation fails.
    pub fn claim_for_agent(
        &self,
        agent_id: &str,
        project: Option<swarm_core::ProjectId>,
    ) -> Result<Option<Ticket>> {
        if let Ok(vm_id) = VmId::from_hex(agent_id) {
            if let Some(ticket_id) = self.registry.find_by_vm(&vm_id) {
                return self.acknowledge(&ticket_id, agent_id).map(Some);
            }
        }

        // Standalone pull: claim and acknowledge in one round trip, since
        // the agent is evidently up.
        let Some(claimed) = self.store.claim_next_ready(&ClaimRequest {
            assignee: agent_id.to_string(),
            assignee_kind: AssigneeKind::Agent,
            vm_id: None,
            lease: self.config.lease_duration(),
            tenant: None,
            project,
            tenant_cap: Some(self.config.tenant_cap()),
        })?
        else {
            return Ok(None);
        };

        record_ticket_event(
            &*self.store,
            &claimed,
            Some(TicketState::Ready),
            Some(TicketState::Claimed),
            "claim",
            Actor::Agent,
            serde_json::json!({ "agent_id": agent_id }),
        )?;
        publish_ticket_update(&self.bus, &claimed);

        self.acknowledge(&claimed.ticket_id, agent_id).map(Some)
    }

    /// Move a claimed ticket to `in_progress` once its agent is ready.
    /// Idempotent for the holding agent.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::NotLeaseHolder` for a foreign agent and
    /// `DispatchError::WrongState` outside `claimed`/`in_progress`.
    pub fn acknowledge(&self, ticket_id: &TicketId, agent_id: &str) -> Result<Ticket> {
        let ticket = self.load(ticket_id)?;

        if ticket.assignee.as_deref() != Some(agent_id) {
            return Err(DispatchError::NotLeaseHolder {
                ticket_id: *ticket_id,
                caller: agent_id.to_string(),
            });
        }
        match ticket.state {
            TicketState::InProgress => return Ok(ticket),
            TicketState::Claimed => {}
            state => {
                return Err(DispatchError::WrongState {
                    ticket_id: *ticket_id,
                    state,
                })
            }
        }

        let updated = self.store.update_ticket(
            ticket_id,
            TicketPatch {
                state: Some(TicketState::InProgress),
                ..TicketPatch::default()
            },
            Some(TicketState::Claimed),
        )?;
        record_ticket_event(
            &*self.store,
            &updated,
            Some(TicketState::Claimed),
            Some(TicketState::InProgress),
            "agent_ready",
            Actor::Agent,
            serde_json::json!({}),
        )?;
        publish_ticket_update(&self.bus, &updated);
        Ok(updated)
    }

    /// Cancel a ticket: mark `cancelled` first, then signal the VM.
    /// Teardown runs regardless of the VM's state. Idempotent for an
    /// already-cancelled ticket.
    ///
    /// # Errors
    ///
    /// Returns an error if the ticket does not exist or sits in another
    /// terminal state.
    pub async fn cancel_ticket(&self, ticket_id: &TicketId, actor_id: &str) -> Result<Ticket> {
        let ticket = self.load(ticket_id)?;
        if ticket.state == TicketState::Cancelled {
            return Ok(ticket);
        }

        let from = ticket.state;
        let updated = self.store.update_ticket(
            ticket_id,
            TicketPatch {
                state: Some(TicketState::Cancelled),
                ..TicketPatch::default()
            },
            Some(from),
        )?;
        record_ticket_event(
            &*self.store,
            &updated,
            Some(from),
            Some(TicketState::Cancelled),
            "cancel",
            Actor::User,
            serde_json::json!({ "actor_id": actor_id }),
        )?;
        publish_ticket_update(&self.bus, &updated);

        self.teardown_vm(ticket_id).await;
        self.signal_terminal(&updated);
        Ok(updated)
    }

    /// Voluntary release: the agent returns the ticket without completing
    /// it. No attempt is consumed.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::NotLeaseHolder` for a foreign agent and
    /// `DispatchError::WrongState` when the ticket is not in flight.
    pub async fn release_ticket(&self, ticket_id: &TicketId, agent_id: &str) -> Result<Ticket> {
        let ticket = self.load(ticket_id)?;

        if ticket.assignee.as_deref() != Some(agent_id) {
            return Err(DispatchError::NotLeaseHolder {
                ticket_id: *ticket_id,
                caller: agent_id.to_string(),
            });
        }
        if !ticket.state.is_in_flight() {
            return Err(DispatchError::WrongState {
                ticket_id: *ticket_id,
                state: ticket.state,
            });
        }

        let from = ticket.state;
        let updated = self.store.update_ticket(
            ticket_id,
            TicketPatch {
                state: Some(TicketState::Ready),
                assignee: Some(None),
                vm_id: Some(None),
                lease_expires_at: Some(None),
                last_heartbeat_at: Some(None),
                ..TicketPatch::default()
            },
            Some(from),
        )?;
        record_ticket_event(
            &*self.store,
            &updated,
            Some(from),
            Some(TicketState::Ready),
            "release",
            Actor::Agent,
            serde_json::json!({ "agent_id": agent_id }),
        )?;
        publish_ticket_update(&self.bus, &updated);

        self.teardown_vm(ticket_id).await;
        Ok(updated)
    }

    async fn teardown_vm(&self, ticket_id: &TicketId) {
        if let Some(handle) = self.registry.remove(ticket_id) {
            if let Err(err) = self.vm.teardown(&handle).await {
                tracing::error!(
                    vm_id = %handle.vm_id,
                    error = %err,
                    "VM teardown failed; leaving for backend reconciliation"
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

    fn load(&self, ticket_id: &TicketId) -> Result<Ticket> {
        self.store
            .get_ticket(ticket_id)?
            .ok_or(DispatchError::TicketNotFound(*ticket_id))
    }

    /// Run the poll loop until shutdown.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.dispatch_once().await {
                        Ok(spawned) if spawned > 0 => {
                            tracing::debug!(spawned, "Dispatch cycle complete");
                        }
                        Ok(_) => {}
                        Err(err) => {
                            tracing::error!(error = %err, "Dispatch cycle failed");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::debug!("Dispatcher stopping");
                        return;
                    }
                }
            }
        }
    }
}
