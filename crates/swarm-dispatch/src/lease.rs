//! Lease liveness: the heartbeat publisher and the stale reclaimer.
//!
//! Two independent periodic tasks. The publisher refreshes leases for VMs
//! the coordinator owns and can observe as healthy; the reclaimer requeues
//! work whose heartbeats stopped. Both are single-coordinator only.

use std::sync::Arc;

use chrono::Utc;
use swarm_adapters::VmBackend;
use swarm_bus::{BusEvent, EventBus, EventKind, Room};
use swarm_core::CoreConfig;
use swarm_store::{Actor, Store, TicketState};
use tokio::sync::mpsc;

use crate::cascade::CompletionSignal;
use crate::error::Result;
use crate::registry::VmRegistry;
use crate::transitions::{record_ticket_event, requeue_or_fail};

/// Refreshes heartbeats and extends leases for coordinator-owned VMs.
pub struct HeartbeatPublisher<S: Store + ?Sized> {
    store: Arc<S>,
    vm: Arc<dyn VmBackend>,
    registry: Arc<VmRegistry>,
    config: CoreConfig,
}

impl<S: Store + ?Sized> HeartbeatPublisher<S> {
    /// Create a publisher.
    #[must_use]
    pub fn new(
        store: Arc<S>,
        vm: Arc<dyn VmBackend>,
        registry: Arc<VmRegistry>,
        config: CoreConfig,
    ) -> Self {
        Self {
            store,
            vm,
            registry,
            config,
        }
    }

    /// One refresh pass. Returns the number of leases extended.
    ///
    /// A VM that fails its health probe is skipped: its lease ages out and
    /// the reclaimer takes it from there.
    ///
    /// # Errors
    ///
    /// Returns an error if a store read fails.
    pub async fn tick(&self) -> Result<u32> {
        let mut refreshed = 0u32;

        for (ticket_id, handle) in self.registry.entries() {
            let Some(ticket) = self.store.get_ticket(&ticket_id)? else {
                self.registry.remove(&ticket_id);
                continue;
            };
            if ticket.state.is_terminal() {
                self.registry.remove(&ticket_id);
                continue;
            }
            if !ticket.state.is_in_flight() {
                continue;
            }

            let healthy = self.vm.health(&handle.vm_id).await.unwrap_or(false);
            if !healthy {
                tracing::warn!(
                    ticket_id = %ticket_id,
                    vm_id = %handle.vm_id,
                    "VM failed health probe; letting the lease age out"
                );
                continue;
            }

            let Some(assignee) = ticket.assignee.clone() else {
                continue;
            };
            match self
                .store
                .extend_lease(&ticket_id, &assignee, self.config.lease_duration())
            {
                Ok(expires) => {
                    refreshed += 1;
                    record_ticket_event(
                        &*self.store,
                        &ticket,
                        None,
                        None,
                        "heartbeat",
                        Actor::System,
                        serde_json::json!({ "lease_expires": expires }),
                    )?;
                }
                Err(err) => {
                    tracing::debug!(
                        ticket_id = %ticket_id,
                        error = %err,
                        "Lease extension skipped"
                    );
                }
            }
        }

        Ok(refreshed)
    }

    /// Run the heartbeat loop until shutdown.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.tick().await {
                        tracing::error!(error = %err, "Heartbeat pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::debug!("Heartbeat publisher stopping");
                        return;
                    }
                }
            }
        }
    }
}

/// Reclaims tickets whose heartbeats stopped.
pub struct StaleReclaimer<S: Store + ?Sized> {
    store: Arc<S>,
    vm: Arc<dyn VmBackend>,
    bus: EventBus,
    registry: Arc<VmRegistry>,
    config: CoreConfig,
    completions: mpsc::UnboundedSender<CompletionSignal>,
}

impl<S: Store + ?Sized> StaleReclaimer<S> {
    /// Create a reclaimer.
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
        }
    }

    /// One reclamation sweep. Returns the number of tickets reclaimed.
    ///
    /// Each stale ticket goes back to `ready` with an attempt consumed, or
    /// fails out once the budget is spent. The dead VM is torn down either
    /// way.
    ///
    /// # Errors
    ///
    /// Returns an error if a store read fails; per-ticket failures are
    /// logged and skipped.
    pub async fn sweep(&self) -> Result<u32> {
        let deadline = Utc::now()
            - chrono::Duration::from_std(self.config.stale_threshold())
                .unwrap_or_else(|_| chrono::Duration::minutes(5));

        let mut reclaimed = 0u32;
        for ticket in self.store.list_stale(deadline)? {
            tracing::warn!(
                ticket_id = %ticket.ticket_id,
                attempt = ticket.attempt,
                last_heartbeat = ?ticket.last_heartbeat_at,
                "Reclaiming stale lease"
            );

            let updated = match requeue_or_fail(
                &*self.store,
                &self.bus,
                &self.config,
                &ticket,
                "lease expired without heartbeat",
                Actor::System,
            ) {
                Ok(updated) => updated,
                Err(err) => {
                    tracing::error!(
                        ticket_id = %ticket.ticket_id,
                        error = %err,
                        "Reclamation failed for ticket"
                    );
                    continue;
                }
            };
            reclaimed += 1;

            if let Some(handle) = self.registry.remove(&ticket.ticket_id) {
                if let Err(err) = self.vm.teardown(&handle).await {
                    tracing::error!(
                        vm_id = %handle.vm_id,
                        error = %err,
                        "Teardown of stale VM failed"
                    );
                }
                self.bus.publish(
                    &[Room::VmFleet],
                    &BusEvent::new(
                        EventKind::VmState,
                        serde_json::json!({
                            "vm_id": handle.vm_id,
                            "ticket_id": ticket.ticket_id,
                            "state": "reclaimed",
                        }),
                    ),
                );
            }

            if updated.state == TicketState::Failed {
                let _ = self.completions.send(CompletionSignal {
                    ticket_id: updated.ticket_id,
                });
            }
        }

        Ok(reclaimed)
    }

    /// Run the reclamation loop until shutdown.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.reaper_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep().await {
                        Ok(reclaimed) if reclaimed > 0 => {
                            tracing::info!(reclaimed, "Stale sweep complete");
                        }
                        Ok(_) => {}
                        Err(err) => {
                            tracing::error!(error = %err, "Stale sweep failed");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::debug!("Stale reclaimer stopping");
                        return;
                    }
                }
            }
        }
    }
}
