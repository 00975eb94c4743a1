//! In-flight VM registry.
//!
//! VMs are owned by the dispatcher from claim until release; this registry
//! is the coordinator's record of which handle belongs to which ticket.
//! The store remains authoritative for ticket state.

use std::collections::HashMap;

use parking_lot::Mutex;
use swarm_adapters::VmHandle;
use swarm_core::{TicketId, VmId};

/// Registry of live VM handles keyed by ticket.
#[derive(Default)]
pub struct VmRegistry {
    inner: Mutex<HashMap<TicketId, VmHandle>>,
}

impl VmRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a handle for a ticket, replacing any previous binding.
    pub fn insert(&self, ticket_id: TicketId, handle: VmHandle) {
        self.inner.lock().insert(ticket_id, handle);
    }

    /// Remove and return the handle for a ticket.
    pub fn remove(&self, ticket_id: &TicketId) -> Option<VmHandle> {
        self.inner.lock().remove(ticket_id)
    }

    /// The handle currently bound to a ticket.
    #[must_use]
    pub fn get(&self, ticket_id: &TicketId) -> Option<VmHandle> {
        self.inner.lock().get(ticket_id).cloned()
    }

    /// Find the ticket bound to a VM identity.
    #[must_use]
    pub fn find_by_vm(&self, vm_id: &VmId) -> Option<TicketId> {
        self.inner
            .lock()
            .iter()
            .find(|(_, handle)| handle.vm_id == *vm_id)
            .map(|(ticket_id, _)| *ticket_id)
    }

    /// Snapshot of all live bindings.
    #[must_use]
    pub fn entries(&self) -> Vec<(TicketId, VmHandle)> {
        self.inner
            .lock()
            .iter()
            .map(|(id, handle)| (*id, handle.clone()))
            .collect()
    }

    /// Number of live VMs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
