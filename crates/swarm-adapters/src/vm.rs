//! VM backend adapter.
//!
//! The backend creates an isolated execution environment for one ticket
//! attempt and returns an address plus a teardown handle. The core never
//! sees how the environment is provisioned.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use swarm_core::{SessionId, TenantId, TicketId, VmId};

use crate::error::{AdapterError, Result};

/// Job context injected into a spawned VM.
///
/// Credentials are referenced by name only; the backend resolves them from
/// its secret store. Values never pass through the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobContext {
    /// The ticket this VM will execute.
    pub ticket_id: TicketId,
    /// The owning session.
    pub session_id: SessionId,
    /// Tenant boundary.
    pub tenant_id: TenantId,
    /// Attempt number for this pass.
    pub attempt: u32,
    /// Working branch the agent should use.
    pub branch_name: String,
    /// Repository to clone, when known.
    pub repo_url: Option<String>,
    /// Names of credentials the agent may request from its environment.
    pub credential_names: Vec<String>,
}

/// Handle to a running VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmHandle {
    /// The VM identity the ticket is bound to.
    pub vm_id: VmId,
    /// Network address of the agent runtime inside the VM.
    pub endpoint: String,
    /// Opaque handle used to tear the environment down.
    pub teardown_handle: String,
}

/// Trait for the VM spawn backend.
#[async_trait]
pub trait VmBackend: Send + Sync {
    /// Create an isolated execution environment for a job.
    ///
    /// # Errors
    ///
    /// Returns `AdapterError::Unavailable` for infrastructure failures,
    /// which the dispatcher treats as a failed attempt after retries.
    async fn spawn(&self, vm_id: &VmId, job: &JobContext) -> Result<VmHandle>;

    /// Destroy the environment. Called on completion, cancellation, and
    /// reclamation alike; must tolerate an already-gone target.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be reached.
    async fn teardown(&self, handle: &VmHandle) -> Result<()>;

    /// Whether the VM is still alive.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be reached.
    async fn health(&self, vm_id: &VmId) -> Result<bool>;
}

/// A no-op backend for local development without an orchestrator.
#[derive(Debug, Clone, Default)]
pub struct NoopVmBackend;

impl NoopVmBackend {
    /// Create a new no-op backend.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl VmBackend for NoopVmBackend {
    async fn spawn(&self, vm_id: &VmId, job: &JobContext) -> Result<VmHandle> {
        tracing::warn!(
            vm_id = %vm_id,
            ticket_id = %job.ticket_id,
            "NoopVmBackend: spawn called but no VM backend configured"
        );
        Ok(VmHandle {
            vm_id: *vm_id,
            endpoint: "localhost:8080".to_string(),
            teardown_handle: vm_id.to_hex(),
        })
    }

    async fn teardown(&self, handle: &VmHandle) -> Result<()> {
        tracing::warn!(
            vm_id = %handle.vm_id,
            "NoopVmBackend: teardown called but no VM backend configured"
        );
        Ok(())
    }

    async fn health(&self, _vm_id: &VmId) -> Result<bool> {
        Ok(true)
    }
}

/// A recording backend with failure injection, for tests.
#[derive(Default)]
pub struct FakeVmBackend {
    spawned: Mutex<Vec<JobContext>>,
    torn_down: Mutex<Vec<VmId>>,
    fail_spawns: Mutex<u32>,
}

impl FakeVmBackend {
    /// Create a fake backend that always succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` spawns fail as unavailable.
    pub fn fail_next_spawns(&self, count: u32) {
        *self.fail_spawns.lock() = count;
    }

    /// Jobs spawned so far.
    #[must_use]
    pub fn spawned(&self) -> Vec<JobContext> {
        self.spawned.lock().clone()
    }

    /// VMs torn down so far.
    #[must_use]
    pub fn torn_down(&self) -> Vec<VmId> {
        self.torn_down.lock().clone()
    }
}

#[async_trait]
impl VmBackend for FakeVmBackend {
    async fn spawn(&self, vm_id: &VmId, job: &JobContext) -> Result<VmHandle> {
        {
            let mut failures = self.fail_spawns.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(AdapterError::Unavailable("vm backend down".into()));
            }
        }
        self.spawned.lock().push(job.clone());
        Ok(VmHandle {
            vm_id: *vm_id,
            endpoint: format!("10.0.0.1:8080/{}", &vm_id.to_hex()[..8]),
            teardown_handle: vm_id.to_hex(),
        })
    }

    async fn teardown(&self, handle: &VmHandle) -> Result<()> {
        self.torn_down.lock().push(handle.vm_id);
        Ok(())
    }

    async fn health(&self, _vm_id: &VmId) -> Result<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> JobContext {
        JobContext {
            ticket_id: TicketId::generate(),
            session_id: SessionId::generate(),
            tenant_id: TenantId::generate(),
            attempt: 1,
            branch_name: "swarm/t-1".into(),
            repo_url: None,
            credential_names: vec!["GIT_TOKEN".into()],
        }
    }

    #[tokio::test]
    async fn fake_backend_records_and_fails_on_demand() {
        let backend = FakeVmBackend::new();
        let job = job();
        let vm_id = VmId::allocate_deterministic(&job.ticket_id, 1, 7);

        backend.fail_next_spawns(1);
        assert!(backend.spawn(&vm_id, &job).await.is_err());

        let handle = backend.spawn(&vm_id, &job).await.unwrap();
        assert_eq!(handle.vm_id, vm_id);
        assert_eq!(backend.spawned().len(), 1);

        backend.teardown(&handle).await.unwrap();
        assert_eq!(backend.torn_down(), vec![vm_id]);
    }

    #[tokio::test]
    async fn noop_backend_spawns_local_endpoint() {
        let backend = NoopVmBackend::new();
        let job = job();
        let vm_id = VmId::allocate_deterministic(&job.ticket_id, 1, 7);

        let handle = backend.spawn(&vm_id, &job).await.unwrap();
        assert_eq!(handle.endpoint, "localhost:8080");
        assert!(backend.health(&vm_id).await.unwrap());
    }
}
