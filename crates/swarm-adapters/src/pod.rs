//! Kubernetes pod implementation of the VM backend.
//!
//! Each ticket attempt runs in its own pod under a microVM runtime class.
//! Credentials reach the agent as secret references resolved by the
//! cluster; the control plane only ever handles their names.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, HTTPGetAction, Pod, PodSecurityContext,
    PodSpec, Probe, ResourceRequirements, SecretKeySelector,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, DeleteParams, ObjectMeta, PostParams};
use swarm_core::VmId;

use crate::error::{AdapterError, Result};
use crate::vm::{JobContext, VmBackend, VmHandle};

/// The container port for the agent runtime HTTP server.
const AGENT_PORT: i32 = 8080;

/// Configuration for the pod backend.
#[derive(Debug, Clone)]
pub struct PodBackendConfig {
    /// Namespace the agent pods run in.
    pub namespace: String,
    /// Agent runtime image.
    pub image: String,
    /// RuntimeClass for microVM isolation; `None` uses the default runtime.
    pub runtime_class: Option<String>,
    /// URL the agent uses to pull its job and post results.
    pub control_plane_url: String,
    /// Name of the Kubernetes secret holding agent credentials.
    pub secret_name: String,
    /// CPU allocation in millicores.
    pub cpu_millicores: u32,
    /// Memory allocation in megabytes.
    pub memory_mb: u32,
}

impl Default for PodBackendConfig {
    fn default() -> Self {
        Self {
            namespace: "swarm-vms".to_string(),
            image: "swarm/agent-runtime:latest".to_string(),
            runtime_class: Some("kata-fc".to_string()),
            control_plane_url: "http://swarm-gateway:8080".to_string(),
            secret_name: "swarm-agent-secrets".to_string(),
            cpu_millicores: 1000,
            memory_mb: 2048,
        }
    }
}

/// Generate the pod name for a VM identity.
///
/// Uses the first 16 characters of the VM ID hex for brevity.
#[must_use]
pub fn vm_pod_name(vm_id: &VmId) -> String {
    format!("vm-{}", &vm_id.to_hex()[..16])
}

/// Build the pod spec for one job.
#[must_use]
pub fn build_pod(vm_id: &VmId, job: &JobContext, config: &PodBackendConfig) -> Pod {
    let pod_name = vm_pod_name(vm_id);

    let mut labels = BTreeMap::new();
    labels.insert("app".to_string(), "swarm-vm".to_string());
    labels.insert(
        "swarm.io/ticket-id".to_string(),
        job.ticket_id.to_string(),
    );
    labels.insert(
        "swarm.io/tenant-id".to_string(),
        job.tenant_id.to_string(),
    );

    let mut annotations = BTreeMap::new();
    annotations.insert(
        "swarm.io/created-at".to_string(),
        chrono::Utc::now().to_rfc3339(),
    );
    annotations.insert("swarm.io/vm-id".to_string(), vm_id.to_hex());
    annotations.insert("swarm.io/attempt".to_string(), job.attempt.to_string());

    Pod {
        metadata: ObjectMeta {
            name: Some(pod_name),
            namespace: Some(config.namespace.clone()),
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(PodSpec {
            runtime_class_name: config.runtime_class.clone(),
            containers: vec![build_container(vm_id, job, config)],
            // VMs are one-shot; a crashed agent is reclaimed by lease, not
            // restarted in place.
            restart_policy: Some("Never".to_string()),
            termination_grace_period_seconds: Some(30),
            security_context: Some(PodSecurityContext {
                run_as_non_root: Some(true),
                run_as_user: Some(1000),
                fs_group: Some(1000),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn build_container(vm_id: &VmId, job: &JobContext, config: &PodBackendConfig) -> Container {
    Container {
        name: "agent".to_string(),
        image: Some(config.image.clone()),
        ports: Some(vec![ContainerPort {
            container_port: AGENT_PORT,
            name: Some("http".to_string()),
            ..Default::default()
        }]),
        env: Some(build_env_vars(vm_id, job, config)),
        resources: Some(build_resources(config)),
        readiness_probe: Some(build_probe(5, 10)),
        liveness_probe: Some(build_probe(30, 30)),
        ..Default::default()
    }
}

fn build_env_vars(vm_id: &VmId, job: &JobContext, config: &PodBackendConfig) -> Vec<EnvVar> {
    let mut env = vec![
        plain_env("SWARM_VM_ID", vm_id.to_hex()),
        plain_env("SWARM_TICKET_ID", job.ticket_id.to_string()),
        plain_env("SWARM_SESSION_ID", job.session_id.to_string()),
        plain_env("SWARM_ATTEMPT", job.attempt.to_string()),
        plain_env("SWARM_BRANCH", job.branch_name.clone()),
        plain_env("SWARM_CONTROL_PLANE_URL", config.control_plane_url.clone()),
        plain_env(
            "AGENT_LISTEN_ADDR",
            format!("0.0.0.0:{AGENT_PORT}"),
        ),
    ];

    if let Some(repo_url) = &job.repo_url {
        env.push(plain_env("SWARM_REPO_URL", repo_url.clone()));
    }

    // Credentials by name, resolved from the cluster secret.
    for name in &job.credential_names {
        env.push(EnvVar {
            name: name.clone(),
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: config.secret_name.clone(),
                    key: name.clone(),
                    optional: Some(true),
                }),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    env
}

fn plain_env(name: &str, value: String) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value),
        ..Default::default()
    }
}

fn build_resources(config: &PodBackendConfig) -> ResourceRequirements {
    let cpu = Quantity(format!("{}m", config.cpu_millicores));
    let memory = Quantity(format!("{}Mi", config.memory_mb));

    let mut limits = BTreeMap::new();
    limits.insert("cpu".to_string(), cpu.clone());
    limits.insert("memory".to_string(), memory.clone());

    let mut requests = BTreeMap::new();
    requests.insert("cpu".to_string(), cpu);
    requests.insert("memory".to_string(), memory);

    ResourceRequirements {
        requests: Some(requests),
        limits: Some(limits),
        ..Default::default()
    }
}

fn build_probe(initial_delay: i32, period: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some("/health".to_string()),
            port: IntOrString::Int(AGENT_PORT),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(period),
        timeout_seconds: Some(5),
        failure_threshold: Some(3),
        ..Default::default()
    }
}

/// Kubernetes-backed VM spawner.
pub struct PodVmBackend {
    pods: Api<Pod>,
    config: PodBackendConfig,
}

impl PodVmBackend {
    /// Create a backend using the given cluster client.
    #[must_use]
    pub fn new(client: kube::Client, config: PodBackendConfig) -> Self {
        let pods = Api::namespaced(client, &config.namespace);
        Self { pods, config }
    }
}

#[async_trait]
impl VmBackend for PodVmBackend {
    async fn spawn(&self, vm_id: &VmId, job: &JobContext) -> Result<VmHandle> {
        let pod = build_pod(vm_id, job, &self.config);
        let pod_name = vm_pod_name(vm_id);

        self.pods
            .create(&PostParams::default(), &pod)
            .await
            .map_err(|e| AdapterError::Unavailable(format!("pod create failed: {e}")))?;

        tracing::info!(
            vm_id = %vm_id,
            ticket_id = %job.ticket_id,
            pod = %pod_name,
            "Spawned agent pod"
        );

        Ok(VmHandle {
            vm_id: *vm_id,
            endpoint: format!("{}.{}:{}", pod_name, self.config.namespace, AGENT_PORT),
            teardown_handle: pod_name,
        })
    }

    async fn teardown(&self, handle: &VmHandle) -> Result<()> {
        match self
            .pods
            .delete(&handle.teardown_handle, &DeleteParams::default())
            .await
        {
            Ok(_) => {
                tracing::info!(vm_id = %handle.vm_id, "Tore down agent pod");
                Ok(())
            }
            // Already gone is success for teardown.
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(AdapterError::Unavailable(format!(
                "pod delete failed: {e}"
            ))),
        }
    }

    async fn health(&self, vm_id: &VmId) -> Result<bool> {
        let pod = self
            .pods
            .get_opt(&vm_pod_name(vm_id))
            .await
            .map_err(|e| AdapterError::Unavailable(format!("pod get failed: {e}")))?;

        Ok(pod
            .and_then(|p| p.status)
            .and_then(|s| s.phase)
            .is_some_and(|phase| phase == "Running"))
    }
}
