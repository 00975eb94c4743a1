//! Swarm Gateway - the service binary.
//!
//! Wires the store, bus, adapters, and execution core together, then
//! serves the HTTP/WebSocket API. Adapter endpoints come from the
//! environment; anything unset falls back to a local no-op implementation
//! so the service runs standalone in development.
//!
//! # Environment
//!
//! - `LISTEN_ADDR` (default `0.0.0.0:8080`)
//! - `DATA_DIR` (default `/data/swarm`)
//! - `LLM_BASE_URL` / `LLM_API_KEY` - completion endpoint
//! - `VERIFIER_URL` - verifier service; unset passes everything
//! - `VCS_URL` - VCS automation service; unset records locally
//! - `VM_BACKEND` - `k8s` for pod spawning, anything else is a no-op
//! - `SWARM_MAX_FLEET`, `SWARM_POLL_INTERVAL_MS`, `SWARM_MAX_ATTEMPTS` -
//!   core overrides

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use swarm_adapters::{
    HttpLlmClient, HttpVcsClient, HttpVerifier, LlmClient, NoopVmBackend, PodBackendConfig,
    PodVmBackend, RecordingVcs, StaticVerifier, VcsClient, Verifier, VmBackend,
};
use swarm_bus::{BusConfig, EventBus};
use swarm_core::CoreConfig;
use swarm_dispatch::{build_core, start_core};
use swarm_gateway::{create_router, AppState, GatewayConfig};
use swarm_hitl::HitlService;
use swarm_store::RocksStore;

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,swarm=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Swarm Gateway");

    let listen_addr = env_or("LISTEN_ADDR", "0.0.0.0:8080");
    let data_dir = env_or("DATA_DIR", "/data/swarm");

    let mut core_config = CoreConfig::default();
    if let Some(max_fleet) = env_parse("SWARM_MAX_FLEET") {
        core_config.max_fleet = max_fleet;
    }
    if let Some(poll_interval) = env_parse("SWARM_POLL_INTERVAL_MS") {
        core_config.poll_interval_ms = poll_interval;
    }
    if let Some(max_attempts) = env_parse("SWARM_MAX_ATTEMPTS") {
        core_config.max_attempts = max_attempts;
    }

    tracing::info!(
        listen_addr = %listen_addr,
        data_dir = %data_dir,
        max_fleet = core_config.max_fleet,
        "Gateway configuration loaded"
    );

    tracing::info!(path = %data_dir, "Opening RocksDB store");
    let store = Arc::new(RocksStore::open(&data_dir)?);

    let bus = EventBus::new(BusConfig::default());

    // Adapters: HTTP where configured, local fallbacks otherwise.
    let llm: Arc<dyn LlmClient> = Arc::new(HttpLlmClient::new(
        env_or("LLM_BASE_URL", "https://api.anthropic.com"),
        env_or("LLM_API_KEY", ""),
    ));

    let verifier: Arc<dyn Verifier> = match std::env::var("VERIFIER_URL") {
        Ok(url) => {
            tracing::info!(verifier_url = %url, "Verifier service enabled");
            Arc::new(HttpVerifier::new(url))
        }
        Err(_) => {
            tracing::warn!("No VERIFIER_URL set - every attempt will pass verification");
            Arc::new(StaticVerifier::passing())
        }
    };

    let vcs: Arc<dyn VcsClient> = match std::env::var("VCS_URL") {
        Ok(url) => {
            tracing::info!(vcs_url = %url, "VCS service enabled");
            Arc::new(HttpVcsClient::new(url))
        }
        Err(_) => {
            tracing::warn!("No VCS_URL set - recording VCS operations locally");
            Arc::new(RecordingVcs::new())
        }
    };

    let vm: Arc<dyn VmBackend> = if env_or("VM_BACKEND", "noop") == "k8s" {
        let client = kube::Client::try_default().await?;
        tracing::info!("Kubernetes VM backend enabled");
        Arc::new(PodVmBackend::new(client, PodBackendConfig::default()))
    } else {
        tracing::warn!("VM_BACKEND is not k8s - running without VM isolation");
        Arc::new(NoopVmBackend::new())
    };

    // Assemble and start the execution core.
    let (core, worker) = build_core(
        Arc::clone(&store),
        vm,
        verifier,
        vcs,
        bus.clone(),
        core_config.clone(),
    );
    let running = start_core(core, worker);

    let hitl = Arc::new(HitlService::new(
        Arc::clone(&store),
        llm,
        bus.clone(),
        core_config.clone(),
    ));

    let state = AppState {
        store,
        hitl,
        dispatcher: Arc::clone(&running.core.dispatcher),
        pipeline: Arc::clone(&running.core.pipeline),
        bus,
        config: GatewayConfig::default(),
        core_config,
    };

    let app = create_router(state);
    tracing::info!(listen_addr = %listen_addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await?;

    // Background tasks stop in reverse start order; the store needs no
    // flush beyond RocksDB's own.
    running.shutdown().await;

    Ok(())
}
