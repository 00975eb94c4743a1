//! Gateway application state.

use std::sync::Arc;

use swarm_adapters::LlmClient;
use swarm_bus::EventBus;
use swarm_core::CoreConfig;
use swarm_dispatch::{Dispatcher, ResultPipeline};
use swarm_hitl::HitlService;
use swarm_store::RocksStore;

use crate::config::GatewayConfig;

/// Shared application state for the gateway.
///
/// Holds the HITL service for session routes, the dispatcher and result
/// pipeline for agent routes, and the bus for the event stream.
#[derive(Clone)]
pub struct AppState {
    /// The persistent store.
    pub store: Arc<RocksStore>,
    /// The HITL session service.
    pub hitl: Arc<HitlService<RocksStore, dyn LlmClient>>,
    /// The dispatcher (claim/cancel/release paths).
    pub dispatcher: Arc<Dispatcher<RocksStore>>,
    /// The verification pipeline (agent completion path).
    pub pipeline: Arc<ResultPipeline<RocksStore>>,
    /// The event bus backing the WebSocket stream.
    pub bus: EventBus,
    /// Gateway configuration.
    pub config: GatewayConfig,
    /// Core configuration (lease duration for heartbeats).
    pub core_config: CoreConfig,
}
