//! Coordinator wiring: one value owning every background task.
//!
//! Components are constructed once at startup and torn down in reverse
//! order on shutdown. The store is the only durable state; stopping the
//! coordinator loses nothing.

use std::sync::Arc;
use std::time::Duration;

use swarm_adapters::{VcsClient, Verifier, VmBackend};
use swarm_bus::EventBus;
use swarm_core::CoreConfig;
use swarm_store::Store;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::cascade::CascadeWorker;
use crate::dispatcher::Dispatcher;
use crate::lease::{HeartbeatPublisher, StaleReclaimer};
use crate::registry::VmRegistry;
use crate::verify::ResultPipeline;

/// The assembled execution core, before its loops start.
pub struct ExecutionCore<S: Store + ?Sized + 'static> {
    /// The dispatcher (poll loop + agent claim/cancel/release paths).
    pub dispatcher: Arc<Dispatcher<S>>,
    /// The verification + completion pipeline.
    pub pipeline: Arc<ResultPipeline<S>>,
    /// The heartbeat publisher.
    pub heartbeat: Arc<HeartbeatPublisher<S>>,
    /// The stale reclaimer.
    pub reclaimer: Arc<StaleReclaimer<S>>,
    /// The in-flight VM registry.
    pub registry: Arc<VmRegistry>,
    /// The event bus.
    pub bus: EventBus,
}

/// Assemble the execution core and its cascade worker.
#[must_use]
pub fn build_core<S: Store + ?Sized + 'static>(
    store: Arc<S>,
    vm: Arc<dyn VmBackend>,
    verifier: Arc<dyn Verifier>,
    vcs: Arc<dyn VcsClient>,
    bus: EventBus,
    config: CoreConfig,
) -> (ExecutionCore<S>, CascadeWorker<S>) {
    let registry = Arc::new(VmRegistry::new());
    let (completions_tx, completions_rx) = mpsc::unbounded_channel();

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        Arc::clone(&vm),
        bus.clone(),
        Arc::clone(&registry),
        config.clone(),
        completions_tx.clone(),
    ));
    let pipeline = Arc::new(ResultPipeline::new(
        Arc::clone(&store),
        bus.clone(),
        verifier,
        vcs,
        Arc::clone(&vm),
        Arc::clone(&registry),
        config.clone(),
        completions_tx.clone(),
    ));
    let heartbeat = Arc::new(HeartbeatPublisher::new(
        Arc::clone(&store),
        Arc::clone(&vm),
        Arc::clone(&registry),
        config.clone(),
    ));
    let reclaimer = Arc::new(StaleReclaimer::new(
        Arc::clone(&store),
        vm,
        bus.clone(),
        Arc::clone(&registry),
        config,
        completions_tx,
    ));
    let worker = CascadeWorker::new(store, bus.clone(), completions_rx);

    (
        ExecutionCore {
            dispatcher,
            pipeline,
            heartbeat,
            reclaimer,
            registry,
            bus,
        },
        worker,
    )
}

/// A started core with its background tasks.
pub struct RunningCore<S: Store + ?Sized + 'static> {
    /// Component handles for request-path callers (the gateway).
    pub core: ExecutionCore<S>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

/// Start every loop: dispatcher, heartbeat publisher, stale reclaimer,
/// cascade worker, and the bus keepalive.
#[must_use]
pub fn start_core<S: Store + ?Sized + 'static>(
    core: ExecutionCore<S>,
    worker: CascadeWorker<S>,
) -> RunningCore<S> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

    let bus = core.bus.clone();
    let rx = shutdown_rx.clone();
    tasks.push((
        "bus-keepalive",
        tokio::spawn(async move { bus.run_keepalive(rx).await }),
    ));

    let worker_rx = shutdown_rx.clone();
    tasks.push((
        "cascade-worker",
        tokio::spawn(async move { worker.run(worker_rx).await }),
    ));

    let heartbeat = Arc::clone(&core.heartbeat);
    let rx = shutdown_rx.clone();
    tasks.push((
        "heartbeat",
        tokio::spawn(async move { heartbeat.run(rx).await }),
    ));

    let reclaimer = Arc::clone(&core.reclaimer);
    let rx = shutdown_rx.clone();
    tasks.push((
        "reclaimer",
        tokio::spawn(async move { reclaimer.run(rx).await }),
    ));

    let dispatcher = Arc::clone(&core.dispatcher);
    tasks.push((
        "dispatcher",
        tokio::spawn(async move { dispatcher.run(shutdown_rx).await }),
    ));

    tracing::info!(tasks = tasks.len(), "Execution core started");

    RunningCore {
        core,
        shutdown: shutdown_tx,
        tasks,
    }
}

impl<S: Store + ?Sized + 'static> RunningCore<S> {
    /// Stop every task, newest first, waiting briefly before aborting.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);

        for (name, task) in self.tasks.into_iter().rev() {
            match tokio::time::timeout(Duration::from_secs(5), task).await {
                Ok(_) => tracing::debug!(task = name, "Task stopped"),
                Err(_) => {
                    tracing::warn!(task = name, "Task did not stop in time; aborting");
                }
            }
        }

        tracing::info!("Execution core stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarm_adapters::{NoopVmBackend, RecordingVcs, StaticVerifier};
    use swarm_store::RocksStore;
    use tempfile::TempDir;

    #[tokio::test]
    async fn start_and_shutdown() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RocksStore::open(dir.path()).unwrap());

        let (core, worker) = build_core(
            store,
            Arc::new(NoopVmBackend::new()),
            Arc::new(StaticVerifier::passing()),
            Arc::new(RecordingVcs::new()),
            EventBus::with_defaults(),
            CoreConfig::default(),
        );

        let running = start_core(core, worker);
        running.shutdown().await;
    }
}
