//! Run orchestration.
//!
//! The engine owns the single-run lock, loads and compiles the scenario,
//! materializes instances, spawns one worker per instance with start
//! nodes, and supervises completion. `start_scenario` returns as soon as
//! the workers are dispatched; the outcome arrives as lifecycle events.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::endpoint::EndpointFactory;
use crate::errors::{EngineError, Result};
use crate::events::{Emitter, EventSink, LogLevel};
use crate::executor::ChainExecutor;
use crate::graph::{compile, ExecutionGraph};
use crate::instance::{InstanceManager, DEFAULT_BASE_PORT};
use crate::session::SessionStore;
use crate::store::ScenarioStore;

/// Grace period `stop_scenario` allows workers to wind down before it
/// proceeds anyway.
const STOP_GRACE: Duration = Duration::from_secs(10);

#[derive(Default)]
struct RunState {
    running: bool,
    scenario_id: String,
    cancel: Option<CancellationToken>,
    done: Option<watch::Receiver<bool>>,
}

fn reset(state: &Mutex<RunState>) {
    let mut state = state.lock();
    state.running = false;
    state.scenario_id.clear();
    state.cancel = None;
    state.done = None;
}

/// Scenario execution engine. One engine runs at most one scenario at a
/// time; independent engines are fully isolated, including their port
/// ranges.
pub struct Engine {
    store: Arc<dyn ScenarioStore>,
    emitter: Emitter,
    instances: Arc<InstanceManager>,
    state: Arc<Mutex<RunState>>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn ScenarioStore>,
        factory: Arc<dyn EndpointFactory>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self::with_base_port(store, factory, sink, DEFAULT_BASE_PORT)
    }

    /// Like [`Engine::new`] with an explicit first candidate port, so
    /// concurrent engines (e.g. in tests) can use disjoint ranges.
    pub fn with_base_port(
        store: Arc<dyn ScenarioStore>,
        factory: Arc<dyn EndpointFactory>,
        sink: Arc<dyn EventSink>,
        base_port: u16,
    ) -> Self {
        Self {
            store,
            emitter: Emitter::new(sink),
            instances: Arc::new(InstanceManager::new(factory, base_port)),
            state: Arc::new(Mutex::new(RunState::default())),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Start executing a stored scenario. Returns once execution is
    /// dispatched; progress and outcome are reported through the sink.
    /// Fails synchronously on a concurrent run, a load error, a compile
    /// error, or instance materialization failure.
    pub async fn start_scenario(&self, scenario_id: &str) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.running {
                return Err(EngineError::AlreadyRunning);
            }
            state.running = true;
        }

        let scenario = match self.store.load(scenario_id).await {
            Ok(scenario) => scenario,
            Err(err) => {
                self.state.lock().running = false;
                return Err(err.into());
            }
        };

        let graph = match compile(&scenario.flow_data) {
            Ok(graph) => Arc::new(graph),
            Err(err) => {
                self.cleanup_on_error().await;
                return Err(err);
            }
        };

        if let Err(err) = self.instances.create_instances(&graph).await {
            self.cleanup_on_error().await;
            return Err(err);
        }

        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        {
            let mut state = self.state.lock();
            state.scenario_id = scenario_id.to_string();
            state.cancel = Some(cancel.clone());
            state.done = Some(done_rx);
        }

        self.instances.start_serving(&cancel);
        self.emitter.scenario_started(scenario_id);

        let sessions = Arc::new(SessionStore::new());
        let executor = Arc::new(ChainExecutor::new(
            self.emitter.clone(),
            Arc::clone(&self.instances),
            Arc::clone(&sessions),
        ));

        self.spawn_run(scenario_id, graph, executor, sessions, cancel, done_tx);
        Ok(())
    }

    fn spawn_run(
        &self,
        scenario_id: &str,
        graph: Arc<ExecutionGraph>,
        executor: Arc<ChainExecutor>,
        sessions: Arc<SessionStore>,
        cancel: CancellationToken,
        done_tx: watch::Sender<bool>,
    ) {
        let instance_ids = graph.instance_ids_sorted();
        let (err_tx, mut err_rx) = mpsc::channel::<EngineError>(instance_ids.len().max(1));

        let mut workers = Vec::new();
        for instance_id in instance_ids {
            let Some(chain) = graph.instance(&instance_id) else {
                continue;
            };
            if chain.start_nodes.is_empty() {
                continue;
            }
            let start_nodes = chain.start_nodes.clone();
            let graph = Arc::clone(&graph);
            let executor = Arc::clone(&executor);
            let cancel = cancel.clone();
            let err_tx = err_tx.clone();

            workers.push(tokio::spawn(async move {
                // Chains of one instance run sequentially, never in parallel.
                for start in &start_nodes {
                    if let Err(err) = executor.execute_chain(&cancel, &graph, start).await {
                        let tagged = EngineError::InstanceChain {
                            instance: instance_id.clone(),
                            source: Box::new(err),
                        };
                        // First error wins; a full channel means one is
                        // already recorded.
                        let _ = err_tx.try_send(tagged);
                        cancel.cancel();
                        return;
                    }
                }
            }));
        }

        let emitter = self.emitter.clone();
        let instances = Arc::clone(&self.instances);
        let state = Arc::clone(&self.state);
        let scenario_id = scenario_id.to_string();

        tokio::spawn(async move {
            for worker in workers {
                if let Err(err) = worker.await {
                    warn!(%err, "instance worker panicked");
                }
            }

            // Workers are done; stop every instance's serve loop before
            // tearing the endpoints down.
            cancel.cancel();

            emitter.system_log("Starting cleanup", LogLevel::Info);
            sessions.hangup_all().await;
            sessions.clear().await;
            instances.cleanup().await;
            emitter.system_log("Cleanup completed", LogLevel::Info);

            match err_rx.try_recv() {
                Ok(err) if err.is_cancelled() => {
                    // Stopped runs report through scenario:stopped instead.
                    info!(scenario = %scenario_id, "run cancelled");
                }
                Ok(err) => {
                    emitter.scenario_failed(err.to_string());
                }
                Err(_) => {
                    emitter.scenario_completed(&scenario_id);
                }
            }

            reset(&state);
            let _ = done_tx.send(true);
        });
    }

    /// Stop the running scenario and wait (bounded by a 10s grace period)
    /// for its teardown.
    pub async fn stop_scenario(&self) -> Result<()> {
        let (cancel, done) = {
            let state = self.state.lock();
            if !state.running {
                return Err(EngineError::NotRunning);
            }
            (state.cancel.clone(), state.done.clone())
        };

        if let Some(cancel) = cancel {
            cancel.cancel();
        }

        if let Some(mut done) = done {
            let finished =
                tokio::time::timeout(STOP_GRACE, done.wait_for(|finished| *finished)).await;
            if finished.is_err() {
                self.emitter
                    .system_log("StopScenario timeout - forced shutdown", LogLevel::Warn);
            }
        }

        self.emitter.scenario_stopped();
        reset(&self.state);
        Ok(())
    }

    async fn cleanup_on_error(&self) {
        self.instances.cleanup().await;
        reset(&self.state);
    }
}
