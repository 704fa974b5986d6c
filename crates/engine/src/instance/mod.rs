//! Instance lifecycle: one bound SIP endpoint per declared instance.

mod ports;

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::endpoint::{EndpointFactory, ServerSession, SipEndpoint};
use crate::errors::{EngineError, Result};
use crate::graph::{ExecutionGraph, InstanceId, SipInstanceConfig};

pub use ports::{PortAllocator, DEFAULT_BASE_PORT};

/// A materialized scenario instance: its config, its bound endpoint, and
/// the inbound-call channel the serve loop feeds.
pub struct ManagedInstance {
    config: SipInstanceConfig,
    endpoint: Arc<dyn SipEndpoint>,
    port: u16,
    incoming_tx: mpsc::Sender<Box<dyn ServerSession>>,
    // Capacity 1: a second inbound call waits until the first is consumed.
    incoming_rx: AsyncMutex<mpsc::Receiver<Box<dyn ServerSession>>>,
}

impl ManagedInstance {
    pub fn config(&self) -> &SipInstanceConfig {
        &self.config
    }

    pub fn endpoint(&self) -> &Arc<dyn SipEndpoint> {
        &self.endpoint
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Exclusive access to the inbound-call queue. Only one node of an
    /// instance chain runs at a time, so contention is not expected.
    pub async fn incoming(
        &self,
    ) -> tokio::sync::MutexGuard<'_, mpsc::Receiver<Box<dyn ServerSession>>> {
        self.incoming_rx.lock().await
    }
}

/// Creates, serves, and tears down the endpoints of one scenario run.
pub struct InstanceManager {
    factory: Arc<dyn EndpointFactory>,
    instances: DashMap<InstanceId, Arc<ManagedInstance>>,
    ports: Mutex<PortAllocator>,
}

impl InstanceManager {
    pub fn new(factory: Arc<dyn EndpointFactory>, base_port: u16) -> Self {
        Self {
            factory,
            instances: DashMap::new(),
            ports: Mutex::new(PortAllocator::new(base_port)),
        }
    }

    /// Materialize every instance the graph declares, in sorted id order so
    /// port assignment is deterministic. All-or-nothing: if any instance
    /// fails, the ones already created are torn down and the error returned.
    pub async fn create_instances(&self, graph: &ExecutionGraph) -> Result<()> {
        for instance_id in graph.instance_ids_sorted() {
            let chain = graph
                .instance(&instance_id)
                .ok_or_else(|| EngineError::internal("instance vanished during creation"))?;

            match self.create_one(&chain.config).await {
                Ok(instance) => {
                    info!(
                        instance = %instance_id,
                        port = instance.port,
                        "instance created"
                    );
                    self.instances.insert(instance_id, instance);
                }
                Err(err) => {
                    warn!(instance = %instance_id, %err, "instance creation failed, rolling back");
                    self.cleanup().await;
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    async fn create_one(&self, config: &SipInstanceConfig) -> Result<Arc<ManagedInstance>> {
        let port = self
            .ports
            .lock()
            .allocate()
            .map_err(|err| EngineError::PortAllocation {
                instance: config.id.clone(),
                source: Box::new(err),
            })?;

        let endpoint = self
            .factory
            .create(config, port)
            .await
            .map_err(|err| EngineError::EndpointSetup {
                instance: config.id.clone(),
                source: err,
            })?;

        let (incoming_tx, incoming_rx) = mpsc::channel(1);
        Ok(Arc::new(ManagedInstance {
            config: config.clone(),
            endpoint,
            port,
            incoming_tx,
            incoming_rx: AsyncMutex::new(incoming_rx),
        }))
    }

    /// Spawn the serve loop of every created instance under a child of the
    /// run's cancellation token.
    pub fn start_serving(&self, cancel: &CancellationToken) {
        for entry in self.instances.iter() {
            let instance = Arc::clone(entry.value());
            let instance_id = entry.key().clone();
            let child = cancel.child_token();
            tokio::spawn(async move {
                let endpoint = Arc::clone(&instance.endpoint);
                let tx = instance.incoming_tx.clone();
                if let Err(err) = endpoint.serve(tx, child).await {
                    warn!(instance = %instance_id, %err, "serve loop exited with error");
                } else {
                    debug!(instance = %instance_id, "serve loop stopped");
                }
            });
        }
    }

    pub fn get(&self, id: &InstanceId) -> Result<Arc<ManagedInstance>> {
        self.instances
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| EngineError::InstanceNotFound(id.clone()))
    }

    /// Shut every endpoint down and rewind the port allocator. Idempotent;
    /// shutdown errors are logged, not propagated.
    pub async fn cleanup(&self) {
        let drained: Vec<(InstanceId, Arc<ManagedInstance>)> = {
            let mut out = Vec::new();
            self.instances.retain(|id, instance| {
                out.push((id.clone(), Arc::clone(instance)));
                false
            });
            out
        };

        for (id, instance) in drained {
            if let Err(err) = instance.endpoint.shutdown().await {
                warn!(instance = %id, %err, "endpoint shutdown failed");
            }
        }
        self.ports.lock().reset();
    }
}
