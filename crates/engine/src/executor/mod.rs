//! Chain interpreter.
//!
//! One [`ChainExecutor`] serves a whole run. Each instance worker walks its
//! chains node by node: a node that succeeds continues to its success edge,
//! a node that fails continues to its failure edge if it has one, otherwise
//! the chain aborts and the error propagates to the worker.

mod commands;
mod events;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::{EngineError, Result};
use crate::events::{Emitter, NodeState};
use crate::graph::{ExecutionGraph, GraphNode, NodeAction, NodeId};
use crate::instance::InstanceManager;
use crate::session::SessionStore;

pub struct ChainExecutor {
    emitter: Emitter,
    instances: Arc<InstanceManager>,
    sessions: Arc<SessionStore>,
}

impl ChainExecutor {
    pub fn new(
        emitter: Emitter,
        instances: Arc<InstanceManager>,
        sessions: Arc<SessionStore>,
    ) -> Self {
        Self {
            emitter,
            instances,
            sessions,
        }
    }

    /// Walk one chain from its start node. Iterative, so chain length is
    /// unbounded.
    pub async fn execute_chain(
        &self,
        cancel: &CancellationToken,
        graph: &ExecutionGraph,
        start: &NodeId,
    ) -> Result<()> {
        let mut current = Some(start.clone());

        while let Some(node_id) = current {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let node = graph
                .node(&node_id)
                .ok_or_else(|| EngineError::internal(format!("node {node_id} not in graph")))?;

            match self.execute_node(cancel, node).await {
                Ok(()) => current = node.success_next.clone(),
                Err(err) => {
                    if let Some(failure) = &node.failure_next {
                        debug!(node = %node_id, %err, "node failed, taking failure branch");
                        current = Some(failure.clone());
                    } else {
                        return Err(err);
                    }
                }
            }
        }
        Ok(())
    }

    /// Run one node, reporting its pending → running → terminal transitions.
    async fn execute_node(&self, cancel: &CancellationToken, node: &GraphNode) -> Result<()> {
        self.emitter
            .node_state(&node.id, NodeState::Pending, NodeState::Running);

        let result = match &node.action {
            NodeAction::Command(spec) => self.execute_command(cancel, node, spec).await,
            NodeAction::Event(spec) => self.execute_event(cancel, node, spec).await,
        };

        match result {
            Ok(()) => {
                self.emitter
                    .node_state(&node.id, NodeState::Running, NodeState::Completed);
                Ok(())
            }
            Err(err) => {
                self.emitter
                    .node_state(&node.id, NodeState::Running, NodeState::Failed);
                Err(err)
            }
        }
    }
}

/// The DTMF alphabet: digits, star, pound, and the four letter keys.
pub(crate) fn is_valid_dtmf(digit: char) -> bool {
    matches!(digit, '0'..='9' | '*' | '#' | 'A'..='D')
}
