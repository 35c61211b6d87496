//! Node teardown
//!
//! Destroying a node stops its remote task, drops it from the registry and
//! forgets its connection. Every step is best-effort: failures are logged and
//! never replace the error that caused the teardown.

use crate::connection::AgentConnections;
use crate::node::{NodeRegistry, RemoteTaskRef};
use crate::remote::RemoteTaskService;
use crate::state::NodeState;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct NodeTerminator {
    service: Arc<dyn RemoteTaskService>,
    registry: Arc<NodeRegistry>,
    connections: Arc<dyn AgentConnections>,
}

impl NodeTerminator {
    pub fn new(
        service: Arc<dyn RemoteTaskService>,
        registry: Arc<NodeRegistry>,
        connections: Arc<dyn AgentConnections>,
    ) -> Self {
        Self {
            service,
            registry,
            connections,
        }
    }

    /// Stop the node's task and deregister it. Returns whether the node existed.
    pub async fn destroy(&self, name: &str, reason: &str) -> bool {
        self.teardown(name, reason, false).await
    }

    /// Like [`destroy`](Self::destroy), but leaves the node alone unless it
    /// is still idle when claimed. Returns whether the node was torn down.
    pub async fn destroy_idle(&self, name: &str, reason: &str) -> bool {
        self.teardown(name, reason, true).await
    }

    async fn teardown(&self, name: &str, reason: &str, require_idle: bool) -> bool {
        let claim = self
            .registry
            .update(name, |node| {
                if require_idle && !node.is_idle() {
                    return Claim::Busy;
                }
                if let Err(e) = node.transition(NodeState::Terminated) {
                    warn!("{}", e);
                }
                Claim::Claimed(node.task.clone())
            })
            .await;

        let task = match claim {
            None => {
                self.connections.forget(name);
                return false;
            }
            Some(Claim::Busy) => {
                debug!("Node {} picked up work, keeping it", name);
                return false;
            }
            Some(Claim::Claimed(task)) => task,
        };

        if let Some(task) = task {
            if let Err(e) = self
                .service
                .stop_task(&task.cluster_id, &task.task_id, reason)
                .await
            {
                warn!(
                    "Failed to stop task {} of node {}: {}",
                    task.task_id, name, e
                );
            }
        }

        self.registry.remove(name).await;
        self.connections.forget(name);
        info!("Terminated node {}: {}", name, reason);
        true
    }
}

/// Outcome of claiming a node for teardown under the registry lock
enum Claim {
    Claimed(Option<RemoteTaskRef>),
    Busy,
}
