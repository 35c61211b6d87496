//! Agent connection tracking
//!
//! The handshake protocol itself lives outside the controller. This module
//! is the point where it reports attach/detach, and where the launcher and
//! retention logic ask whether an agent is online.

use async_trait::async_trait;
use fleet_foundation::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// What the launcher and terminator need from the connection layer
#[async_trait]
pub trait AgentConnections: Send + Sync {
    async fn is_online(&self, node: &str) -> bool;

    /// Drop everything known about a destroyed node
    fn forget(&self, _node: &str) {}
}

#[derive(Debug, Clone)]
struct Connection {
    secret: String,
    online: bool,
}

/// Secrets issued to nodes and their current connection status
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expect `node` to attach with `secret`
    pub fn issue(&self, node: &str, secret: &str) {
        self.connections.write().insert(
            node.to_string(),
            Connection {
                secret: secret.to_string(),
                online: false,
            },
        );
        debug!("Issued connection secret for {}", node);
    }

    /// Agent handshake. Only one live session per node; a dropped agent
    /// may reattach with the same secret.
    pub fn attach(&self, node: &str, secret: &str) -> Result<()> {
        let mut connections = self.connections.write();
        let connection = connections
            .get_mut(node)
            .ok_or_else(|| Error::NotFound(format!("Node {}", node)))?;

        if connection.secret != secret {
            warn!("Rejected connection attempt for {}: bad secret", node);
            return Err(Error::InvalidInput(format!("Invalid secret for {}", node)));
        }
        if connection.online {
            warn!("Rejected connection attempt for {}: already connected", node);
            return Err(Error::InvalidInput(format!("{} is already connected", node)));
        }

        connection.online = true;
        info!("Agent {} connected", node);
        Ok(())
    }

    /// Connection dropped; returns whether the node was online
    pub fn detach(&self, node: &str) -> bool {
        match self.connections.write().get_mut(node) {
            Some(connection) if connection.online => {
                connection.online = false;
                info!("Agent {} disconnected", node);
                true
            }
            _ => false,
        }
    }

    /// Forget a node entirely
    pub fn revoke(&self, node: &str) {
        self.connections.write().remove(node);
    }

    pub fn online_now(&self, node: &str) -> bool {
        self.connections
            .read()
            .get(node)
            .map(|c| c.online)
            .unwrap_or(false)
    }
}

#[async_trait]
impl AgentConnections for ConnectionRegistry {
    async fn is_online(&self, node: &str) -> bool {
        self.online_now(node)
    }

    fn forget(&self, node: &str) {
        self.revoke(node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_checks_secret_and_session() {
        let registry = ConnectionRegistry::new();
        registry.issue("fleet-linux-a1", "s3cret");

        assert!(registry.attach("fleet-linux-a1", "wrong").is_err());
        registry.attach("fleet-linux-a1", "s3cret").unwrap();
        assert!(registry.online_now("fleet-linux-a1"));
        assert!(registry.attach("fleet-linux-a1", "s3cret").is_err());

        assert!(registry.detach("fleet-linux-a1"));
        registry.attach("fleet-linux-a1", "s3cret").unwrap();

        registry.revoke("fleet-linux-a1");
        assert!(!registry.online_now("fleet-linux-a1"));
    }

    #[tokio::test]
    async fn test_unknown_node_is_offline() {
        let registry = ConnectionRegistry::new();
        assert!(!registry.is_online("ghost").await);
        assert!(registry.attach("ghost", "x").is_err());
        assert!(!registry.detach("ghost"));
    }
}
