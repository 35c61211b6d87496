//! Agent nodes and the node registry
//!
//! An [`AgentNode`] is one provisioned agent and the remote task behind it.
//! The [`NodeRegistry`] is the controller's shared view of every node and
//! writes through to a [`NodeStore`] so the `launched` flag survives restarts.

use crate::state::NodeState;
use crate::template::{EffectiveTemplate, RetentionPolicy};
use chrono::{DateTime, Utc};
use fleet_foundation::{Error, RecordStore, Result, NODES_FILE};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

const NAME_SUFFIX_LEN: usize = 8;
const SECRET_LEN: usize = 32;

// ============================================================================
// AgentNode
// ============================================================================

/// Remote task backing a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteTaskRef {
    pub task_id: String,
    pub cluster_id: String,
    pub definition_id: String,
    #[serde(default)]
    pub host_id: Option<String>,
}

/// One provisioned agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentNode {
    pub name: String,
    pub template: String,
    #[serde(default)]
    pub pool: Option<String>,
    pub labels: BTreeSet<String>,
    #[serde(default)]
    pub task: Option<RemoteTaskRef>,
    #[serde(default)]
    pub state: NodeState,
    /// Sticky: once false it never becomes true again
    pub survivable: bool,
    pub retention: RetentionPolicy,
    #[serde(default)]
    pub min_retained: u32,
    pub idle_timeout_minutes: u32,
    /// Launch completed; a restarted controller must not launch again
    #[serde(default)]
    pub launched: bool,
    /// One-time connection secret handed to the agent
    pub secret: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub idle_since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tasks_completed: u32,
}

impl AgentNode {
    /// New node for `template`, named `<controller>-<label>-<suffix>`
    pub fn new(controller: &str, template: &EffectiveTemplate, default_idle_minutes: u32) -> Self {
        let label = template
            .labels
            .iter()
            .next()
            .map(String::as_str)
            .unwrap_or(template.name.as_str());

        Self {
            name: generate_name(controller, label),
            template: template.name.clone(),
            pool: None,
            labels: template.labels.clone(),
            task: None,
            state: NodeState::Requested,
            survivable: true,
            retention: template.retention,
            min_retained: template.min_retained,
            idle_timeout_minutes: template.idle_minutes.unwrap_or(default_idle_minutes),
            launched: false,
            secret: random_token(SECRET_LEN),
            created_at: Utc::now(),
            idle_since: None,
            tasks_completed: 0,
        }
    }

    /// Owned by a warm pool; the pool's idle limit replaces the template's
    pub fn with_pool(mut self, pool: impl Into<String>, max_idle_minutes: u32) -> Self {
        self.pool = Some(pool.into());
        self.idle_timeout_minutes = max_idle_minutes;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn serves(&self, label: &str) -> bool {
        self.labels.contains(label)
    }

    pub fn is_online(&self) -> bool {
        self.state.is_online()
    }

    pub fn is_idle(&self) -> bool {
        self.state == NodeState::Idle
    }

    /// Move to `next`, rejecting illegal transitions
    pub fn transition(&mut self, next: NodeState) -> Result<()> {
        if self.state == next {
            return Ok(());
        }
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidInput(format!(
                "Node {} cannot move from {} to {}",
                self.name, self.state, next
            )));
        }
        debug!("Node {}: {} -> {}", self.name, self.state, next);
        self.state = next;
        Ok(())
    }

    pub fn mark_unsurvivable(&mut self) {
        self.survivable = false;
    }

    /// Agent finished a unit of work and went idle
    pub fn mark_idle(&mut self, now: DateTime<Utc>) {
        if self.state == NodeState::Busy || self.state == NodeState::AgentOnline {
            self.state = NodeState::Idle;
        }
        self.idle_since = Some(now);
    }

    pub fn mark_busy(&mut self) {
        if self.state == NodeState::Idle || self.state == NodeState::AgentOnline {
            self.state = NodeState::Busy;
        }
        self.idle_since = None;
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.idle_timeout_minutes) * 60)
    }

    /// How long the node has been idle at `now`
    pub fn idle_for(&self, now: DateTime<Utc>) -> Option<Duration> {
        if !self.is_idle() {
            return None;
        }
        let since = self.idle_since?;
        Some((now - since).to_std().unwrap_or_default())
    }
}

/// `<controller>-<label>-<random suffix>`
pub fn generate_name(controller: &str, label: &str) -> String {
    format!(
        "{}-{}-{}",
        controller,
        label,
        random_token(NAME_SUFFIX_LEN).to_lowercase()
    )
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

// ============================================================================
// Persistence
// ============================================================================

/// Storage for node records; the format is the store's business
pub trait NodeStore: Send + Sync {
    fn load_nodes(&self) -> Result<Vec<AgentNode>>;
    fn save_nodes(&self, nodes: &[AgentNode]) -> Result<()>;
}

impl NodeStore for RecordStore {
    fn load_nodes(&self) -> Result<Vec<AgentNode>> {
        self.load_all(NODES_FILE)
    }

    fn save_nodes(&self, nodes: &[AgentNode]) -> Result<()> {
        self.save_all(NODES_FILE, nodes)
    }
}

// ============================================================================
// NodeRegistry
// ============================================================================

/// Fields a restarted controller needs to reconcile a node
#[derive(PartialEq)]
struct DurableFields {
    launched: bool,
    task: Option<RemoteTaskRef>,
    survivable: bool,
}

impl DurableFields {
    fn of(node: &AgentNode) -> Self {
        Self {
            launched: node.launched,
            task: node.task.clone(),
            survivable: node.survivable,
        }
    }
}

/// Every node the controller knows about
pub struct NodeRegistry {
    nodes: RwLock<HashMap<String, AgentNode>>,
    store: Option<Arc<dyn NodeStore>>,
    /// Serializes snapshot-then-write so an older snapshot never lands last
    persist_lock: Mutex<()>,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            store: None,
            persist_lock: Mutex::new(()),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn NodeStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Load persisted nodes, replacing the in-memory view
    pub async fn load(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let loaded = store.load_nodes()?;
        let count = loaded.len();

        let mut nodes = self.nodes.write().await;
        nodes.clear();
        for node in loaded {
            nodes.insert(node.name.clone(), node);
        }
        Ok(count)
    }

    /// Write every node to the store
    pub async fn persist(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let _persisting = self.persist_lock.lock().await;
        let mut records: Vec<AgentNode> = self.nodes.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        store.save_nodes(&records)
    }

    async fn persist_logged(&self) {
        if let Err(e) = self.persist().await {
            warn!("Failed to persist nodes: {}", e);
        }
    }

    pub async fn insert(&self, node: AgentNode) {
        self.nodes.write().await.insert(node.name.clone(), node);
        self.persist_logged().await;
    }

    pub async fn get(&self, name: &str) -> Option<AgentNode> {
        self.nodes.read().await.get(name).cloned()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.nodes.read().await.contains_key(name)
    }

    /// Mutate a node in place; `None` if unknown.
    ///
    /// The store is only written when a durable field changed (launched
    /// flag, task reference, survivability). State moves stay in memory.
    pub async fn update<R>(&self, name: &str, f: impl FnOnce(&mut AgentNode) -> R) -> Option<R> {
        let (result, durable_change) = {
            let mut nodes = self.nodes.write().await;
            let node = nodes.get_mut(name)?;
            let before = DurableFields::of(node);
            let result = f(node);
            (result, before != DurableFields::of(node))
        };
        if durable_change {
            self.persist_logged().await;
        }
        Some(result)
    }

    pub async fn remove(&self, name: &str) -> Option<AgentNode> {
        let removed = self.nodes.write().await.remove(name);
        if removed.is_some() {
            self.persist_logged().await;
        }
        removed
    }

    pub async fn list(&self) -> Vec<AgentNode> {
        let mut nodes: Vec<AgentNode> = self.nodes.read().await.values().cloned().collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        nodes
    }

    pub async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.nodes.read().await.is_empty()
    }

    /// Online nodes serving `label`
    pub async fn count_online_serving(&self, label: &str) -> usize {
        self.nodes
            .read()
            .await
            .values()
            .filter(|n| n.is_online() && n.serves(label))
            .count()
    }

    /// Idle nodes serving `label`
    pub async fn count_idle_serving(&self, label: &str) -> usize {
        self.nodes
            .read()
            .await
            .values()
            .filter(|n| n.is_idle() && n.serves(label))
            .count()
    }

    /// Idle, online nodes of `pool` whose labels cover `labels`
    pub async fn count_idle_in_pool(&self, pool: &str, labels: &BTreeSet<String>) -> usize {
        self.nodes
            .read()
            .await
            .values()
            .filter(|n| n.pool.as_deref() == Some(pool))
            .filter(|n| n.is_idle() && labels.is_subset(&n.labels))
            .count()
    }

    /// Nodes still launching for `label`
    pub async fn count_connecting(&self, label: &str) -> usize {
        self.nodes
            .read()
            .await
            .values()
            .filter(|n| n.state.is_launching() && n.serves(label))
            .count()
    }
}
