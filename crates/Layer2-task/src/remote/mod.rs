//! Remote Task Service Module
//!
//! Thin contract over the container orchestration API: task definitions,
//! tasks and cluster hosts. Implementations do not retry internally; the
//! only loop here is pagination continuation in [`list_hosts`].

pub mod memory;

use crate::template::{ContainerSpec, LaunchMode, NetworkMode, VolumeSpec};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_foundation::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub use memory::InMemoryTaskService;

// ============================================================================
// Task definitions
// ============================================================================

/// What gets registered for a definition family
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefinitionSpec {
    pub family: String,
    pub container: ContainerSpec,
    pub volumes: Vec<VolumeSpec>,
    pub task_role: Option<String>,
    pub execution_role: Option<String>,
    pub network_mode: NetworkMode,
    pub launch_mode: LaunchMode,
}

impl DefinitionSpec {
    /// Whether registering `self` would change anything the service runs.
    ///
    /// Only container spec, volumes, roles and network mode are compared.
    pub fn same_registration(&self, other: &DefinitionSpec) -> bool {
        self.container == other.container
            && self.volumes == other.volumes
            && self.task_role == other.task_role
            && self.execution_role == other.execution_role
            && self.network_mode == other.network_mode
    }
}

/// A registered, versioned definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition {
    /// Service-assigned identifier (`family:revision`)
    pub id: String,
    pub family: String,
    pub revision: u32,
    pub spec: DefinitionSpec,
}

// ============================================================================
// Tasks
// ============================================================================

/// Remote task status, both observed (`last`) and requested (`desired`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Provisioning,
    Pending,
    Activating,
    Running,
    Deactivating,
    Stopping,
    Deprovisioning,
    Stopped,
}

impl TaskStatus {
    /// Statuses from which a task will not come back
    pub fn is_down(&self) -> bool {
        matches!(
            self,
            Self::Deactivating | Self::Stopping | Self::Deprovisioning | Self::Stopped
        )
    }

    /// Statuses of a task that is (or is expected to be) alive
    pub fn is_up(&self) -> bool {
        matches!(
            self,
            Self::Provisioning | Self::Pending | Self::Activating | Self::Running
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Provisioning => "PROVISIONING",
            Self::Pending => "PENDING",
            Self::Activating => "ACTIVATING",
            Self::Running => "RUNNING",
            Self::Deactivating => "DEACTIVATING",
            Self::Stopping => "STOPPING",
            Self::Deprovisioning => "DEPROVISIONING",
            Self::Stopped => "STOPPED",
        };
        write!(f, "{}", s)
    }
}

/// Remote view of one task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteTask {
    pub task_id: String,
    pub cluster: String,
    pub definition_id: String,
    pub host_id: Option<String>,
    pub last_status: TaskStatus,
    pub desired_status: TaskStatus,
    pub stopped_reason: Option<String>,
}

impl RemoteTask {
    pub fn is_running(&self) -> bool {
        self.last_status == TaskStatus::Running
    }

    /// Stopped, or told to stop and already past running
    pub fn is_terminating(&self) -> bool {
        self.last_status == TaskStatus::Stopped
            || (self.last_status.is_down() && !self.desired_status.is_up())
    }
}

/// Per-run overrides
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOverrides {
    pub environment: BTreeMap<String, String>,
    pub cpu: Option<u32>,
    pub memory: Option<u32>,
    pub memory_reservation: Option<u32>,
}

/// Request to start one task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTaskRequest {
    pub cluster: String,
    pub definition_id: String,
    pub launch_mode: LaunchMode,
    pub command: Vec<String>,
    pub overrides: TaskOverrides,
    /// Idempotency/dedup tag (the node name)
    pub started_by: String,
}

/// Reason the service could not place a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacementFailure {
    pub reason: String,
    pub detail: Option<String>,
}

impl std::fmt::Display for PlacementFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{} ({})", self.reason, detail),
            None => write!(f, "{}", self.reason),
        }
    }
}

/// Result of `run_task`: the started task and/or placement failures
#[derive(Debug, Clone, Default)]
pub struct RunTaskOutput {
    pub task: Option<RemoteTask>,
    pub failures: Vec<PlacementFailure>,
}

// ============================================================================
// Hosts
// ============================================================================

/// Cluster membership status of a host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HostStatus {
    Active,
    Draining,
    Inactive,
}

/// One member of the underlying host fleet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostInstance {
    /// Cluster-level host id
    pub id: String,
    /// Id of the machine in the host group
    pub instance_id: String,
    pub status: HostStatus,
    pub pending_tasks: u32,
    pub running_tasks: u32,
    pub launched_at: DateTime<Utc>,
}

impl HostInstance {
    pub fn task_count(&self) -> u32 {
        self.pending_tasks + self.running_tasks
    }

    pub fn is_idle(&self) -> bool {
        self.task_count() == 0
    }

    pub fn uptime(&self, now: DateTime<Utc>) -> Duration {
        (now - self.launched_at).to_std().unwrap_or_default()
    }
}

/// One page of host ids
#[derive(Debug, Clone, Default)]
pub struct HostPage {
    pub ids: Vec<String>,
    pub next_token: Option<String>,
}

// ============================================================================
// Service trait
// ============================================================================

/// Orchestration API consumed by every controller component
#[async_trait]
pub trait RemoteTaskService: Send + Sync {
    /// Latest active revision of a definition family
    async fn latest_definition(&self, family: &str) -> Result<Option<TaskDefinition>>;

    /// Register a new revision
    async fn register_definition(&self, spec: DefinitionSpec) -> Result<TaskDefinition>;

    /// Deregister one revision
    async fn deregister_definition(&self, definition_id: &str) -> Result<()>;

    /// Start one task
    async fn run_task(&self, request: RunTaskRequest) -> Result<RunTaskOutput>;

    /// Describe a task; `None` when the service no longer knows it
    async fn describe_task(&self, cluster: &str, task_id: &str) -> Result<Option<RemoteTask>>;

    async fn stop_task(&self, cluster: &str, task_id: &str, reason: &str) -> Result<()>;

    /// One page of host ids, optionally filtered by status
    async fn list_hosts_page(
        &self,
        cluster: &str,
        status: Option<HostStatus>,
        next_token: Option<String>,
    ) -> Result<HostPage>;

    async fn describe_hosts(&self, cluster: &str, ids: &[String]) -> Result<Vec<HostInstance>>;

    /// Stop placing new tasks on a host; existing tasks keep running
    async fn set_host_draining(&self, cluster: &str, host_id: &str) -> Result<()>;
}

/// List every host id, draining all pages
pub async fn list_hosts(
    service: &dyn RemoteTaskService,
    cluster: &str,
    status: Option<HostStatus>,
) -> Result<Vec<String>> {
    let mut ids = Vec::new();
    let mut token = None;

    loop {
        let page = service.list_hosts_page(cluster, status, token).await?;
        ids.extend(page.ids);
        match page.next_token {
            Some(next) => token = Some(next),
            None => break,
        }
    }

    Ok(ids)
}

/// List and describe hosts in one status
pub async fn hosts_with_status(
    service: &dyn RemoteTaskService,
    cluster: &str,
    status: HostStatus,
) -> Result<Vec<HostInstance>> {
    let ids = list_hosts(service, cluster, Some(status)).await?;
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    service.describe_hosts(cluster, &ids).await
}
