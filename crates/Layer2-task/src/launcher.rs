//! Agent launcher
//!
//! Drives one [`AgentNode`](crate::node::AgentNode) from `Requested` to
//! online:
//!
//! 1. register or reuse the task definition
//! 2. run the task, retrying only on allow-listed causes
//! 3. poll until the task is running
//! 4. poll until the agent has connected
//!
//! Any fatal failure tears the node down before the error is returned.

use crate::connection::AgentConnections;
use crate::definition::DefinitionRegistrar;
use crate::node::{NodeRegistry, RemoteTaskRef};
use crate::remote::{RemoteTask, RemoteTaskService, RunTaskRequest, TaskOverrides};
use crate::state::NodeState;
use crate::template::{EffectiveTemplate, OverridableField};
use crate::terminate::NodeTerminator;
use chrono::Utc;
use fleet_foundation::{Error, LauncherSettings, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, OwnedMutexGuard, Semaphore};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

/// Environment handed to every agent task
pub const ENV_CONTROLLER_URL: &str = "FLEET_CONTROLLER_URL";
pub const ENV_AGENT_NAME: &str = "FLEET_AGENT_NAME";
pub const ENV_AGENT_SECRET: &str = "FLEET_AGENT_SECRET";

/// Per-cluster launch lock, one per cluster id
type ClusterLocks = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// Who owns a launch, decided atomically against the registry
enum LaunchClaim {
    Launched,
    InFlight(NodeState),
    Claimed(String),
}

pub struct AgentLauncher {
    service: Arc<dyn RemoteTaskService>,
    registrar: DefinitionRegistrar,
    registry: Arc<NodeRegistry>,
    connections: Arc<dyn AgentConnections>,
    terminator: NodeTerminator,
    settings: LauncherSettings,
    cluster: String,
    controller_url: String,
    cluster_locks: ClusterLocks,
}

impl AgentLauncher {
    pub fn new(
        service: Arc<dyn RemoteTaskService>,
        registry: Arc<NodeRegistry>,
        connections: Arc<dyn AgentConnections>,
        controller: impl Into<String>,
        cluster: impl Into<String>,
    ) -> Self {
        let terminator = NodeTerminator::new(service.clone(), registry.clone(), connections.clone());
        Self {
            registrar: DefinitionRegistrar::new(service.clone(), controller),
            service,
            registry,
            connections,
            terminator,
            settings: LauncherSettings::default(),
            cluster: cluster.into(),
            controller_url: String::new(),
            cluster_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_settings(mut self, settings: LauncherSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_controller_url(mut self, url: impl Into<String>) -> Self {
        self.controller_url = url.into();
        self
    }

    pub fn settings(&self) -> &LauncherSettings {
        &self.settings
    }

    pub fn registrar(&self) -> &DefinitionRegistrar {
        &self.registrar
    }

    pub fn terminator(&self) -> &NodeTerminator {
        &self.terminator
    }

    /// Launch with the configured timeout
    pub async fn launch_with_timeout(&self, node_name: &str, template: &EffectiveTemplate) -> Result<()> {
        let deadline = Instant::now() + self.settings.launch_timeout();
        self.launch(node_name, template, deadline).await
    }

    /// Bring `node_name` online before `deadline`.
    ///
    /// A node that already launched is left alone; a node another call is
    /// still launching is rejected with [`Error::Aborted`].
    pub async fn launch(
        &self,
        node_name: &str,
        template: &EffectiveTemplate,
        deadline: Instant,
    ) -> Result<()> {
        // claim under the registry lock so one launch owns the node
        let claim = self
            .registry
            .update(node_name, |node| {
                if node.launched {
                    return LaunchClaim::Launched;
                }
                if node.state != NodeState::Requested {
                    return LaunchClaim::InFlight(node.state);
                }
                if let Err(e) = node.transition(NodeState::TaskStarting) {
                    warn!("{}", e);
                }
                LaunchClaim::Claimed(node.secret.clone())
            })
            .await
            .ok_or_else(|| Error::Aborted(format!("Node {} is not registered", node_name)))?;

        let secret = match claim {
            LaunchClaim::Launched => {
                debug!("Node {} already launched", node_name);
                return Ok(());
            }
            LaunchClaim::InFlight(state) => {
                return Err(Error::Aborted(format!(
                    "Node {} is already launching ({})",
                    node_name, state
                )));
            }
            LaunchClaim::Claimed(secret) => secret,
        };

        match self.launch_stages(node_name, &secret, template, deadline).await {
            Ok(()) => {
                let first = self
                    .registry
                    .update(node_name, |node| {
                        if node.launched {
                            return false;
                        }
                        for next in [NodeState::AgentOnline, NodeState::Idle] {
                            if let Err(e) = node.transition(next) {
                                warn!("{}", e);
                            }
                        }
                        node.idle_since = Some(Utc::now());
                        node.launched = true;
                        true
                    })
                    .await
                    .ok_or_else(|| Error::Aborted(format!("Node {} disappeared", node_name)))?;

                if first {
                    info!("Node {} is online", node_name);
                }
                Ok(())
            }
            Err(e) => {
                error!("Launch of node {} failed: {}", node_name, e);
                self.terminator
                    .destroy(node_name, &format!("launch failed: {}", e))
                    .await;
                Err(e)
            }
        }
    }

    async fn launch_stages(
        &self,
        node_name: &str,
        secret: &str,
        template: &EffectiveTemplate,
        deadline: Instant,
    ) -> Result<()> {
        let registered = self.registrar.register_or_reuse(template).await?;
        let definition_id = registered.definition.id;

        {
            let _guard = if template.launch_mode.needs_capacity_lock() {
                Some(self.lock_cluster().await)
            } else {
                None
            };
            self.run_with_retries(node_name, secret, &definition_id, template, deadline)
                .await?;
        }

        self.set_state(node_name, NodeState::AgentConnecting).await;
        self.wait_for_connection(node_name, deadline).await
    }

    async fn lock_cluster(&self) -> OwnedMutexGuard<()> {
        let lock = self
            .cluster_locks
            .lock()
            .entry(self.cluster.clone())
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    async fn run_with_retries(
        &self,
        node_name: &str,
        secret: &str,
        definition_id: &str,
        template: &EffectiveTemplate,
        deadline: Instant,
    ) -> Result<RemoteTask> {
        let max_attempts = self.settings.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            info!(
                "Starting task for node {} (attempt {}/{})",
                node_name, attempt, max_attempts
            );

            match self
                .run_and_wait(node_name, secret, definition_id, template, deadline)
                .await
            {
                Ok(task) => return Ok(task),
                Err(e) if self.is_retryable(&e) => {
                    if attempt >= max_attempts {
                        return Err(Error::AttemptsExceeded {
                            attempts: attempt,
                            last: e.to_string(),
                        });
                    }
                    warn!("Node {} hit a retryable failure: {}", node_name, e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Only allow-listed causes of run/stop failures are retried
    fn is_retryable(&self, error: &Error) -> bool {
        match error {
            Error::Remote { message, .. } | Error::Placement(message) | Error::TaskStopped(message) => {
                self.settings.is_retryable_cause(message)
            }
            _ => false,
        }
    }

    async fn run_and_wait(
        &self,
        node_name: &str,
        secret: &str,
        definition_id: &str,
        template: &EffectiveTemplate,
        deadline: Instant,
    ) -> Result<RemoteTask> {
        self.set_state(node_name, NodeState::TaskStarting).await;

        let request = RunTaskRequest {
            cluster: self.cluster.clone(),
            definition_id: definition_id.to_string(),
            launch_mode: template.launch_mode,
            command: self.command_for(node_name, secret, template),
            overrides: self.overrides_for(node_name, secret, template),
            started_by: node_name.to_string(),
        };

        let output = self.service.run_task(request).await?;
        if !output.failures.is_empty() {
            let reasons: Vec<String> = output.failures.iter().map(ToString::to_string).collect();
            warn!(
                "Placement failed for node {}: {}",
                node_name,
                reasons.join(", ")
            );
            return Err(Error::Placement(reasons.join(", ")));
        }
        let task = output
            .task
            .ok_or_else(|| Error::Placement("service returned no task".to_string()))?;

        debug!("Node {} got task {}", node_name, task.task_id);
        let task_ref = RemoteTaskRef {
            task_id: task.task_id.clone(),
            cluster_id: task.cluster.clone(),
            definition_id: task.definition_id.clone(),
            host_id: task.host_id.clone(),
        };
        self.registry
            .update(node_name, |node| node.task = Some(task_ref))
            .await
            .ok_or_else(|| Error::Aborted(format!("Node {} disappeared", node_name)))?;

        let running = self.wait_until_running(&task, deadline).await?;
        let host_id = running.host_id.clone();
        self.registry
            .update(node_name, |node| {
                if let Some(task) = node.task.as_mut() {
                    task.host_id = host_id;
                }
                if let Err(e) = node.transition(NodeState::TaskRunning) {
                    warn!("{}", e);
                }
            })
            .await;
        info!("Task {} of node {} is running", running.task_id, node_name);
        Ok(running)
    }

    async fn wait_until_running(&self, task: &RemoteTask, deadline: Instant) -> Result<RemoteTask> {
        let poll = self.settings.poll_interval();

        loop {
            match self.service.describe_task(&task.cluster, &task.task_id).await? {
                Some(current) if current.is_running() => return Ok(current),
                Some(current) if current.is_terminating() => {
                    let reason = current
                        .stopped_reason
                        .unwrap_or_else(|| "no reason given".to_string());
                    return Err(Error::TaskStopped(format!("{}: {}", current.task_id, reason)));
                }
                Some(current) => debug!("Task {} is {}", current.task_id, current.last_status),
                None => debug!("Task {} not visible yet", task.task_id),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(self.start_timeout(task).await);
            }
            sleep(poll.min(deadline - now)).await;
        }
    }

    /// Fetch the final task state for the log, then build the timeout error
    async fn start_timeout(&self, task: &RemoteTask) -> Error {
        let status = match self.service.describe_task(&task.cluster, &task.task_id).await {
            Ok(Some(current)) => {
                warn!(
                    "Task {} last status {} desired {} reason {:?}",
                    current.task_id,
                    current.last_status,
                    current.desired_status,
                    current.stopped_reason
                );
                current.last_status.to_string()
            }
            Ok(None) => "absent".to_string(),
            Err(e) => {
                warn!("Could not describe task {}: {}", task.task_id, e);
                "unknown".to_string()
            }
        };
        Error::Timeout(format!(
            "Task {} took too long to start (last status {})",
            task.task_id, status
        ))
    }

    async fn wait_for_connection(&self, node_name: &str, deadline: Instant) -> Result<()> {
        let poll = self.settings.poll_interval();

        loop {
            if !self.registry.contains(node_name).await {
                return Err(Error::Aborted(format!(
                    "Node {} was removed while waiting for it to connect",
                    node_name
                )));
            }
            if self.connections.is_online(node_name).await {
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout(format!(
                    "Agent {} did not connect in time",
                    node_name
                )));
            }
            sleep(poll.min(deadline - now)).await;
        }
    }

    async fn set_state(&self, node_name: &str, next: NodeState) {
        self.registry
            .update(node_name, |node| {
                if let Err(e) = node.transition(next) {
                    warn!("{}", e);
                }
            })
            .await;
    }

    fn overrides_for(&self, node_name: &str, secret: &str, template: &EffectiveTemplate) -> TaskOverrides {
        let mut overrides = TaskOverrides::default();
        overrides
            .environment
            .insert(ENV_CONTROLLER_URL.to_string(), self.controller_url.clone());
        overrides
            .environment
            .insert(ENV_AGENT_NAME.to_string(), node_name.to_string());
        overrides
            .environment
            .insert(ENV_AGENT_SECRET.to_string(), secret.to_string());

        if template.can_override(OverridableField::Cpu) {
            overrides.cpu = Some(template.cpu);
        }
        if template.can_override(OverridableField::Memory) {
            overrides.memory = template.memory;
        }
        if template.can_override(OverridableField::MemoryReservation) {
            overrides.memory_reservation = template.memory_reservation;
        }
        overrides
    }

    fn command_for(&self, node_name: &str, secret: &str, template: &EffectiveTemplate) -> Vec<String> {
        if !template.can_override(OverridableField::Command) {
            return Vec::new();
        }
        vec![
            "-url".to_string(),
            self.controller_url.clone(),
            secret.to_string(),
            node_name.to_string(),
        ]
    }
}

// ============================================================================
// LaunchPool
// ============================================================================

/// Progress of a background launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchStatus {
    Pending,
    Online,
    Failed(String),
}

/// Handle on a background launch. Clones observe the same outcome.
#[derive(Debug, Clone)]
pub struct LaunchTicket {
    node: String,
    status: watch::Receiver<LaunchStatus>,
}

impl LaunchTicket {
    pub fn node_name(&self) -> &str {
        &self.node
    }

    pub fn status(&self) -> LaunchStatus {
        self.status.borrow().clone()
    }

    /// Wait for the launch to finish
    pub async fn outcome(&self) -> Result<()> {
        let mut status = self.status.clone();
        let finished = status
            .wait_for(|s| *s != LaunchStatus::Pending)
            .await
            .map_err(|_| Error::Aborted(format!("Launch of {} was abandoned", self.node)))?
            .clone();
        match finished {
            LaunchStatus::Failed(reason) => Err(Error::Aborted(reason)),
            _ => Ok(()),
        }
    }
}

/// Bounded worker pool running launches in the background
#[derive(Clone)]
pub struct LaunchPool {
    launcher: Arc<AgentLauncher>,
    permits: Arc<Semaphore>,
}

impl LaunchPool {
    pub fn new(launcher: Arc<AgentLauncher>, workers: usize) -> Self {
        Self {
            launcher,
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    pub fn launcher(&self) -> &Arc<AgentLauncher> {
        &self.launcher
    }

    /// Launch in the background once a worker is free
    pub fn submit(&self, node_name: String, template: EffectiveTemplate) -> LaunchTicket {
        let (tx, rx) = watch::channel(LaunchStatus::Pending);
        let ticket = LaunchTicket {
            node: node_name.clone(),
            status: rx,
        };

        let pool = self.clone();
        tokio::spawn(async move {
            let status = match pool.launch(&node_name, &template).await {
                Ok(()) => LaunchStatus::Online,
                Err(e) => LaunchStatus::Failed(e.to_string()),
            };
            tx.send_replace(status);
        });
        ticket
    }

    /// Launch and wait for the result, still bounded by the pool
    pub async fn launch(&self, node_name: &str, template: &EffectiveTemplate) -> Result<()> {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Cancelled)?;
        self.launcher.launch_with_timeout(node_name, template).await
    }

    pub fn available_workers(&self) -> usize {
        self.permits.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionRegistry;
    use crate::node::AgentNode;
    use crate::remote::memory::RunScript;
    use crate::remote::InMemoryTaskService;
    use crate::template::{LaunchMode, TaskTemplate, TemplateSet};
    use std::time::Duration;

    struct Harness {
        service: Arc<InMemoryTaskService>,
        registry: Arc<NodeRegistry>,
        connections: Arc<ConnectionRegistry>,
        launcher: Arc<AgentLauncher>,
        template: EffectiveTemplate,
    }

    fn harness(template: TaskTemplate) -> Harness {
        let service = Arc::new(InMemoryTaskService::new());
        let registry = Arc::new(NodeRegistry::new());
        let connections = Arc::new(ConnectionRegistry::new());
        let launcher = Arc::new(
            AgentLauncher::new(
                service.clone(),
                registry.clone(),
                connections.clone(),
                "fleet",
                "default",
            )
            .with_controller_url("http://controller:8080"),
        );
        let name = template.name.clone();
        let template = TemplateSet::from_templates([template]).effective(&name).unwrap();
        Harness {
            service,
            registry,
            connections,
            launcher,
            template,
        }
    }

    fn builder() -> TaskTemplate {
        TaskTemplate::new("builder")
            .with_image("agent:1")
            .with_labels(["linux"])
    }

    impl Harness {
        async fn node(&self) -> String {
            let node = AgentNode::new("fleet", &self.template, 5);
            let name = node.name.clone();
            self.connections.issue(&name, &node.secret);
            self.registry.insert(node).await;
            name
        }

        /// Simulate the agent attaching shortly after its task runs
        fn connect_later(&self, name: &str) {
            let connections = self.connections.clone();
            let registry = self.registry.clone();
            let name = name.to_string();
            tokio::spawn(async move {
                loop {
                    sleep(Duration::from_millis(500)).await;
                    let Some(node) = registry.get(&name).await else { return };
                    if node.state == NodeState::AgentConnecting {
                        let _ = connections.attach(&name, &node.secret);
                        return;
                    }
                }
            });
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_launch_reaches_online() {
        let h = harness(builder());
        let name = h.node().await;
        h.connect_later(&name);

        h.launcher.launch_with_timeout(&name, &h.template).await.unwrap();

        let node = h.registry.get(&name).await.unwrap();
        assert!(node.launched);
        assert_eq!(node.state, NodeState::Idle);
        assert!(node.task.is_some());
        assert_eq!(h.service.stats().runs, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_launch_is_noop() {
        let h = harness(builder());
        let name = h.node().await;
        h.connect_later(&name);

        h.launcher.launch_with_timeout(&name, &h.template).await.unwrap();
        h.launcher.launch_with_timeout(&name, &h.template).await.unwrap();

        assert_eq!(h.service.stats().runs, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_overrides_carry_connection_env() {
        let mut template = builder().with_resources(1024, 2048);
        template.overridable = crate::template::Field::Set([OverridableField::Cpu].into());
        let h = harness(template);
        let name = h.node().await;
        let secret = h.registry.get(&name).await.unwrap().secret;

        let overrides = h.launcher.overrides_for(&name, &secret, &h.template);
        assert_eq!(overrides.environment[ENV_AGENT_NAME], name);
        assert_eq!(overrides.environment[ENV_AGENT_SECRET], secret);
        assert_eq!(overrides.cpu, Some(1024));
        assert_eq!(overrides.memory, None);
        assert!(h.launcher.command_for(&name, &secret, &h.template).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_running_times_out_and_cleans_up() {
        let h = harness(builder());
        let name = h.node().await;
        h.service.script_run(RunScript::NeverStart);

        let err = h
            .launcher
            .launch(&name, &h.template, Instant::now() + Duration::from_secs(30))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Timeout(ref m) if m.contains("took too long to start")));
        assert!(!h.registry.contains(&name).await);
        assert_eq!(h.service.stats().stops, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_agent_never_connects() {
        let h = harness(builder());
        let name = h.node().await;

        let err = h
            .launcher
            .launch(&name, &h.template, Instant::now() + Duration::from_secs(10))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Timeout(_)));
        assert!(!h.registry.contains(&name).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_serverless_skips_cluster_lock() {
        let h = harness(builder().with_launch_mode(LaunchMode::Serverless));
        let name = h.node().await;
        h.connect_later(&name);

        let _held = h.launcher.lock_cluster().await;
        h.launcher.launch_with_timeout(&name, &h.template).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_launch_pool_bounds_workers() {
        let h = harness(builder());
        let pool = LaunchPool::new(h.launcher.clone(), 2);
        let name = h.node().await;
        h.connect_later(&name);

        let ticket = pool.submit(name.clone(), h.template.clone());
        assert_eq!(ticket.status(), LaunchStatus::Pending);
        ticket.outcome().await.unwrap();
        assert_eq!(ticket.status(), LaunchStatus::Online);
        assert_eq!(pool.available_workers(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticket_reports_launch_failure() {
        let h = harness(builder());
        let pool = LaunchPool::new(h.launcher.clone(), 1);
        let name = h.node().await;
        h.service.script_run(RunScript::Fail("RESOURCE:MEMORY".into()));

        let ticket = pool.submit(name.clone(), h.template.clone());
        let err = ticket.outcome().await.unwrap_err();

        assert!(err.to_string().contains("RESOURCE:MEMORY"));
        assert!(matches!(ticket.status(), LaunchStatus::Failed(_)));
        assert!(!h.registry.contains(&name).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_launches_start_one_task() {
        let h = harness(builder());
        let name = h.node().await;
        h.connect_later(&name);

        let (first, second) = tokio::join!(
            h.launcher.launch_with_timeout(&name, &h.template),
            h.launcher.launch_with_timeout(&name, &h.template),
        );

        let results = [first, second];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(Error::Aborted(m)) if m.contains("already launching"))));
        assert_eq!(h.service.stats().runs, 1);
        assert_eq!(h.registry.get(&name).await.unwrap().state, NodeState::Idle);
    }
}
