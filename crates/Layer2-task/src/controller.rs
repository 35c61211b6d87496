//! Controller wiring
//!
//! 컨트롤러는 모든 컴포넌트를 명시적으로 소유하고 연결한다:
//!
//! - [`ProvisioningStrategy`]: demand 이벤트마다 실행
//! - [`PoolMaintainer`], [`RetentionController`], [`ClusterScaleIn`]: 주기적 백그라운드 루프
//! - [`AgentLauncher`]: bounded [`LaunchPool`]에서 노드별로 실행
//!
//! Templates and pools belong to one controller instance; nothing is looked
//! up through process-wide state.

use crate::connection::{AgentConnections, ConnectionRegistry};
use crate::launcher::{AgentLauncher, LaunchPool};
use crate::node::{AgentNode, NodeRegistry, NodeStore};
use crate::pool::{AgentPool, PoolMaintainer, PoolProvisioner};
use crate::remote::RemoteTaskService;
use crate::retention::RetentionController;
use crate::scale_in::{ClusterScaleIn, HostGroup};
use crate::strategy::{
    DemandSnapshot, PlannedAgent, ProvisioningListener, ProvisioningSource, ProvisioningStrategy,
    StrategyOutcome,
};
use crate::template::{EffectiveTemplate, TaskTemplate, TemplateSet};
use async_trait::async_trait;
use fleet_foundation::{Error, FleetConfig, Result};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ============================================================================
// Template-backed provisioning
// ============================================================================

/// Creates nodes from the controller's templates and hands them to the
/// launch pool. Serves both demand-driven and warm-pool launches.
pub struct TemplateProvisioner {
    controller: String,
    default_idle_minutes: u32,
    templates: Arc<RwLock<TemplateSet>>,
    registry: Arc<NodeRegistry>,
    connections: Arc<ConnectionRegistry>,
    launch_pool: LaunchPool,
}

impl TemplateProvisioner {
    fn template_for_label(&self, label: &str) -> Option<EffectiveTemplate> {
        self.templates.read().matching(label).into_iter().next()
    }

    /// Register a fresh node and issue its connection secret
    async fn prepare_node(&self, template: &EffectiveTemplate, pool: Option<&AgentPool>) -> String {
        let mut node = AgentNode::new(&self.controller, template, self.default_idle_minutes);
        if let Some(pool) = pool {
            node = node.with_pool(pool.id.clone(), pool.max_idle_minutes);
        }
        let name = node.name.clone();
        self.connections.issue(&name, &node.secret);
        self.registry.insert(node).await;
        name
    }
}

#[async_trait]
impl ProvisioningSource for TemplateProvisioner {
    fn name(&self) -> &str {
        &self.controller
    }

    fn can_serve(&self, label: &str) -> bool {
        self.template_for_label(label).is_some()
    }

    async fn provision(&self, label: &str, count: usize) -> Result<Vec<PlannedAgent>> {
        let template = self
            .template_for_label(label)
            .ok_or_else(|| Error::NotFound(format!("Template for label {}", label)))?;

        let mut planned = Vec::with_capacity(count);
        for _ in 0..count {
            let name = self.prepare_node(&template, None).await;
            // a failed launch tears its node down; the ticket carries the error
            let ticket = self.launch_pool.submit(name.clone(), template.clone());
            planned.push(PlannedAgent::new(name, template.name.clone(), label).with_launch(ticket));
        }
        Ok(planned)
    }
}

#[async_trait]
impl PoolProvisioner for TemplateProvisioner {
    async fn launch_for_pool(&self, pool: &AgentPool) -> Result<String> {
        let template = self.templates.read().effective(&pool.template)?;
        let name = self.prepare_node(&template, Some(pool)).await;
        self.launch_pool.launch(&name, &template).await?;
        Ok(name)
    }
}

// ============================================================================
// Controller
// ============================================================================

/// Outcome of restart reconciliation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub loaded: usize,
    pub restored: usize,
    pub destroyed: Vec<String>,
}

pub struct ControllerBuilder {
    config: FleetConfig,
    service: Arc<dyn RemoteTaskService>,
    host_group: Option<Arc<dyn HostGroup>>,
    store: Option<Arc<dyn NodeStore>>,
    templates: Vec<TaskTemplate>,
    pools: Vec<AgentPool>,
    listeners: Vec<Arc<dyn ProvisioningListener>>,
}

impl ControllerBuilder {
    pub fn host_group(mut self, group: Arc<dyn HostGroup>) -> Self {
        self.host_group = Some(group);
        self
    }

    pub fn store(mut self, store: Arc<dyn NodeStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn templates(mut self, templates: impl IntoIterator<Item = TaskTemplate>) -> Self {
        self.templates.extend(templates);
        self
    }

    pub fn pools(mut self, pools: impl IntoIterator<Item = AgentPool>) -> Self {
        self.pools.extend(pools);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn ProvisioningListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn build(self) -> Controller {
        let config = self.config;
        let cancel = CancellationToken::new();

        let mut registry = NodeRegistry::new();
        if let Some(store) = self.store {
            registry = registry.with_store(store);
        }
        let registry = Arc::new(registry);
        let connections = Arc::new(ConnectionRegistry::new());
        let templates = Arc::new(RwLock::new(TemplateSet::from_templates(self.templates)));

        let launcher = Arc::new(
            AgentLauncher::new(
                Arc::clone(&self.service),
                Arc::clone(&registry),
                Arc::clone(&connections) as Arc<dyn AgentConnections>,
                config.controller_name.clone(),
                config.cluster_id.clone(),
            )
            .with_settings(config.launcher.clone())
            .with_controller_url(config.controller_url.clone()),
        );
        let launch_pool = LaunchPool::new(Arc::clone(&launcher), config.workers);

        let retention = Arc::new(
            RetentionController::new(
                Arc::clone(&registry),
                Arc::clone(&self.service),
                launcher.terminator().clone(),
            )
            .with_settings(config.retention.clone())
            .with_cancel(cancel.clone()),
        );

        let provisioner = Arc::new(TemplateProvisioner {
            controller: config.controller_name.clone(),
            default_idle_minutes: config.retention.default_idle_minutes,
            templates: Arc::clone(&templates),
            registry: Arc::clone(&registry),
            connections: Arc::clone(&connections),
            launch_pool: launch_pool.clone(),
        });

        let mut strategy =
            ProvisioningStrategy::new().with_source(Arc::clone(&provisioner) as Arc<dyn ProvisioningSource>);
        for listener in self.listeners {
            strategy = strategy.with_listener(listener);
        }

        let maintainer = Arc::new(
            PoolMaintainer::new(Arc::clone(&registry), provisioner as Arc<dyn PoolProvisioner>)
                .with_settings(config.pools.clone())
                .with_cancel(cancel.clone())
                .with_pools(self.pools),
        );

        let scale_in = match (&config.host_group, self.host_group) {
            (Some(group_name), Some(group)) if config.scale_in.enabled => Some(Arc::new(
                ClusterScaleIn::new(
                    Arc::clone(&self.service),
                    group,
                    config.cluster_id.clone(),
                    group_name.clone(),
                )
                .with_settings(config.scale_in.clone()),
            )),
            _ => None,
        };

        Controller {
            config,
            service: self.service,
            templates,
            registry,
            connections,
            launcher,
            retention,
            strategy,
            maintainer,
            scale_in,
            cancel,
            handles: Mutex::new(Vec::new()),
        }
    }
}

pub struct Controller {
    config: FleetConfig,
    service: Arc<dyn RemoteTaskService>,
    templates: Arc<RwLock<TemplateSet>>,
    registry: Arc<NodeRegistry>,
    connections: Arc<ConnectionRegistry>,
    launcher: Arc<AgentLauncher>,
    retention: Arc<RetentionController>,
    strategy: ProvisioningStrategy,
    maintainer: Arc<PoolMaintainer>,
    scale_in: Option<Arc<ClusterScaleIn>>,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Controller {
    pub fn builder(config: FleetConfig, service: Arc<dyn RemoteTaskService>) -> ControllerBuilder {
        ControllerBuilder {
            config,
            service,
            host_group: None,
            store: None,
            templates: Vec::new(),
            pools: Vec::new(),
            listeners: Vec::new(),
        }
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn service(&self) -> &Arc<dyn RemoteTaskService> {
        &self.service
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    pub fn launcher(&self) -> &Arc<AgentLauncher> {
        &self.launcher
    }

    pub fn retention(&self) -> &Arc<RetentionController> {
        &self.retention
    }

    pub fn maintainer(&self) -> &Arc<PoolMaintainer> {
        &self.maintainer
    }

    pub fn scale_in(&self) -> Option<&Arc<ClusterScaleIn>> {
        self.scale_in.as_ref()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    // ========================================================================
    // Templates & pools
    // ========================================================================

    pub fn add_template(&self, template: TaskTemplate) {
        info!("Template {} added", template.name);
        self.templates.write().insert(template);
    }

    /// Remove a template and deregister its definition family
    pub async fn remove_template(&self, name: &str) -> Option<TaskTemplate> {
        let removed = self.templates.write().remove(name)?;
        self.launcher.registrar().deregister_family(name).await;
        info!("Template {} removed", name);
        Some(removed)
    }

    pub fn effective_template(&self, name: &str) -> Result<EffectiveTemplate> {
        self.templates.read().effective(name)
    }

    pub fn template_names(&self) -> Vec<String> {
        self.templates.read().names().map(String::from).collect()
    }

    pub fn add_pool(&self, pool: AgentPool) {
        info!("Pool {} configured (min idle {})", pool.id, pool.min_idle_agents);
        self.maintainer.upsert_pool(pool);
    }

    pub fn remove_pool(&self, id: &str) -> bool {
        self.maintainer.remove_pool(id)
    }

    // ========================================================================
    // Demand
    // ========================================================================

    /// Snapshot for `label` given the queue length the scheduler reports
    pub async fn snapshot_for(&self, label: &str, queue_length: i64) -> DemandSnapshot {
        let available = self.registry.count_idle_serving(label).await;
        let connecting = self.registry.count_connecting(label).await;
        DemandSnapshot::new(label, queue_length)
            .with_available(available as i64)
            .with_connecting(connecting as i64)
    }

    pub async fn on_demand(&self, snapshot: &DemandSnapshot) -> StrategyOutcome {
        let outcome = self.strategy.apply(snapshot).await;
        if outcome.has_remaining() {
            debug!(
                "{} agent(s) of demand for {} left unserved",
                outcome.remaining, snapshot.label
            );
        }
        outcome
    }

    /// Apply every snapshot received on `demand` until cancelled
    pub fn spawn_demand_loop(self: &Arc<Self>, mut demand: mpsc::Receiver<DemandSnapshot>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = this.cancel.cancelled() => break,
                    snapshot = demand.recv() => match snapshot {
                        Some(snapshot) => {
                            this.on_demand(&snapshot).await;
                        }
                        None => break,
                    },
                }
            }
            debug!("Demand loop stopped");
        })
    }

    // ========================================================================
    // Connection layer callbacks
    // ========================================================================

    pub fn on_agent_connected(&self, name: &str, secret: &str) -> Result<()> {
        self.connections.attach(name, secret)
    }

    pub async fn on_agent_disconnected(&self, name: &str) -> bool {
        if !self.connections.detach(name) {
            return false;
        }
        self.retention.on_disconnected(name).await
    }

    pub async fn on_work_started(&self, name: &str) {
        self.registry.update(name, |node| node.mark_busy()).await;
    }

    pub async fn on_work_completed(&self, name: &str) {
        self.retention.on_task_completed(name).await;
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Reload persisted nodes. Launched nodes are not launched again; their
    /// secrets are reissued and nodes whose task is gone are destroyed.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport {
            loaded: self.registry.load().await?,
            ..Default::default()
        };

        for node in self.registry.list().await {
            if !node.launched {
                warn!("Node {} never finished launching, removing it", node.name);
                self.launcher
                    .terminator()
                    .destroy(&node.name, "incomplete launch before restart")
                    .await;
                report.destroyed.push(node.name);
                continue;
            }

            self.connections.issue(&node.name, &node.secret);
            if self.retention.check_survivable(&node.name).await {
                report.restored += 1;
            } else {
                self.launcher
                    .terminator()
                    .destroy(&node.name, "task lost while controller was down")
                    .await;
                report.destroyed.push(node.name);
            }
        }

        info!(
            "Reconciled {} node(s): {} restored, {} destroyed",
            report.loaded,
            report.restored,
            report.destroyed.len()
        );
        Ok(report)
    }

    /// Reconcile, then start the background loops
    pub async fn start(&self) -> Result<ReconcileReport> {
        let report = self.reconcile().await?;

        let mut handles = Vec::new();
        handles.push(Arc::clone(&self.retention).start());
        handles.push(Arc::clone(&self.maintainer).start());
        if let Some(scale_in) = &self.scale_in {
            handles.push(Arc::clone(scale_in).start(self.cancel.clone()));
        }
        self.handles.lock().extend(handles);

        info!(
            "Controller {} started on cluster {}",
            self.config.controller_name, self.config.cluster_id
        );
        Ok(report)
    }

    /// Cancel every loop and wait for them to exit
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for result in join_all(handles).await {
            if let Err(e) = result {
                warn!("Background loop ended abnormally: {}", e);
            }
        }
        if let Err(e) = self.registry.persist().await {
            warn!("Failed to persist nodes on shutdown: {}", e);
        }
        info!("Controller {} stopped", self.config.controller_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::InMemoryTaskService;
    use crate::template::RetentionPolicy;

    fn controller(service: Arc<InMemoryTaskService>) -> Controller {
        Controller::builder(FleetConfig::default(), service)
            .templates([TaskTemplate::new("builder")
                .with_image("agent:1")
                .with_labels(["linux"])
                .with_retention(RetentionPolicy::Persistent, 0)])
            .build()
    }

    #[tokio::test]
    async fn test_snapshot_counts_registry() {
        let controller = controller(Arc::new(InMemoryTaskService::new()));
        let template = controller.effective_template("builder").unwrap();
        controller
            .registry()
            .insert(AgentNode::new("fleet", &template, 5))
            .await;

        let snapshot = controller.snapshot_for("linux", 4).await;
        assert_eq!(snapshot.connecting, 1);
        assert_eq!(snapshot.available, 0);
        assert_eq!(snapshot.excess(), 3);
    }

    #[tokio::test]
    async fn test_remove_template_deregisters_family() {
        let service = Arc::new(InMemoryTaskService::new());
        let controller = controller(service.clone());
        let template = controller.effective_template("builder").unwrap();
        controller
            .launcher()
            .registrar()
            .register_or_reuse(&template)
            .await
            .unwrap();

        assert!(controller.remove_template("builder").await.is_some());
        assert!(controller.effective_template("builder").is_err());
        assert_eq!(service.stats().deregistrations, 1);
        assert!(controller.remove_template("builder").await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_label_leaves_demand() {
        let controller = controller(Arc::new(InMemoryTaskService::new()));
        let outcome = controller.on_demand(&DemandSnapshot::new("windows", 2)).await;
        assert_eq!(outcome.remaining, 2);
        assert_eq!(outcome.started, 0);
    }
}
