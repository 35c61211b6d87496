//! Controller lifecycle integration tests
//!
//! `cargo test -p fleet-task --test lifecycle_test`

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use fleet_foundation::{Error, FleetConfig, RecordStore, Result, ScaleInSettings, DEFAULT_RETRYABLE_CAUSE};
use fleet_task::remote::memory::RunScript;
use fleet_task::*;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

// ============================================================================
// Helpers
// ============================================================================

fn builder_template() -> TaskTemplate {
    TaskTemplate::new("builder")
        .with_image("registry.local/agent:1")
        .with_labels(["linux"])
        .with_resources(1024, 2048)
}

fn effective(templates: Vec<TaskTemplate>, name: &str) -> EffectiveTemplate {
    TemplateSet::from_templates(templates).effective(name).unwrap()
}

struct LaunchHarness {
    service: Arc<InMemoryTaskService>,
    registry: Arc<NodeRegistry>,
    connections: Arc<ConnectionRegistry>,
    launcher: AgentLauncher,
    template: EffectiveTemplate,
}

fn launch_harness() -> LaunchHarness {
    let service = Arc::new(InMemoryTaskService::new());
    let registry = Arc::new(NodeRegistry::new());
    let connections = Arc::new(ConnectionRegistry::new());
    let launcher = AgentLauncher::new(
        service.clone(),
        registry.clone(),
        connections.clone(),
        "fleet",
        "default",
    );
    LaunchHarness {
        service,
        registry,
        connections,
        launcher,
        template: effective(vec![builder_template()], "builder"),
    }
}

impl LaunchHarness {
    async fn node(&self) -> String {
        let node = AgentNode::new("fleet", &self.template, 5);
        let name = node.name.clone();
        self.connections.issue(&name, &node.secret);
        self.registry.insert(node).await;
        name
    }
}

/// Attach every agent that is waiting to connect
fn spawn_agent_simulator(registry: Arc<NodeRegistry>, connections: Arc<ConnectionRegistry>) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_millis(500)).await;
            for node in registry.list().await {
                if node.state == NodeState::AgentConnecting {
                    let _ = connections.attach(&node.name, &node.secret);
                }
            }
        }
    });
}

fn host(id: &str, uptime: ChronoDuration, running: u32) -> HostInstance {
    HostInstance {
        id: id.into(),
        instance_id: format!("i-{}", id),
        status: HostStatus::Active,
        pending_tasks: 0,
        running_tasks: running,
        launched_at: Utc::now() - uptime,
    }
}

// ============================================================================
// Templates & definitions
// ============================================================================

#[tokio::test]
async fn test_registration_is_idempotent() {
    let service = Arc::new(InMemoryTaskService::new());
    let registrar = DefinitionRegistrar::new(service.clone(), "fleet");
    let template = effective(vec![builder_template()], "builder");

    let first = registrar.register_or_reuse(&template).await.unwrap();
    let second = registrar.register_or_reuse(&template).await.unwrap();
    assert_eq!(first.definition.id, second.definition.id);

    let bigger = effective(vec![builder_template().with_resources(2048, 4096)], "builder");
    let third = registrar.register_or_reuse(&bigger).await.unwrap();
    assert_eq!(third.definition.revision, first.definition.revision + 1);

    let mut relabeled = builder_template();
    relabeled.labels = Field::Set(["linux".to_string(), "docker".to_string()].into());
    let relabeled = effective(vec![relabeled.with_resources(2048, 4096)], "builder");
    let fourth = registrar.register_or_reuse(&relabeled).await.unwrap();
    assert!(fourth.reused, "labels are not part of the registration");
}

#[test]
fn test_merge_is_right_biased() {
    let parent = builder_template()
        .with_env("JAVA_OPTS", "-Xmx1g")
        .with_network_mode(NetworkMode::Vpc);
    let mut child = TaskTemplate::new("child").with_parent("builder");
    child.task_role = Field::Set("agent-role".into());
    child.environment = Field::Unset;

    assert_eq!(child.merge(None), child);

    let merged = child.merge(Some(&parent));
    assert_eq!(merged.name, "child");
    assert_eq!(merged.image, parent.image);
    assert_eq!(merged.network_mode, Field::Set(NetworkMode::Vpc));
    assert_eq!(merged.task_role, Field::Set("agent-role".into()));
    assert_eq!(merged.environment, Field::Unset);

    let resolved = effective(vec![parent, child], "child");
    assert!(resolved.environment.is_empty());
    assert_eq!(resolved.cpu, 1024);
}

// ============================================================================
// Launch
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_retryable_cause_is_bounded() {
    let h = launch_harness();
    let name = h.node().await;
    h.service.script_run(RunScript::Fail(DEFAULT_RETRYABLE_CAUSE.into()));
    h.service.script_run(RunScript::Fail(DEFAULT_RETRYABLE_CAUSE.into()));
    h.service.script_run(RunScript::Fail(DEFAULT_RETRYABLE_CAUSE.into()));

    let err = h
        .launcher
        .launch(&name, &h.template, Instant::now() + Duration::from_secs(60))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::AttemptsExceeded { attempts: 2, .. }));
    assert_eq!(h.service.stats().runs, 2);
    assert!(!h.registry.contains(&name).await);
}

#[tokio::test(start_paused = true)]
async fn test_non_retryable_cause_fails_once() {
    let h = launch_harness();
    let name = h.node().await;
    h.service.script_run(RunScript::Fail("RESOURCE:MEMORY".into()));

    let err = h
        .launcher
        .launch(&name, &h.template, Instant::now() + Duration::from_secs(60))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Placement(_)));
    assert_eq!(h.service.stats().runs, 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_with_retryable_reason_is_retried() {
    let h = launch_harness();
    let name = h.node().await;
    h.service
        .script_run(RunScript::StopBeforeRunning(DEFAULT_RETRYABLE_CAUSE.into()));
    spawn_agent_simulator(h.registry.clone(), h.connections.clone());

    h.launcher
        .launch(&name, &h.template, Instant::now() + Duration::from_secs(60))
        .await
        .unwrap();

    assert_eq!(h.service.stats().runs, 2);
    let node = h.registry.get(&name).await.unwrap();
    assert!(node.launched);
    assert!(node.is_idle());
}

#[tokio::test(start_paused = true)]
async fn test_stop_with_other_reason_is_fatal() {
    let h = launch_harness();
    let name = h.node().await;
    h.service
        .script_run(RunScript::StopBeforeRunning("Essential container exited".into()));

    let err = h
        .launcher
        .launch(&name, &h.template, Instant::now() + Duration::from_secs(60))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::TaskStopped(ref m) if m.contains("Essential container exited")));
    assert_eq!(h.service.stats().runs, 1);
}

// ============================================================================
// Retention
// ============================================================================

fn retention_for(h: &LaunchHarness) -> RetentionController {
    RetentionController::new(h.registry.clone(), h.service.clone(), h.launcher.terminator().clone())
}

async fn online_one_shot(h: &LaunchHarness, template: &EffectiveTemplate) -> AgentNode {
    let mut node = AgentNode::new("fleet", template, 5);
    node.state = NodeState::Idle;
    node.idle_since = Some(Utc::now());
    node.launched = true;
    node.tasks_completed = 1;
    h.registry.insert(node.clone()).await;
    node
}

#[tokio::test]
async fn test_retention_floor() {
    let h = launch_harness();
    let template = effective(
        vec![builder_template().with_retention(RetentionPolicy::OneShot, 2)],
        "builder",
    );
    let retention = retention_for(&h);

    let node = online_one_shot(&h, &template).await;
    online_one_shot(&h, &template).await;
    assert!(!retention.may_terminate_now(&node).await, "at the minimum");

    online_one_shot(&h, &template).await;
    assert!(retention.may_terminate_now(&node).await, "one above the minimum");
}

#[tokio::test]
async fn test_survivability_is_sticky() {
    let h = launch_harness();
    let retention = retention_for(&h);
    let name = h.node().await;

    let task = h
        .service
        .run_task(RunTaskRequest {
            cluster: "default".into(),
            definition_id: "fleet-builder:1".into(),
            launch_mode: LaunchMode::HostManaged,
            command: vec![],
            overrides: TaskOverrides::default(),
            started_by: name.clone(),
        })
        .await
        .unwrap()
        .task
        .unwrap();
    h.registry
        .update(&name, |node| {
            node.task = Some(RemoteTaskRef {
                task_id: task.task_id.clone(),
                cluster_id: "default".into(),
                definition_id: task.definition_id.clone(),
                host_id: None,
            })
        })
        .await;

    h.service
        .set_task_status(&task.task_id, TaskStatus::Stopped, TaskStatus::Stopped);
    assert!(!retention.check_survivable(&name).await);

    // the task looks healthy again, the node stays unsurvivable
    h.service
        .set_task_status(&task.task_id, TaskStatus::Running, TaskStatus::Running);
    let describes = h.service.stats().describes;
    for _ in 0..3 {
        assert!(!retention.check_survivable(&name).await);
    }
    assert_eq!(h.service.stats().describes, describes);
}

#[tokio::test]
async fn test_absent_task_is_unsurvivable() {
    let h = launch_harness();
    let retention = retention_for(&h);
    let name = h.node().await;
    h.registry
        .update(&name, |node| {
            node.task = Some(RemoteTaskRef {
                task_id: "task-missing".into(),
                cluster_id: "default".into(),
                definition_id: "fleet-builder:1".into(),
                host_id: None,
            })
        })
        .await;

    assert!(!retention.check_survivable(&name).await);
    assert!(!retention.check_survivable(&name).await);
    assert!(!h.registry.get(&name).await.unwrap().survivable);
}

// ============================================================================
// Pools
// ============================================================================

/// Registers an idle pool node per launch, like a real launch would
struct RegisteringProvisioner {
    registry: Arc<NodeRegistry>,
    template: EffectiveTemplate,
    launches: Mutex<u32>,
}

#[async_trait]
impl PoolProvisioner for RegisteringProvisioner {
    async fn launch_for_pool(&self, pool: &AgentPool) -> Result<String> {
        *self.launches.lock() += 1;
        let mut node = AgentNode::new("fleet", &self.template, 5).with_pool(pool.id.clone(), pool.max_idle_minutes);
        node.state = NodeState::Idle;
        node.launched = true;
        let name = node.name.clone();
        self.registry.insert(node).await;
        Ok(name)
    }
}

#[tokio::test]
async fn test_pool_launches_exactly_to_minimum() {
    let registry = Arc::new(NodeRegistry::new());
    let provisioner = Arc::new(RegisteringProvisioner {
        registry: registry.clone(),
        template: effective(vec![builder_template()], "builder"),
        launches: Mutex::new(0),
    });
    let maintainer = PoolMaintainer::new(registry.clone(), provisioner.clone()).with_pools([
        AgentPool::new("warm-linux", "builder")
            .with_labels(["linux"])
            .with_min_idle(2)
            .with_schedule("* * * * *"),
    ]);

    let report = maintainer.tick(Utc::now()).await;
    assert_eq!(report.launched, 2);
    assert_eq!(*provisioner.launches.lock(), 2);

    let report = maintainer.tick(Utc::now()).await;
    assert_eq!(report.launched, 0);
    assert_eq!(*provisioner.launches.lock(), 2);
    assert_eq!(registry.len().await, 2);
}

// ============================================================================
// Scale-in
// ============================================================================

#[tokio::test]
async fn test_scale_in_drains_near_billing_boundary() {
    let service = Arc::new(InMemoryTaskService::new());
    // 9h59m30s up: 30 seconds to the next billing hour
    service.add_host(host("edge", ChronoDuration::seconds(9 * 3600 + 59 * 60 + 30), 0));
    // 2h10m up: 50 minutes to the next billing hour
    service.add_host(host("early", ChronoDuration::minutes(130), 0));
    service.add_host(host("ancient", ChronoDuration::hours(12), 4));

    let scale_in = ClusterScaleIn::new(service.clone(), service.clone(), "default", "asg")
        .with_settings(ScaleInSettings {
            enabled: true,
            ..Default::default()
        });
    let report = scale_in.tick(Utc::now()).await.unwrap();

    assert_eq!(report.drained, vec!["ancient".to_string(), "edge".to_string()]);
    assert_eq!(service.host("early").unwrap().status, HostStatus::Active);
    assert_eq!(service.host("ancient").unwrap().running_tasks, 4);
}

// ============================================================================
// Provisioning strategy
// ============================================================================

struct CappedSource(usize);

#[async_trait]
impl ProvisioningSource for CappedSource {
    fn name(&self) -> &str {
        "capped"
    }

    fn can_serve(&self, label: &str) -> bool {
        label == "linux"
    }

    async fn provision(&self, label: &str, count: usize) -> Result<Vec<PlannedAgent>> {
        Ok((0..count.min(self.0))
            .map(|i| PlannedAgent::new(format!("capped-{}", i), "builder", label))
            .collect())
    }
}

#[derive(Default)]
struct StartedLog(Mutex<Vec<Vec<PlannedAgent>>>);

impl ProvisioningListener for StartedLog {
    fn on_started(&self, _source: &str, _label: &str, agents: &[PlannedAgent]) {
        self.0.lock().push(agents.to_vec());
    }
}

#[tokio::test]
async fn test_strategy_reports_remaining_demand() {
    let log = Arc::new(StartedLog::default());
    let strategy = ProvisioningStrategy::new()
        .with_source(Arc::new(CappedSource(3)))
        .with_listener(log.clone());

    let outcome = strategy.apply(&DemandSnapshot::new("linux", 5)).await;

    assert_eq!(outcome.remaining, 2);
    assert!(outcome.has_remaining());
    let calls = log.0.lock();
    assert_eq!(calls.len(), 1);
    let names: Vec<&str> = calls[0].iter().map(|a| a.name.as_str()).collect();
    assert_eq!(names, ["capped-0", "capped-1", "capped-2"]);
}

// ============================================================================
// Controller
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_controller_surfaces_placement_failure_to_listener() {
    let service = Arc::new(InMemoryTaskService::new());
    let log = Arc::new(StartedLog::default());
    let controller = Controller::builder(FleetConfig::default(), service.clone())
        .templates([builder_template()])
        .listener(log.clone())
        .build();
    service.script_run(RunScript::Fail("RESOURCE:MEMORY".into()));

    let snapshot = controller.snapshot_for("linux", 1).await;
    assert_eq!(controller.on_demand(&snapshot).await.started, 1);

    let ticket = {
        let calls = log.0.lock();
        calls[0][0].launch.clone().expect("controller attaches a launch ticket")
    };
    let err = ticket.outcome().await.unwrap_err();
    assert!(err.to_string().contains("RESOURCE:MEMORY"));
    assert!(matches!(ticket.status(), LaunchStatus::Failed(_)));
    assert!(controller.registry().is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn test_controller_restart_does_not_relaunch() {
    let dir = std::env::temp_dir().join(format!("fleet-restart-{}", uuid::Uuid::new_v4()));
    let service = Arc::new(InMemoryTaskService::new());

    let first = Arc::new(
        Controller::builder(FleetConfig::default(), service.clone())
            .store(Arc::new(RecordStore::new(&dir)))
            .templates([builder_template()])
            .build(),
    );
    spawn_agent_simulator(first.registry().clone(), first.connections().clone());

    let snapshot = first.snapshot_for("linux", 2).await;
    let outcome = first.on_demand(&snapshot).await;
    assert_eq!(outcome.started, 2);

    tokio::time::sleep(Duration::from_secs(10)).await;
    let nodes = first.registry().list().await;
    assert_eq!(nodes.len(), 2);
    assert!(nodes.iter().all(|n| n.launched && n.is_idle()));
    assert_eq!(service.stats().runs, 2);

    // one task vanishes while the controller is down
    let lost = nodes[0].clone();
    service.forget_task(&lost.task.as_ref().unwrap().task_id);
    first.shutdown().await;

    let second = Controller::builder(FleetConfig::default(), service.clone())
        .store(Arc::new(RecordStore::new(&dir)))
        .templates([builder_template()])
        .build();
    let report = second.start().await.unwrap();

    assert_eq!(report.loaded, 2);
    assert_eq!(report.restored, 1);
    assert_eq!(report.destroyed, vec![lost.name.clone()]);
    assert_eq!(service.stats().runs, 2);

    let survivor = second.registry().list().await.remove(0);
    second
        .on_agent_connected(&survivor.name, &survivor.secret)
        .unwrap();
    second.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_demand_loop_stops_on_shutdown() {
    let service = Arc::new(InMemoryTaskService::new());
    let controller = Arc::new(
        Controller::builder(FleetConfig::default(), service.clone())
            .templates([builder_template()])
            .build(),
    );
    let (tx, rx) = tokio::sync::mpsc::channel(8);
    let handle = controller.spawn_demand_loop(rx);

    tx.send(DemandSnapshot::new("linux", 1)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(controller.registry().len().await, 1);

    controller.shutdown().await;
    handle.await.unwrap();
}
