//! In-memory orchestration service
//!
//! Scriptable stand-in for the remote API, used by tests and by the CLI
//! `simulate` command. Tasks start `Pending` and become `Running` after a
//! configurable number of describes; run outcomes can be scripted per call.

use super::{
    DefinitionSpec, HostInstance, HostPage, HostStatus, PlacementFailure, RemoteTask,
    RemoteTaskService, RunTaskOutput, RunTaskRequest, TaskDefinition, TaskStatus,
};
use crate::scale_in::HostGroup;
use async_trait::async_trait;
use fleet_foundation::{Error, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use tracing::debug;

/// Scripted outcome for the next `run_task` call
#[derive(Debug, Clone)]
pub enum RunScript {
    /// Service reports a placement failure with this reason
    Fail(String),
    /// Call itself errors (transient service error)
    Error(String),
    /// Task starts, then stops with this reason on first describe
    StopBeforeRunning(String),
    /// Task stays pending forever
    NeverStart,
}

/// Call counters
#[derive(Debug, Clone, Default)]
pub struct ServiceStats {
    pub registrations: u32,
    pub deregistrations: u32,
    pub runs: u32,
    pub describes: u32,
    pub stops: u32,
    pub list_host_pages: u32,
    pub drained_hosts: Vec<String>,
}

#[derive(Debug)]
struct MemoryTask {
    task: RemoteTask,
    polls_until_running: u32,
    stop_reason_on_describe: Option<String>,
}

#[derive(Debug, Default)]
struct MemoryState {
    definitions: BTreeMap<String, Vec<TaskDefinition>>,
    tasks: HashMap<String, MemoryTask>,
    hosts: BTreeMap<String, HostInstance>,
    run_script: VecDeque<RunScript>,
    next_task: u64,
    stats: ServiceStats,
    new_instances_protected: bool,
    protected_instances: BTreeSet<String>,
    terminated_instances: Vec<String>,
    desired_hosts: u32,
}

/// In-memory [`RemoteTaskService`] and [`HostGroup`]
#[derive(Debug)]
pub struct InMemoryTaskService {
    state: Mutex<MemoryState>,
    page_size: usize,
    polls_until_running: u32,
}

impl Default for InMemoryTaskService {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTaskService {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            page_size: 100,
            polls_until_running: 1,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Number of describes before a new task reports `Running`
    pub fn with_start_delay(mut self, polls: u32) -> Self {
        self.polls_until_running = polls;
        self
    }

    /// Queue an outcome for the next `run_task`
    pub fn script_run(&self, script: RunScript) {
        self.state.lock().run_script.push_back(script);
    }

    pub fn add_host(&self, host: HostInstance) {
        let mut state = self.state.lock();
        state.desired_hosts += 1;
        state.hosts.insert(host.id.clone(), host);
    }

    pub fn host(&self, id: &str) -> Option<HostInstance> {
        self.state.lock().hosts.get(id).cloned()
    }

    pub fn task(&self, task_id: &str) -> Option<RemoteTask> {
        self.state.lock().tasks.get(task_id).map(|t| t.task.clone())
    }

    pub fn tasks(&self) -> Vec<RemoteTask> {
        self.state
            .lock()
            .tasks
            .values()
            .map(|t| t.task.clone())
            .collect()
    }

    pub fn set_task_status(&self, task_id: &str, last: TaskStatus, desired: TaskStatus) {
        if let Some(task) = self.state.lock().tasks.get_mut(task_id) {
            task.task.last_status = last;
            task.task.desired_status = desired;
        }
    }

    /// Drop a task so later describes return nothing
    pub fn forget_task(&self, task_id: &str) {
        self.state.lock().tasks.remove(task_id);
    }

    pub fn stats(&self) -> ServiceStats {
        self.state.lock().stats.clone()
    }

    pub fn definitions(&self, family: &str) -> Vec<TaskDefinition> {
        self.state
            .lock()
            .definitions
            .get(family)
            .cloned()
            .unwrap_or_default()
    }

    pub fn new_instances_protected(&self) -> bool {
        self.state.lock().new_instances_protected
    }

    pub fn protected_instances(&self) -> BTreeSet<String> {
        self.state.lock().protected_instances.clone()
    }

    pub fn terminated_instances(&self) -> Vec<String> {
        self.state.lock().terminated_instances.clone()
    }

    pub fn desired_hosts(&self) -> u32 {
        self.state.lock().desired_hosts
    }
}

#[async_trait]
impl RemoteTaskService for InMemoryTaskService {
    async fn latest_definition(&self, family: &str) -> Result<Option<TaskDefinition>> {
        let state = self.state.lock();
        Ok(state
            .definitions
            .get(family)
            .and_then(|revisions| revisions.last())
            .cloned())
    }

    async fn register_definition(&self, spec: DefinitionSpec) -> Result<TaskDefinition> {
        let mut state = self.state.lock();
        state.stats.registrations += 1;

        let revisions = state.definitions.entry(spec.family.clone()).or_default();
        let revision = revisions.last().map(|d| d.revision + 1).unwrap_or(1);
        let definition = TaskDefinition {
            id: format!("{}:{}", spec.family, revision),
            family: spec.family.clone(),
            revision,
            spec,
        };
        revisions.push(definition.clone());
        debug!("Registered definition {}", definition.id);
        Ok(definition)
    }

    async fn deregister_definition(&self, definition_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.stats.deregistrations += 1;
        for revisions in state.definitions.values_mut() {
            revisions.retain(|d| d.id != definition_id);
        }
        Ok(())
    }

    async fn run_task(&self, request: RunTaskRequest) -> Result<RunTaskOutput> {
        let mut state = self.state.lock();
        state.stats.runs += 1;

        let script = state.run_script.pop_front();
        let mut polls_until_running = self.polls_until_running;
        let mut stop_reason_on_describe = None;

        match script {
            Some(RunScript::Fail(reason)) => {
                return Ok(RunTaskOutput {
                    task: None,
                    failures: vec![PlacementFailure {
                        reason,
                        detail: None,
                    }],
                });
            }
            Some(RunScript::Error(message)) => return Err(Error::remote("runTask", message)),
            Some(RunScript::StopBeforeRunning(reason)) => stop_reason_on_describe = Some(reason),
            Some(RunScript::NeverStart) => polls_until_running = u32::MAX,
            None => {}
        }

        state.next_task += 1;
        let task = RemoteTask {
            task_id: format!("task-{:04}", state.next_task),
            cluster: request.cluster.clone(),
            definition_id: request.definition_id.clone(),
            host_id: state.hosts.keys().next().cloned(),
            last_status: TaskStatus::Pending,
            desired_status: TaskStatus::Running,
            stopped_reason: None,
        };
        state.tasks.insert(
            task.task_id.clone(),
            MemoryTask {
                task: task.clone(),
                polls_until_running,
                stop_reason_on_describe,
            },
        );

        Ok(RunTaskOutput {
            task: Some(task),
            failures: Vec::new(),
        })
    }

    async fn describe_task(&self, _cluster: &str, task_id: &str) -> Result<Option<RemoteTask>> {
        let mut state = self.state.lock();
        state.stats.describes += 1;

        let Some(entry) = state.tasks.get_mut(task_id) else {
            return Ok(None);
        };

        if let Some(reason) = entry.stop_reason_on_describe.take() {
            entry.task.last_status = TaskStatus::Stopped;
            entry.task.desired_status = TaskStatus::Stopped;
            entry.task.stopped_reason = Some(reason);
        } else if entry.task.last_status == TaskStatus::Pending {
            if entry.polls_until_running == 0 {
                entry.task.last_status = TaskStatus::Running;
            } else if entry.polls_until_running != u32::MAX {
                entry.polls_until_running -= 1;
                if entry.polls_until_running == 0 {
                    entry.task.last_status = TaskStatus::Running;
                }
            }
        }

        Ok(Some(entry.task.clone()))
    }

    async fn stop_task(&self, _cluster: &str, task_id: &str, reason: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.stats.stops += 1;
        if let Some(entry) = state.tasks.get_mut(task_id) {
            entry.task.last_status = TaskStatus::Stopped;
            entry.task.desired_status = TaskStatus::Stopped;
            entry.task.stopped_reason = Some(reason.to_string());
        }
        Ok(())
    }

    async fn list_hosts_page(
        &self,
        _cluster: &str,
        status: Option<HostStatus>,
        next_token: Option<String>,
    ) -> Result<HostPage> {
        let mut state = self.state.lock();
        state.stats.list_host_pages += 1;

        let offset = match next_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| Error::remote("listHosts", format!("invalid token {}", token)))?,
            None => 0,
        };

        let matching: Vec<String> = state
            .hosts
            .values()
            .filter(|h| status.map_or(true, |s| h.status == s))
            .map(|h| h.id.clone())
            .collect();

        let end = (offset + self.page_size).min(matching.len());
        let ids = matching.get(offset..end).map(<[String]>::to_vec).unwrap_or_default();
        let next_token = (end < matching.len()).then(|| end.to_string());

        Ok(HostPage { ids, next_token })
    }

    async fn describe_hosts(&self, _cluster: &str, ids: &[String]) -> Result<Vec<HostInstance>> {
        let state = self.state.lock();
        Ok(ids
            .iter()
            .filter_map(|id| state.hosts.get(id).cloned())
            .collect())
    }

    async fn set_host_draining(&self, _cluster: &str, host_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        let host = state
            .hosts
            .get_mut(host_id)
            .ok_or_else(|| Error::NotFound(format!("Host {}", host_id)))?;
        host.status = HostStatus::Draining;
        state.stats.drained_hosts.push(host_id.to_string());
        Ok(())
    }
}

#[async_trait]
impl HostGroup for InMemoryTaskService {
    async fn protect_new_instances(&self, _group: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.new_instances_protected = true;
        let instances: Vec<String> = state.hosts.values().map(|h| h.instance_id.clone()).collect();
        state.protected_instances.extend(instances);
        Ok(())
    }

    async fn set_instance_protection(
        &self,
        _group: &str,
        instance_ids: &[String],
        protected: bool,
    ) -> Result<()> {
        let mut state = self.state.lock();
        for id in instance_ids {
            if protected {
                state.protected_instances.insert(id.clone());
            } else {
                state.protected_instances.remove(id);
            }
        }
        Ok(())
    }

    async fn terminate_instance(&self, instance_id: &str, decrement_desired: bool) -> Result<()> {
        let mut state = self.state.lock();
        if state.protected_instances.contains(instance_id) {
            return Err(Error::remote(
                "terminateInstance",
                format!("instance {} is protected from scale in", instance_id),
            ));
        }
        state.hosts.retain(|_, h| h.instance_id != instance_id);
        state.terminated_instances.push(instance_id.to_string());
        if decrement_desired {
            state.desired_hosts = state.desired_hosts.saturating_sub(1);
        }
        Ok(())
    }
}
