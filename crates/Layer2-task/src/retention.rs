//! Retention controller
//!
//! Decides, per idle node, whether it may be terminated now, and tracks
//! survivability of the remote task behind each node.
//!
//! ## 정책
//!
//! - `Persistent`: idle timeout 초과 시 종료
//! - `OneShot`: 작업 하나를 끝내면 종료. 단, 노드가 서비스하는 모든 label의
//!   online 노드 수가 `min_retained` 이하이면 종료하지 않고 잠시 후 재확인

use crate::node::{AgentNode, NodeRegistry};
use crate::remote::RemoteTaskService;
use crate::template::RetentionPolicy;
use crate::terminate::NodeTerminator;
use chrono::{DateTime, Utc};
use fleet_foundation::RetentionSettings;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct RetentionController {
    registry: Arc<NodeRegistry>,
    service: Arc<dyn RemoteTaskService>,
    terminator: NodeTerminator,
    settings: RetentionSettings,
    cancel: CancellationToken,
    /// Nodes with a recheck already scheduled
    rechecks: Mutex<HashSet<String>>,
}

impl RetentionController {
    pub fn new(
        registry: Arc<NodeRegistry>,
        service: Arc<dyn RemoteTaskService>,
        terminator: NodeTerminator,
    ) -> Self {
        Self {
            registry,
            service,
            terminator,
            settings: RetentionSettings::default(),
            cancel: CancellationToken::new(),
            rechecks: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_settings(mut self, settings: RetentionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    // ========================================================================
    // Termination decision
    // ========================================================================

    pub async fn may_terminate_now(&self, node: &AgentNode) -> bool {
        self.may_terminate_at(node, Utc::now()).await
    }

    pub async fn may_terminate_at(&self, node: &AgentNode, now: DateTime<Utc>) -> bool {
        // only an idle node is ever a candidate
        if !node.is_idle() {
            return false;
        }
        match node.retention {
            RetentionPolicy::OneShot => {
                if self.at_retention_floor(node).await {
                    debug!(
                        "Keeping node {}: its labels are at the retained minimum {}",
                        node.name, node.min_retained
                    );
                    return false;
                }
                node.tasks_completed > 0 || idle_expired(node, now)
            }
            RetentionPolicy::Persistent => idle_expired(node, now),
        }
    }

    /// Every label the node serves has at most `min_retained` online members
    async fn at_retention_floor(&self, node: &AgentNode) -> bool {
        if node.labels.is_empty() {
            return false;
        }
        for label in &node.labels {
            let online = self.registry.count_online_serving(label).await;
            if online > node.min_retained as usize {
                return false;
            }
        }
        true
    }

    // ========================================================================
    // Triggers
    // ========================================================================

    /// A unit of work finished on `name`
    pub async fn on_task_completed(self: &Arc<Self>, name: &str) {
        let now = Utc::now();
        let Some(node) = self
            .registry
            .update(name, |node| {
                node.tasks_completed += 1;
                node.mark_idle(now);
                node.clone()
            })
            .await
        else {
            return;
        };

        self.evaluate(&node, now).await;
    }

    async fn evaluate(self: &Arc<Self>, node: &AgentNode, now: DateTime<Utc>) -> bool {
        if self.may_terminate_at(node, now).await {
            // the node may have gone busy since the snapshot was taken
            return self
                .terminator
                .destroy_idle(&node.name, "retention: idle or work complete")
                .await;
        }
        if node.is_idle() && node.retention == RetentionPolicy::OneShot && node.tasks_completed > 0 {
            self.schedule_recheck(&node.name);
        }
        false
    }

    /// Re-evaluate `name` after the recheck delay
    pub fn schedule_recheck(self: &Arc<Self>, name: &str) {
        if !self.rechecks.lock().insert(name.to_string()) {
            return;
        }

        let this = self.clone();
        let name = name.to_string();
        let delay = self.settings.recheck_delay();
        tokio::spawn(async move {
            tokio::select! {
                _ = this.cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    this.rechecks.lock().remove(&name);
                    match this.registry.get(&name).await {
                        Some(node) if node.is_idle() => {
                            this.evaluate(&node, Utc::now()).await;
                        }
                        Some(node) => {
                            debug!("Dropping recheck of {}: node is {}", name, node.state.display_name());
                        }
                        None => {}
                    }
                }
            }
        });
    }

    pub fn has_pending_recheck(&self, name: &str) -> bool {
        self.rechecks.lock().contains(name)
    }

    /// Periodic pass over idle nodes; returns how many were terminated
    pub async fn tick(self: &Arc<Self>, now: DateTime<Utc>) -> usize {
        let mut terminated = 0;
        for node in self.registry.list().await {
            if !node.is_idle() {
                continue;
            }
            if self.evaluate(&node, now).await {
                terminated += 1;
            }
        }
        if terminated > 0 {
            info!("Retention tick terminated {} node(s)", terminated);
        }
        terminated
    }

    /// 주기적 retention 검사 시작 (백그라운드 태스크)
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.settings.tick_interval());
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        debug!("Retention loop stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        self.tick(Utc::now()).await;
                    }
                }
            }
        })
    }

    // ========================================================================
    // Survivability
    // ========================================================================

    /// Whether the node's task can still recover. Once false, stays false.
    pub async fn check_survivable(&self, name: &str) -> bool {
        let Some(node) = self.registry.get(name).await else {
            return false;
        };
        if !node.survivable {
            return false;
        }
        let Some(task) = node.task else {
            return true;
        };

        let lost = match self.service.describe_task(&task.cluster_id, &task.task_id).await {
            Ok(None) => {
                warn!("Task {} of node {} no longer exists", task.task_id, name);
                true
            }
            Ok(Some(current)) => {
                let down = current.last_status.is_down() && !current.desired_status.is_up();
                if down {
                    warn!(
                        "Task {} of node {} is {} (desired {})",
                        task.task_id, name, current.last_status, current.desired_status
                    );
                }
                down
            }
            // transient describe failures say nothing about the task
            Err(e) if e.is_retryable() => {
                debug!("Could not describe task {} of node {}: {}", task.task_id, name, e);
                return true;
            }
            Err(e) => {
                warn!("Describe of task {} for node {} failed: {}", task.task_id, name, e);
                return false;
            }
        };

        if lost {
            self.registry.update(name, |node| node.mark_unsurvivable()).await;
            return false;
        }
        true
    }

    /// The connection layer lost `name`. Returns whether the node was destroyed.
    pub async fn on_disconnected(&self, name: &str) -> bool {
        if self.check_survivable(name).await {
            info!("Node {} disconnected, waiting for it to reconnect", name);
            return false;
        }
        self.terminator
            .destroy(name, "task lost after disconnect")
            .await
    }
}

fn idle_expired(node: &AgentNode, now: DateTime<Utc>) -> bool {
    node.idle_for(now)
        .map(|idle| idle >= node.idle_timeout())
        .unwrap_or(false)
}
