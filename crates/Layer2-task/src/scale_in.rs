//! Host fleet scale-in
//!
//! Runs against one cluster and the host group that backs it. Each tick:
//!
//! 1. drained hosts with no tasks left are unprotected and terminated
//! 2. active hosts are drained when they have run too long, or when they are
//!    idle and close to the next billing boundary
//!
//! Draining only stops new placements; running tasks are left alone.

use crate::remote::{hosts_with_status, HostInstance, HostStatus, RemoteTaskService};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_foundation::{Result, ScaleInSettings};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// The machine group underneath a cluster
#[async_trait]
pub trait HostGroup: Send + Sync {
    /// Protect newly launched instances from the group's own scale-in
    async fn protect_new_instances(&self, group: &str) -> Result<()>;

    async fn set_instance_protection(
        &self,
        group: &str,
        instance_ids: &[String],
        protected: bool,
    ) -> Result<()>;

    async fn terminate_instance(&self, instance_id: &str, decrement_desired: bool) -> Result<()>;
}

/// What to do with one active host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScaleInDecision {
    Keep,
    /// Up longer than the maximum uptime
    DrainLongRunning,
    /// Idle and about to start another billing period
    DrainNearBillingBoundary,
}

impl ScaleInDecision {
    pub fn drains(&self) -> bool {
        !matches!(self, Self::Keep)
    }
}

/// Time left until the host starts its next billing period
pub fn until_billing_boundary(uptime: Duration, period: Duration) -> Duration {
    let period_secs = period.as_secs().max(1);
    Duration::from_secs(period_secs - uptime.as_secs() % period_secs)
}

/// Decide for one active host
pub fn decide(host: &HostInstance, now: DateTime<Utc>, settings: &ScaleInSettings) -> ScaleInDecision {
    let uptime = host.uptime(now);
    if uptime > settings.max_uptime() {
        return ScaleInDecision::DrainLongRunning;
    }
    if host.is_idle()
        && until_billing_boundary(uptime, settings.billing_period()) <= settings.billing_window()
    {
        return ScaleInDecision::DrainNearBillingBoundary;
    }
    ScaleInDecision::Keep
}

/// Outcome of one tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScaleInReport {
    pub terminated: Vec<String>,
    pub drained: Vec<String>,
}

pub struct ClusterScaleIn {
    service: Arc<dyn RemoteTaskService>,
    group: Arc<dyn HostGroup>,
    cluster: String,
    group_name: String,
    settings: ScaleInSettings,
}

impl ClusterScaleIn {
    pub fn new(
        service: Arc<dyn RemoteTaskService>,
        group: Arc<dyn HostGroup>,
        cluster: impl Into<String>,
        group_name: impl Into<String>,
    ) -> Self {
        Self {
            service,
            group,
            cluster: cluster.into(),
            group_name: group_name.into(),
            settings: ScaleInSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: ScaleInSettings) -> Self {
        self.settings = settings;
        self
    }

    pub async fn prepare(&self) -> Result<()> {
        self.group.protect_new_instances(&self.group_name).await?;
        info!(
            "Scale-in for cluster {} protecting new instances in {}",
            self.cluster, self.group_name
        );
        Ok(())
    }

    pub async fn tick(&self, now: DateTime<Utc>) -> Result<ScaleInReport> {
        let mut report = ScaleInReport::default();

        for host in hosts_with_status(self.service.as_ref(), &self.cluster, HostStatus::Draining).await? {
            if !host.is_idle() {
                debug!(
                    "Host {} still draining {} task(s)",
                    host.id,
                    host.task_count()
                );
                continue;
            }
            match self.terminate(&host).await {
                Ok(()) => report.terminated.push(host.id.clone()),
                Err(e) => warn!("Failed to terminate host {}: {}", host.id, e),
            }
        }

        for host in hosts_with_status(self.service.as_ref(), &self.cluster, HostStatus::Active).await? {
            let decision = decide(&host, now, &self.settings);
            if !decision.drains() {
                continue;
            }
            match self.service.set_host_draining(&self.cluster, &host.id).await {
                Ok(()) => {
                    info!("Draining host {} ({:?})", host.id, decision);
                    report.drained.push(host.id.clone());
                }
                Err(e) => warn!("Failed to drain host {}: {}", host.id, e),
            }
        }

        Ok(report)
    }

    async fn terminate(&self, host: &HostInstance) -> Result<()> {
        let ids = [host.instance_id.clone()];
        self.group
            .set_instance_protection(&self.group_name, &ids, false)
            .await?;
        self.group.terminate_instance(&host.instance_id, true).await?;
        info!("Terminated drained host {} ({})", host.id, host.instance_id);
        Ok(())
    }

    /// Run until `cancel` fires. Tick errors are logged and retried next tick.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.prepare().await {
                error!("Failed to protect new instances in {}: {}", self.group_name, e);
            }

            let mut interval = tokio::time::interval(self.settings.tick_interval());
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Scale-in for cluster {} stopped", self.cluster);
                        break;
                    }
                    _ = interval.tick() => {
                        if let Err(e) = self.tick(Utc::now()).await {
                            error!("Scale-in tick for cluster {} failed: {}", self.cluster, e);
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::InMemoryTaskService;

    fn host(id: &str, status: HostStatus, uptime: chrono::Duration, tasks: u32, now: DateTime<Utc>) -> HostInstance {
        HostInstance {
            id: id.into(),
            instance_id: format!("i-{}", id),
            status,
            pending_tasks: 0,
            running_tasks: tasks,
            launched_at: now - uptime,
        }
    }

    #[test]
    fn test_billing_boundary() {
        let hour = Duration::from_secs(3600);
        assert_eq!(until_billing_boundary(Duration::from_secs(3570), hour), Duration::from_secs(30));
        assert_eq!(until_billing_boundary(Duration::from_secs(0), hour), hour);
    }

    #[test]
    fn test_decisions() {
        let now = Utc::now();
        let settings = ScaleInSettings::default();

        let long = host("a", HostStatus::Active, chrono::Duration::hours(11), 3, now);
        assert_eq!(decide(&long, now, &settings), ScaleInDecision::DrainLongRunning);

        let busy_near = host("b", HostStatus::Active, chrono::Duration::seconds(3570), 1, now);
        assert_eq!(decide(&busy_near, now, &settings), ScaleInDecision::Keep);

        let edge = host("c", HostStatus::Active, chrono::Duration::seconds(3600 - 240), 0, now);
        assert_eq!(decide(&edge, now, &settings), ScaleInDecision::DrainNearBillingBoundary);
    }

    #[tokio::test]
    async fn test_tick_terminates_idle_drained_hosts() {
        let now = Utc::now();
        let service = Arc::new(InMemoryTaskService::new());
        service.add_host(host("done", HostStatus::Draining, chrono::Duration::hours(3), 0, now));
        service.add_host(host("busy", HostStatus::Draining, chrono::Duration::hours(3), 2, now));

        let scale_in = ClusterScaleIn::new(service.clone(), service.clone(), "default", "asg");
        scale_in.prepare().await.unwrap();
        let report = scale_in.tick(now).await.unwrap();

        assert_eq!(report.terminated, vec!["done".to_string()]);
        assert_eq!(service.terminated_instances(), vec!["i-done".to_string()]);
        assert_eq!(service.desired_hosts(), 1);
        assert!(service.host("busy").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_exits_on_cancel() {
        let service = Arc::new(InMemoryTaskService::new());
        let scale_in = Arc::new(ClusterScaleIn::new(service.clone(), service.clone(), "default", "asg"));
        let cancel = CancellationToken::new();

        let handle = scale_in.start(cancel.clone());
        tokio::time::sleep(Duration::from_secs(150)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert!(service.new_instances_protected());
        assert!(service.stats().list_host_pages >= 3);
    }
}
