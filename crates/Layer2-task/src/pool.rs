//! Warm agent pools
//!
//! A pool keeps a minimum number of idle agents around while its schedule is
//! active. The maintainer reconciles every pool once per tick.

use crate::node::NodeRegistry;
use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use cron::Schedule;
use fleet_foundation::{PoolSettings, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Warm pool configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentPool {
    pub id: String,
    pub labels: BTreeSet<String>,
    /// Template the pool launches
    pub template: String,
    #[serde(default)]
    pub min_idle_agents: u32,
    /// Cron schedule, one expression per line; absent means always active
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default = "default_max_idle_minutes")]
    pub max_idle_minutes: u32,
    #[serde(default)]
    pub description: String,
}

fn default_max_idle_minutes() -> u32 {
    30
}

impl AgentPool {
    pub fn new(id: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            labels: BTreeSet::new(),
            template: template.into(),
            min_idle_agents: 0,
            schedule: None,
            max_idle_minutes: default_max_idle_minutes(),
            description: String::new(),
        }
    }

    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_min_idle(mut self, count: u32) -> Self {
        self.min_idle_agents = count;
        self
    }

    pub fn with_schedule(mut self, schedule: impl Into<String>) -> Self {
        self.schedule = Some(schedule.into());
        self
    }

    pub fn with_max_idle_minutes(mut self, minutes: u32) -> Self {
        self.max_idle_minutes = minutes;
        self
    }

    /// Whether the schedule covers the minute containing `now`.
    ///
    /// Five-field expressions get a seconds field prepended. A schedule that
    /// does not parse counts as always active.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        let Some(schedule) = self.schedule.as_deref() else {
            return true;
        };

        let lines: Vec<&str> = schedule
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .collect();
        if lines.is_empty() {
            return true;
        }

        let minute = now
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(now);

        let mut active = false;
        for line in lines {
            match parse_schedule(line) {
                Ok(parsed) => active |= parsed.includes(minute),
                Err(e) => {
                    warn!("Pool {} has an invalid schedule '{}': {}", self.id, line, e);
                    return true;
                }
            }
        }
        active
    }
}

fn parse_schedule(expr: &str) -> std::result::Result<Schedule, cron::error::Error> {
    if expr.split_whitespace().count() == 5 {
        Schedule::from_str(&format!("0 {}", expr))
    } else {
        Schedule::from_str(expr)
    }
}

/// Launches one pool agent and waits for it to come online
#[async_trait]
pub trait PoolProvisioner: Send + Sync {
    /// Returns the new node's name
    async fn launch_for_pool(&self, pool: &AgentPool) -> Result<String>;
}

/// Outcome of one maintainer tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolTickReport {
    pub launched: usize,
    pub skipped: usize,
    pub failed_pools: Vec<String>,
}

pub struct PoolMaintainer {
    pools: RwLock<Vec<AgentPool>>,
    registry: Arc<NodeRegistry>,
    provisioner: Arc<dyn PoolProvisioner>,
    settings: PoolSettings,
    cancel: CancellationToken,
}

impl PoolMaintainer {
    pub fn new(registry: Arc<NodeRegistry>, provisioner: Arc<dyn PoolProvisioner>) -> Self {
        Self {
            pools: RwLock::new(Vec::new()),
            registry,
            provisioner,
            settings: PoolSettings::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_settings(mut self, settings: PoolSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_pools(self, pools: impl IntoIterator<Item = AgentPool>) -> Self {
        self.pools.write().extend(pools);
        self
    }

    /// Add or replace a pool by id
    pub fn upsert_pool(&self, pool: AgentPool) {
        let mut pools = self.pools.write();
        match pools.iter_mut().find(|p| p.id == pool.id) {
            Some(existing) => *existing = pool,
            None => pools.push(pool),
        }
    }

    pub fn remove_pool(&self, id: &str) -> bool {
        let mut pools = self.pools.write();
        let before = pools.len();
        pools.retain(|p| p.id != id);
        pools.len() != before
    }

    pub fn pools(&self) -> Vec<AgentPool> {
        self.pools.read().clone()
    }

    /// Reconcile every pool once
    pub async fn tick(&self, now: DateTime<Utc>) -> PoolTickReport {
        let mut report = PoolTickReport::default();

        for pool in self.pools() {
            if pool.min_idle_agents == 0 || !pool.is_active_at(now) {
                debug!("Pool {} inactive this tick", pool.id);
                report.skipped += 1;
                continue;
            }

            let mut idle = self.registry.count_idle_in_pool(&pool.id, &pool.labels).await;
            let target = pool.min_idle_agents as usize;

            while idle < target {
                match self.provisioner.launch_for_pool(&pool).await {
                    Ok(name) => {
                        info!(
                            "Pool {} launched {} ({}/{} idle)",
                            pool.id,
                            name,
                            idle + 1,
                            target
                        );
                        idle += 1;
                        report.launched += 1;
                    }
                    Err(e) if e.is_launch_failure() => {
                        warn!("Pool {} launch failed, retrying next tick: {}", pool.id, e);
                        report.failed_pools.push(pool.id.clone());
                        break;
                    }
                    Err(e) => {
                        error!("Pool {} could not launch: {}", pool.id, e);
                        report.failed_pools.push(pool.id.clone());
                        break;
                    }
                }
            }
        }

        report
    }

    /// 주기적 pool 유지 시작 (백그라운드 태스크)
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.settings.tick_interval());
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        debug!("Pool maintainer stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        self.tick(Utc::now()).await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use fleet_foundation::Error;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct CountingProvisioner {
        launched: Mutex<Vec<String>>,
        fail_after: Option<usize>,
    }

    #[async_trait]
    impl PoolProvisioner for CountingProvisioner {
        async fn launch_for_pool(&self, pool: &AgentPool) -> Result<String> {
            let mut launched = self.launched.lock();
            if self.fail_after.is_some_and(|limit| launched.len() >= limit) {
                return Err(Error::Placement("RESOURCE:MEMORY".into()));
            }
            let name = format!("{}-{}", pool.id, launched.len());
            launched.push(name.clone());
            Ok(name)
        }
    }

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        // 2026-10-19 is a Monday
        Utc.with_ymd_and_hms(2026, 10, 19, hour, minute, 42).unwrap()
    }

    #[test]
    fn test_schedule_evaluation() {
        let pool = AgentPool::new("warm", "builder");
        assert!(pool.is_active_at(at(3, 0)));

        let office = pool.clone().with_schedule("* 9-17 * * Mon-Fri");
        assert!(office.is_active_at(at(10, 15)));
        assert!(!office.is_active_at(at(20, 0)));

        let split = pool.clone().with_schedule("* 1 * * *\n* 22 * * *");
        assert!(split.is_active_at(at(22, 5)));
        assert!(!split.is_active_at(at(12, 0)));
    }

    #[test]
    fn test_malformed_schedule_fails_open() {
        let pool = AgentPool::new("warm", "builder").with_schedule("every day at noon");
        assert!(pool.is_active_at(at(3, 0)));
    }

    #[tokio::test]
    async fn test_tick_launches_up_to_minimum() {
        let provisioner = Arc::new(CountingProvisioner::default());
        let maintainer = PoolMaintainer::new(Arc::new(NodeRegistry::new()), provisioner.clone())
            .with_pools([AgentPool::new("warm", "builder").with_min_idle(2)]);

        let report = maintainer.tick(at(10, 0)).await;

        assert_eq!(report.launched, 2);
        assert_eq!(provisioner.launched.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_failure_stops_pool_for_this_tick() {
        let provisioner = Arc::new(CountingProvisioner {
            fail_after: Some(1),
            ..Default::default()
        });
        let maintainer = PoolMaintainer::new(Arc::new(NodeRegistry::new()), provisioner.clone())
            .with_pools([AgentPool::new("warm", "builder").with_min_idle(5)]);

        let report = maintainer.tick(at(10, 0)).await;

        assert_eq!(report.launched, 1);
        assert_eq!(report.failed_pools, vec!["warm".to_string()]);
    }

    #[tokio::test]
    async fn test_inactive_pool_is_skipped() {
        let provisioner = Arc::new(CountingProvisioner::default());
        let maintainer = PoolMaintainer::new(Arc::new(NodeRegistry::new()), provisioner.clone())
            .with_pools([
                AgentPool::new("night", "builder")
                    .with_min_idle(2)
                    .with_schedule("* 0-5 * * *"),
                AgentPool::new("off", "builder"),
            ]);

        let report = maintainer.tick(at(10, 0)).await;

        assert_eq!(report.launched, 0);
        assert_eq!(report.skipped, 2);
    }
}
