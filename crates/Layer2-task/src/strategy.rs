//! Provisioning strategy
//!
//! Turns a demand snapshot into launches. The latest snapshot is used as-is,
//! with no smoothing: `excess = queue - available - connecting`, handed to
//! each capable source in registration order until nothing is left.

use crate::launcher::LaunchTicket;
use async_trait::async_trait;
use fleet_foundation::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Demand for one label at one instant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DemandSnapshot {
    pub label: String,
    pub queue_length: i64,
    pub available: i64,
    pub connecting: i64,
}

impl DemandSnapshot {
    pub fn new(label: impl Into<String>, queue_length: i64) -> Self {
        Self {
            label: label.into(),
            queue_length,
            available: 0,
            connecting: 0,
        }
    }

    pub fn with_available(mut self, available: i64) -> Self {
        self.available = available;
        self
    }

    pub fn with_connecting(mut self, connecting: i64) -> Self {
        self.connecting = connecting;
        self
    }

    pub fn excess(&self) -> i64 {
        self.queue_length - self.available - self.connecting
    }
}

/// An agent a source has started provisioning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedAgent {
    pub name: String,
    pub template: String,
    pub label: String,
    /// Background launch, when the source tracks one
    #[serde(skip)]
    pub launch: Option<LaunchTicket>,
}

impl PlannedAgent {
    pub fn new(name: impl Into<String>, template: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            template: template.into(),
            label: label.into(),
            launch: None,
        }
    }

    pub fn with_launch(mut self, ticket: LaunchTicket) -> Self {
        self.launch = Some(ticket);
        self
    }
}

/// Something that can start agents for a label
#[async_trait]
pub trait ProvisioningSource: Send + Sync {
    fn name(&self) -> &str;

    fn can_serve(&self, label: &str) -> bool;

    /// Start up to `count` agents; returns the ones actually started
    async fn provision(&self, label: &str, count: usize) -> Result<Vec<PlannedAgent>>;
}

/// Notified whenever a source starts agents
pub trait ProvisioningListener: Send + Sync {
    fn on_started(&self, source: &str, label: &str, agents: &[PlannedAgent]);
}

/// Result of one `apply`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategyOutcome {
    /// Demand left unsatisfied
    pub remaining: i64,
    pub started: usize,
}

impl StrategyOutcome {
    pub fn has_remaining(&self) -> bool {
        self.remaining > 0
    }
}

#[derive(Default)]
pub struct ProvisioningStrategy {
    sources: Vec<Arc<dyn ProvisioningSource>>,
    listeners: Vec<Arc<dyn ProvisioningListener>>,
}

impl ProvisioningStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, source: Arc<dyn ProvisioningSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn ProvisioningListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    pub async fn apply(&self, snapshot: &DemandSnapshot) -> StrategyOutcome {
        let mut excess = snapshot.excess();
        let mut started = 0;

        debug!(
            "Demand for {}: queue {} available {} connecting {} -> excess {}",
            snapshot.label, snapshot.queue_length, snapshot.available, snapshot.connecting, excess
        );

        for source in &self.sources {
            if excess <= 0 {
                break;
            }
            if !source.can_serve(&snapshot.label) {
                continue;
            }

            let wanted = usize::try_from(excess).unwrap_or(0);
            let agents = match source.provision(&snapshot.label, wanted).await {
                Ok(agents) => agents,
                Err(e) => {
                    warn!(
                        "Source {} failed to provision for {}: {}",
                        source.name(),
                        snapshot.label,
                        e
                    );
                    continue;
                }
            };
            if agents.is_empty() {
                continue;
            }

            info!(
                "Source {} started {} agent(s) for {}",
                source.name(),
                agents.len(),
                snapshot.label
            );
            excess -= agents.len() as i64;
            started += agents.len();
            for listener in &self.listeners {
                listener.on_started(source.name(), &snapshot.label, &agents);
            }
        }

        StrategyOutcome {
            remaining: excess.max(0),
            started,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct FixedSource {
        name: String,
        label: String,
        capacity: usize,
    }

    #[async_trait]
    impl ProvisioningSource for FixedSource {
        fn name(&self) -> &str {
            &self.name
        }

        fn can_serve(&self, label: &str) -> bool {
            self.label == label
        }

        async fn provision(&self, label: &str, count: usize) -> Result<Vec<PlannedAgent>> {
            Ok((0..count.min(self.capacity))
                .map(|i| PlannedAgent::new(format!("{}-{}", self.name, i), "builder", label))
                .collect())
        }
    }

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(String, usize)>>,
    }

    impl ProvisioningListener for Recorder {
        fn on_started(&self, source: &str, _label: &str, agents: &[PlannedAgent]) {
            self.calls.lock().push((source.to_string(), agents.len()));
        }
    }

    fn source(name: &str, label: &str, capacity: usize) -> Arc<dyn ProvisioningSource> {
        Arc::new(FixedSource {
            name: name.into(),
            label: label.into(),
            capacity,
        })
    }

    #[tokio::test]
    async fn test_no_excess_starts_nothing() {
        let strategy = ProvisioningStrategy::new().with_source(source("a", "linux", 10));
        let snapshot = DemandSnapshot::new("linux", 3).with_available(2).with_connecting(1);

        let outcome = strategy.apply(&snapshot).await;
        assert_eq!(outcome.started, 0);
        assert!(!outcome.has_remaining());
    }

    #[tokio::test]
    async fn test_sources_in_order_skip_incapable() {
        let recorder = Arc::new(Recorder::default());
        let strategy = ProvisioningStrategy::new()
            .with_source(source("windows", "windows", 10))
            .with_source(source("first", "linux", 2))
            .with_source(source("second", "linux", 10))
            .with_listener(recorder.clone());

        let outcome = strategy.apply(&DemandSnapshot::new("linux", 5)).await;

        assert_eq!(outcome.started, 5);
        assert_eq!(outcome.remaining, 0);
        assert_eq!(
            *recorder.calls.lock(),
            vec![("first".to_string(), 2), ("second".to_string(), 3)]
        );
    }
}
