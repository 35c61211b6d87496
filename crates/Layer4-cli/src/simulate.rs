//! `fleetctl simulate` - 인메모리 서비스 위에서 컨트롤러 전체 실행
//!
//! Synthetic demand is fed through the demand channel once per second. A
//! small agent simulator stands in for the connection layer: it attaches
//! every node that reaches `AgentConnecting` and hands queued work to idle
//! agents.

use crate::commands::{load_pools, load_templates};
use chrono::Utc;
use fleet_foundation::{FleetConfig, RecordStore};
use fleet_task::{
    Controller, HostInstance, HostStatus, InMemoryTaskService, NodeState, PlannedAgent,
    ProvisioningListener, RetentionPolicy, TaskTemplate,
};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const SIMULATED_HOST_GROUP: &str = "simulated-hosts";

#[derive(Debug, Clone)]
pub struct SimulateOptions {
    pub label: String,
    pub queue: i64,
    pub ticks: u32,
    pub hosts: u32,
}

/// Counts agents started by the strategy
#[derive(Default)]
struct StartCounter {
    started: AtomicUsize,
}

impl ProvisioningListener for StartCounter {
    fn on_started(&self, source: &str, label: &str, agents: &[PlannedAgent]) {
        self.started.fetch_add(agents.len(), Ordering::SeqCst);
        info!(
            "{} started {} agent(s) for {}",
            source,
            agents.len(),
            label
        );
    }
}

/// Shorter intervals so a run of a few seconds shows every loop firing
fn tune_for_simulation(mut config: FleetConfig) -> FleetConfig {
    config.launcher.poll_interval_ms = config.launcher.poll_interval_ms.min(200);
    config.retention.recheck_delay_secs = 2;
    config.retention.tick_interval_secs = 1;
    config.pools.tick_interval_secs = 2;
    config.scale_in.enabled = true;
    config.scale_in.tick_interval_secs = 2;
    if config.host_group.is_none() {
        config.host_group = Some(SIMULATED_HOST_GROUP.to_string());
    }
    config
}

/// Hosts cycling through: fresh and busy, idle near its billing boundary,
/// past max uptime
fn synthetic_hosts(count: u32) -> Vec<HostInstance> {
    let now = Utc::now();
    (0..count)
        .map(|i| {
            let (uptime, running) = match i % 3 {
                0 => (chrono::Duration::minutes(20), 1),
                1 => (chrono::Duration::minutes(57), 0),
                _ => (chrono::Duration::hours(11), 2),
            };
            HostInstance {
                id: format!("host-{:02}", i),
                instance_id: format!("i-sim{:04}", i),
                status: HostStatus::Active,
                pending_tasks: 0,
                running_tasks: running,
                launched_at: now - uptime,
            }
        })
        .collect()
}

fn demo_template(label: &str) -> TaskTemplate {
    TaskTemplate::new("sim-agent")
        .with_image("fleet/agent:latest")
        .with_labels([label])
        .with_resources(512, 1024)
        .with_retention(RetentionPolicy::OneShot, 0)
}

pub async fn run(config: FleetConfig, records: &RecordStore, options: SimulateOptions) -> anyhow::Result<()> {
    let config = tune_for_simulation(config);

    let mut templates = load_templates(records)?.to_vec();
    if templates.is_empty() {
        info!("No stored templates, using built-in sim-agent template");
        templates.push(demo_template(&options.label));
    }
    let pools = load_pools(records)?;

    let service = Arc::new(InMemoryTaskService::new().with_start_delay(2));
    for host in synthetic_hosts(options.hosts) {
        service.add_host(host);
    }

    let counter = Arc::new(StartCounter::default());
    let controller = Arc::new(
        Controller::builder(config, service.clone())
            .host_group(service.clone())
            .templates(templates)
            .pools(pools)
            .listener(counter.clone())
            .build(),
    );

    if controller
        .template_names()
        .iter()
        .filter_map(|name| controller.effective_template(name).ok())
        .all(|template| !template.serves(&options.label))
    {
        warn!("No template serves label {}; demand will stay unserved", options.label);
    }

    controller.start().await?;

    let (tx, rx) = mpsc::channel(16);
    let demand_loop = controller.spawn_demand_loop(rx);

    let queue = Arc::new(AtomicI64::new(options.queue));
    let agents = spawn_agent_simulator(Arc::clone(&controller), Arc::clone(&queue));

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interval = tokio::time::interval(Duration::from_secs(1));

    for tick in 0..options.ticks {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted, shutting down");
                break;
            }
            _ = interval.tick() => {
                // a new job arrives every fourth tick
                if tick > 0 && tick % 4 == 0 {
                    queue.fetch_add(1, Ordering::SeqCst);
                }
                let snapshot = controller
                    .snapshot_for(&options.label, queue.load(Ordering::SeqCst))
                    .await;
                debug!(
                    "Tick {}: queue {} available {} connecting {}",
                    tick, snapshot.queue_length, snapshot.available, snapshot.connecting
                );
                if tx.send(snapshot).await.is_err() {
                    break;
                }
            }
        }
    }

    controller.shutdown().await;
    drop(tx);
    let _ = demand_loop.await;
    let _ = agents.await;

    print_summary(&controller, &service, &counter, queue.load(Ordering::SeqCst)).await;
    Ok(())
}

fn spawn_agent_simulator(
    controller: Arc<Controller>,
    queue: Arc<AtomicI64>,
) -> tokio::task::JoinHandle<()> {
    let cancel = controller.cancel_token();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(250));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            for node in controller.registry().list().await {
                match node.state {
                    NodeState::AgentConnecting => {
                        if let Err(e) = controller.on_agent_connected(&node.name, &node.secret) {
                            debug!("Agent {} could not attach: {}", node.name, e);
                        }
                    }
                    NodeState::Idle => {
                        let took_job = queue
                            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |q| (q > 0).then(|| q - 1))
                            .is_ok();
                        if !took_job {
                            continue;
                        }
                        controller.on_work_started(&node.name).await;
                        let controller = Arc::clone(&controller);
                        tokio::spawn(async move {
                            tokio::time::sleep(Duration::from_secs(2)).await;
                            controller.on_work_completed(&node.name).await;
                        });
                    }
                    _ => {}
                }
            }
        }
    })
}

async fn print_summary(
    controller: &Controller,
    service: &InMemoryTaskService,
    counter: &StartCounter,
    queue_left: i64,
) {
    let stats = service.stats();

    println!("\n📊 Simulation Summary\n");
    println!("  Agents started by strategy: {}", counter.started.load(Ordering::SeqCst));
    println!("  Tasks run:                  {}", stats.runs);
    println!("  Tasks stopped:              {}", stats.stops);
    println!("  Definitions registered:     {}", stats.registrations);
    println!("  Jobs left in queue:         {}", queue_left);
    println!("  Hosts drained:              {}", stats.drained_hosts.join(", "));
    println!("  Hosts terminated:           {}", service.terminated_instances().join(", "));

    let nodes = controller.registry().list().await;
    if nodes.is_empty() {
        println!("\n  No agents left.\n");
        return;
    }

    println!("\n{:<40} {:<16} {:<12} {:<6}", "AGENT", "STATE", "POOL", "JOBS");
    println!("{}", "-".repeat(78));
    for node in nodes {
        println!(
            "{:<40} {:<16} {:<12} {:<6}",
            node.name,
            node.state.display_name(),
            node.pool.as_deref().unwrap_or("-"),
            node.tasks_completed
        );
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_hosts_cycle() {
        let hosts = synthetic_hosts(4);
        assert_eq!(hosts.len(), 4);
        assert!(hosts[1].is_idle());
        assert!(!hosts[2].is_idle());
        assert_eq!(hosts[3].id, "host-03");
    }

    #[test]
    fn test_tuning_enables_scale_in() {
        let config = tune_for_simulation(FleetConfig::default());
        assert!(config.scale_in.enabled);
        assert_eq!(config.host_group.as_deref(), Some(SIMULATED_HOST_GROUP));
        assert!(config.launcher.poll_interval_ms <= 200);
    }
}
