//! Read-only inspection commands

use anyhow::Context;
use chrono::Utc;
use fleet_foundation::{FleetConfig, RecordStore, POOLS_FILE, TEMPLATES_FILE};
use fleet_task::{
    decide, until_billing_boundary, AgentPool, Field, HostInstance, HostStatus, ScaleInDecision,
    TaskTemplate, TemplateSet,
};
use std::path::Path;

pub fn load_templates(records: &RecordStore) -> anyhow::Result<TemplateSet> {
    let templates: Vec<TaskTemplate> = records
        .load_all(TEMPLATES_FILE)
        .context("Failed to load templates")?;
    Ok(TemplateSet::from_templates(templates))
}

pub fn load_pools(records: &RecordStore) -> anyhow::Result<Vec<AgentPool>> {
    Ok(records.load_all(POOLS_FILE).context("Failed to load pools")?)
}

pub fn list_templates(records: &RecordStore) -> anyhow::Result<()> {
    let templates = load_templates(records)?;
    if templates.is_empty() {
        println!("No templates found in {}", records.store().base_dir().display());
        return Ok(());
    }

    println!("\n📦 Task Templates\n");
    println!("{:<24} {:<20} {:<30}", "NAME", "PARENT", "LABELS");
    println!("{}", "-".repeat(76));

    for template in templates.to_vec() {
        let labels = match &template.labels {
            Field::Set(labels) => labels.iter().cloned().collect::<Vec<_>>().join(","),
            Field::Unset => "-".to_string(),
            Field::Inherit => "(inherit)".to_string(),
        };
        println!(
            "{:<24} {:<20} {:<30}",
            template.name,
            template.parent.as_deref().unwrap_or("-"),
            labels
        );
    }
    println!();
    Ok(())
}

pub fn show_template(records: &RecordStore, name: &str) -> anyhow::Result<()> {
    let templates = load_templates(records)?;
    let effective = templates.effective(name)?;
    println!("{}", serde_json::to_string_pretty(&effective)?);
    Ok(())
}

pub fn pool_status(records: &RecordStore) -> anyhow::Result<()> {
    let pools = load_pools(records)?;
    if pools.is_empty() {
        println!("No pools configured.");
        return Ok(());
    }

    let now = Utc::now();
    println!("\n🌡  Warm Pools ({})\n", now.format("%Y-%m-%d %H:%M UTC"));
    println!("{:<20} {:<20} {:<8} {:<8} {:<30}", "POOL", "TEMPLATE", "MIN", "ACTIVE", "SCHEDULE");
    println!("{}", "-".repeat(90));

    for pool in pools {
        let schedule = pool
            .schedule
            .as_deref()
            .map(|s| s.lines().map(str::trim).collect::<Vec<_>>().join(" | "))
            .unwrap_or_else(|| "(always)".to_string());
        println!(
            "{:<20} {:<20} {:<8} {:<8} {:<30}",
            pool.id,
            pool.template,
            pool.min_idle_agents,
            if pool.is_active_at(now) { "yes" } else { "no" },
            schedule
        );
    }
    println!();
    Ok(())
}

pub fn load_hosts(path: &Path) -> anyhow::Result<Vec<HostInstance>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let hosts = serde_json::from_str(&content)
        .with_context(|| format!("Invalid host list in {}", path.display()))?;
    Ok(hosts)
}

fn decision_label(decision: ScaleInDecision) -> &'static str {
    match decision {
        ScaleInDecision::Keep => "keep",
        ScaleInDecision::DrainLongRunning => "drain (max uptime)",
        ScaleInDecision::DrainNearBillingBoundary => "drain (billing boundary)",
    }
}

pub fn scale_plan(config: &FleetConfig, path: &Path) -> anyhow::Result<()> {
    let hosts = load_hosts(path)?;
    let now = Utc::now();
    let settings = &config.scale_in;

    println!("\n🖥  Scale-in Plan\n");
    println!("{:<20} {:<10} {:<8} {:<12} {:<12} {:<26}", "HOST", "STATUS", "TASKS", "UPTIME", "NEXT BILL", "DECISION");
    println!("{}", "-".repeat(92));

    for host in hosts {
        let uptime = host.uptime(now);
        let until_bill = until_billing_boundary(uptime, settings.billing_period());
        let decision = match host.status {
            HostStatus::Active => decision_label(decide(&host, now, settings)),
            HostStatus::Draining if host.is_idle() => "terminate",
            HostStatus::Draining => "wait (draining)",
            HostStatus::Inactive => "-",
        };
        println!(
            "{:<20} {:<10} {:<8} {:<12} {:<12} {:<26}",
            host.id,
            format!("{:?}", host.status),
            host.task_count(),
            format_duration(uptime),
            format_duration(until_bill),
            decision
        );
    }
    println!();
    Ok(())
}

fn format_duration(duration: std::time::Duration) -> String {
    let secs = duration.as_secs();
    format!("{}h{:02}m{:02}s", secs / 3600, (secs % 3600) / 60, secs % 60)
}
