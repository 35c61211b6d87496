//! fleetctl - Fleet controller CLI entry point

mod commands;
mod simulate;

use clap::{Parser, Subcommand};
use fleet_foundation::{FleetConfig, JsonStore, RecordStore};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// fleetctl - inspect and exercise the elastic agent fleet controller
#[derive(Parser, Debug)]
#[command(name = "fleetctl")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// TOML config file (default: merged global + project config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding templates.json / pools.json (default: ./.fleet)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List stored task templates
    Templates,
    /// Print the effective (parent-merged) template as JSON
    Template {
        /// Template name
        name: String,
    },
    /// Show whether each warm pool's schedule is active right now
    PoolStatus,
    /// Show the scale-in decision for each host in a JSON host list
    ScalePlan {
        /// JSON array of host instances
        hosts: PathBuf,
    },
    /// Run the controller against an in-memory service with synthetic demand
    Simulate {
        /// Label the synthetic queue asks for
        #[arg(short, long, default_value = "linux")]
        label: String,
        /// Initial queue length
        #[arg(short, long, default_value = "3")]
        queue: i64,
        /// Number of one-second demand ticks
        #[arg(short, long, default_value = "20")]
        ticks: u32,
        /// Synthetic hosts in the cluster
        #[arg(long, default_value = "3")]
        hosts: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    // Load configuration
    let config = match &args.config {
        Some(path) => FleetConfig::from_toml_file(path)?,
        None => FleetConfig::load().unwrap_or_else(|e| {
            eprintln!("Warning: Failed to load config: {}", e);
            FleetConfig::default()
        }),
    };

    let records = match args.data_dir {
        Some(dir) => RecordStore::new(dir),
        None => RecordStore::from_store(JsonStore::current_project()?),
    };

    match args.command {
        Command::Templates => commands::list_templates(&records),
        Command::Template { name } => commands::show_template(&records, &name),
        Command::PoolStatus => commands::pool_status(&records),
        Command::ScalePlan { hosts } => commands::scale_plan(&config, &hosts),
        Command::Simulate {
            label,
            queue,
            ticks,
            hosts,
        } => {
            let options = simulate::SimulateOptions {
                label,
                queue,
                ticks,
                hosts,
            };
            simulate::run(config, &records, options).await
        }
    }
}
