//! log-harvest: incremental, rotation-aware log collection for a fleet.

mod config;
mod logger;
mod runner;
mod scheduler;
mod shutdown;
mod ssh;

use anyhow::Result;
use clap::{Parser, Subcommand};
use config::Config;
use harvest_core::{NodeType, TracingProgress};
use runner::{PassOptions, PassRunner};
use scheduler::PassScheduler;
use shutdown::ShutdownCoordinator;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a single harvesting pass and print its summary as JSON
    Collect {
        /// Job identifier; a random one is generated when omitted
        #[arg(long)]
        job_id: Option<String>,

        #[command(flatten)]
        pass: PassArgs,
    },

    /// Run passes on a cron schedule until SIGINT or SIGTERM
    Serve {
        /// Six-field cron expression (overrides config)
        #[arg(long)]
        cron: Option<String>,

        #[command(flatten)]
        pass: PassArgs,
    },

    /// Remove collection artifacts older than the retention age
    Cleanup,
}

#[derive(clap::Args, Debug)]
struct PassArgs {
    /// Baseline profile
    #[arg(long, default_value = "")]
    profile: String,

    /// Comma-separated node types (compute, guest, storage, switch, management)
    #[arg(long, value_delimiter = ',')]
    node_types: Vec<NodeType>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(args.config.as_deref())?;
    logger::init(logger::resolve_level(args.log_level.as_deref(), &config.log.level))?;
    tracing::info!("Starting log-harvest v{}", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(config);
    let pass_runner = Arc::new(PassRunner::new(config.clone(), Arc::new(TracingProgress)));

    match args.command {
        Command::Collect { job_id, pass } => {
            let opts = PassOptions {
                job_id: job_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                profile: pass.profile,
                node_types: pass.node_types,
            };
            let summary = pass_runner.run(opts).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Serve { cron, pass } => {
            let cron = cron.unwrap_or_else(|| config.harvest.schedule.clone());
            let coordinator = ShutdownCoordinator::new();
            let scheduler = PassScheduler::new(pass_runner, coordinator.token()).await?;
            scheduler.schedule(&cron, &pass.profile, pass.node_types).await?;
            scheduler.start().await?;

            coordinator.wait_for_signal().await;

            if let Err(e) = scheduler.shutdown().await {
                tracing::warn!("Scheduler shutdown error: {}", e);
            }
            coordinator.drain(&scheduler.running()).await;
        }
        Command::Cleanup => {
            let removed = tokio::task::spawn_blocking(move || runner::run_cleanup(&config)).await?;
            tracing::info!(removed, "Cleanup finished");
        }
    }

    Ok(())
}
