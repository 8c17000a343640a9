use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use itif_sync::{build_scheduler, CyclePipeline, SyncConfig};
use tokio::sync::Mutex;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "itif-cli")]
#[command(about = "IT internship finder: fetch, filter, dedup and notify")]
struct Cli {
    /// Keep dedup state in memory and print notifications to the log.
    #[arg(long, global = true)]
    offline: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a single cycle and exit.
    Run,
    /// Run cycles on the configured cron schedule until Ctrl-C.
    Schedule,
    /// Show how many identities each dedup tier holds.
    Seen,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("itif=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    let default_command = if config.scheduler_enabled {
        Commands::Schedule
    } else {
        Commands::Run
    };

    match cli.command.unwrap_or(default_command) {
        Commands::Run => {
            let summary = itif_sync::run_cycle_once_from_env(cli.offline).await?;
            println!(
                "cycle complete: run_id={} adapters={}/{} fetched={} relevant={} fresh={} batches={}/{}",
                summary.run_id,
                summary.adapters_succeeded,
                summary.adapters_configured,
                summary.fetched,
                summary.filter.kept,
                summary.fresh,
                summary.delivery.sent,
                summary.delivery.sent + summary.delivery.failed,
            );
        }
        Commands::Schedule => {
            let pipeline = Arc::new(Mutex::new(CyclePipeline::from_config(&config, cli.offline).await?));
            let mut sched = build_scheduler(pipeline, &config.sync_cron).await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Seen => {
            let pipeline = CyclePipeline::from_config(&config, cli.offline).await?;
            let report = pipeline.inspect_dedup().await?;
            println!(
                "local={} remote={} merged={}",
                report.local_entries,
                report
                    .remote_entries
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "n/a".to_string()),
                report.merged_entries,
            );
        }
    }

    Ok(())
}
