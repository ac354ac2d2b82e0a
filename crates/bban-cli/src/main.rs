use std::sync::Arc;

use anyhow::Result;
use bban_sync::{build_scheduler, CycleRunner, SyncConfig};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "bban")]
#[command(about = "Buergerbuero appointment notifier")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one cycle immediately, then keep polling on the configured cron.
    Run,
    /// Run a single cycle and exit.
    Sync,
}

fn print_summary(summary: &bban_sync::CycleSummary) {
    println!(
        "cycle {:?}: run_id={} candidates={} inserted={} sent={} gone_removed={} failed={}",
        summary.status,
        summary.run_id,
        summary.candidates,
        summary.inserted,
        summary.delivery.sent,
        summary.delivery.gone_removed,
        summary.delivery.failed
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Sync => {
            let runner = CycleRunner::from_config(&config).await?;
            let summary = runner.run_cycle().await?;
            print_summary(&summary);
        }
        Commands::Run => {
            let runner = Arc::new(CycleRunner::from_config(&config).await?);

            // An immediate pass before the first scheduled tick. A sync
            // failure here is logged like any other bad tick; the scheduler
            // still starts.
            if let Some(summary) = runner.run_cycle_logged().await {
                print_summary(&summary);
            }

            let mut scheduler = build_scheduler(runner, &config.cycle_cron).await?;
            scheduler.start().await?;
            info!(cron = %config.cycle_cron, "scheduler running, ctrl-c to stop");

            tokio::signal::ctrl_c().await?;
            info!("shutting down");
            scheduler.shutdown().await?;
        }
    }

    Ok(())
}
