use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use gather_storage::EventStore;
use gather_sync::{SyncConfig, SyncPipeline, SyncRunSummary};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "gather-cli")]
#[command(about = "Gather event aggregator command-line interface")]
struct Cli {
    /// Directory holding sources.yaml (overrides GATHER_WORKSPACE_ROOT).
    #[arg(long, global = true)]
    workspace_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sweep and exit.
    Sync {
        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Sweep now, then daily on SYNC_CRON until ctrl-c.
    Schedule,
    /// Apply database migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,gather=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true),
        )
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();
    if let Some(root) = cli.workspace_root {
        config.workspace_root = root;
    }

    match cli.command.unwrap_or(Commands::Sync { json: false }) {
        Commands::Sync { json } => {
            let pipeline = SyncPipeline::from_config(&config).await?;
            let summary = pipeline.run_once().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_summary(&summary);
            }
            pipeline.store().close().await;
        }
        Commands::Schedule => {
            let pipeline = Arc::new(SyncPipeline::from_config(&config).await?);
            gather_sync::run_forever(pipeline, &config).await?;
        }
        Commands::Migrate => {
            let store = EventStore::connect(&config.database_url).await?;
            store.migrate().await?;
            info!(database_url = %config.database_url, "migrations applied");
            store.close().await;
        }
    }

    Ok(())
}

fn print_summary(summary: &SyncRunSummary) {
    println!(
        "sync complete: run_id={} inserted={} skipped={} dropped={} failed_sources={}",
        summary.run_id,
        summary.inserted(),
        summary.skipped(),
        summary.dropped(),
        summary.failed_sources()
    );
    for report in &summary.sources {
        match &report.error {
            Some(err) => println!("  {:<16} failed: {err}", report.source.tag()),
            None => println!(
                "  {:<16} fetched={} inserted={} skipped={} dropped={} failed_writes={}",
                report.source.tag(),
                report.fetched,
                report.inserted,
                report.skipped,
                report.dropped,
                report.failed_writes
            ),
        }
    }
}
