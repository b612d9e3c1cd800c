use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vms_core::{HostId, TimeWindow};
use vms_scheduling::{build_service, CompletionSweeper, Controllers, SchedulerConfig};

const DEFAULT_LOG_FILTER: &str = "vms_core=info,vms_storage=info,vms_scheduling=info,vms_web=info,vms_cli=info";

#[derive(Debug, Parser)]
#[command(name = "vms-cli")]
#[command(about = "Visitor appointment scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the HTTP API (default).
    Serve,
    /// Apply database migrations.
    Migrate,
    /// Run one completion sweep and exit.
    Sweep,
    /// Publish every window listed in a YAML file for one host.
    PublishBatch {
        #[arg(long)]
        host: HostId,
        #[arg(long)]
        file: PathBuf,
    },
}

#[derive(Debug, Deserialize)]
struct BatchFile {
    windows: Vec<TimeWindow>,
}

fn load_batch(path: &Path) -> Result<Vec<TimeWindow>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let batch: BatchFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(batch.windows)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = SchedulerConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let service = Arc::new(build_service(&config).await?);
            let sweeper = CompletionSweeper::new(service.clone());
            let sched = sweeper.maybe_build_scheduler(&config).await?;
            if let Some(sched) = &sched {
                sched.start().await.context("starting sweep scheduler")?;
                info!(cron = %config.sweep_cron, "completion sweeper scheduled");
            }
            vms_web::serve(&config, service).await?;
        }
        Commands::Migrate => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL must be set to run migrations")?;
            let pool = vms_storage::connect_pool(url, config.db_max_connections).await?;
            vms_storage::run_migrations(&pool).await?;
            println!("migrations applied");
        }
        Commands::Sweep => {
            let service = Arc::new(build_service(&config).await?);
            let summary = CompletionSweeper::new(service).run_once().await?;
            println!(
                "sweep complete: examined={} completed={} failed={} released_orphans={}",
                summary.examined, summary.completed, summary.failed, summary.released_orphans
            );
        }
        Commands::PublishBatch { host, file } => {
            let windows = load_batch(&file)?;
            if config.database_url.is_none() {
                warn!("DATABASE_URL unset; published slots will not outlive this process");
            }
            let service = Arc::new(build_service(&config).await?);
            let outcomes = Controllers::new(service)
                .availability
                .publish_batch(host, windows)
                .await;
            let failed = outcomes.iter().filter(|o| o.error.is_some()).count();
            for outcome in &outcomes {
                match (&outcome.slot, &outcome.error) {
                    (Some(slot), _) => println!("published {} {}", slot.id, outcome.window),
                    (None, Some(err)) => println!("skipped   {} ({err})", outcome.window),
                    (None, None) => {}
                }
            }
            println!(
                "publish-batch complete: published={} failed={failed}",
                outcomes.len() - failed
            );
        }
    }

    Ok(())
}
