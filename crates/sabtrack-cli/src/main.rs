use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sabtrack_adapters::FixtureQueueSource;
use sabtrack_storage::SqliteRecordStore;
use sabtrack_sync::config::DEFAULT_CONFIG_PATH;
use sabtrack_sync::{AppConfig, TickScheduler, Tracker};
use sabtrack_web::AppState;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "sabtrack")]
#[command(about = "Mirror a SABnzbd queue into a local record store and serve it as JSON")]
struct Cli {
    /// YAML configuration file.
    #[arg(long, global = true, env = "SABTRACK_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Read queue.json/history.json from this directory instead of calling SABnzbd.
    #[arg(long, global = true)]
    replay: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the scheduler and HTTP server until Ctrl-C.
    Serve,
    /// Run one reconciliation tick.
    Sync,
    /// Run one enrichment tick.
    Enrich,
    /// Run one retention sweep.
    Cleanup,
    /// Create or upgrade the database schema.
    Migrate,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sabtrack=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn build_tracker(cli: &Cli, config: &AppConfig) -> Result<Tracker> {
    let tracker = Tracker::from_config(config).await?;
    Ok(match &cli.replay {
        Some(dir) => {
            info!(dir = %dir.display(), "replaying recorded upstream responses");
            tracker.with_upstream(Arc::new(FixtureQueueSource::new(dir)))
        }
        None => tracker,
    })
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn serve(tracker: Arc<Tracker>, config: &AppConfig) -> Result<()> {
    match tracker.run_sync_tick().await {
        Ok(report) => info!(
            created = report.outcome.created,
            orphaned = report.outcome.orphaned,
            "initial sync complete"
        ),
        Err(err) => warn!(error = %err, "initial sync failed; the scheduler will retry"),
    }

    let scheduler = TickScheduler::start(Arc::clone(&tracker), config).await?;
    let served = sabtrack_web::serve(AppState::new(tracker), &config.bind_address(), async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "listening for Ctrl-C failed");
        }
        info!("shutdown requested");
    })
    .await;

    scheduler.shutdown().await?;
    served
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = AppConfig::load(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;

    let command = cli.command.as_ref().unwrap_or(&Commands::Serve);
    if matches!(command, Commands::Serve | Commands::Sync) && cli.replay.is_none() {
        config.require_upstream()?;
    }

    match command {
        Commands::Serve => {
            let tracker = Arc::new(build_tracker(&cli, &config).await?);
            serve(tracker, &config).await?;
        }
        Commands::Sync => {
            let tracker = build_tracker(&cli, &config).await?;
            print_json(&tracker.run_sync_tick().await?)?;
        }
        Commands::Enrich => {
            let tracker = build_tracker(&cli, &config).await?;
            print_json(&tracker.run_enrichment_tick().await?)?;
        }
        Commands::Cleanup => {
            let tracker = build_tracker(&cli, &config).await?;
            print_json(&tracker.run_cleanup_tick().await?)?;
        }
        Commands::Migrate => {
            SqliteRecordStore::connect(&config.database_url)
                .await
                .with_context(|| format!("migrating {}", config.database_url))?;
            println!("migrations applied to {}", config.database_url);
        }
    }

    Ok(())
}
