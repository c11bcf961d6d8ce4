//! Command-line entry points for the tournament pipeline.
//!
//! `refresh` is the normal path: one locked collection run that rewrites
//! the snapshot cache. `source` is the subprocess side of isolation mode
//! and keeps its stdout clean for the JSON payload; everything else the
//! process says goes to stderr.

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use sideout_refresh::aggregate::build_context;
use sideout_refresh::{
    maybe_build_scheduler, RefreshConfig, RefreshCoordinator, RefreshStatus, RunnerPayload,
    SourceRegistry,
};
use sideout_scrapers::{extractor_for_key, SOURCE_KEYS};

#[derive(Debug, Parser)]
#[command(name = "sideout-cli")]
#[command(about = "Texas beach volleyball tournament pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one full refresh and rewrite the snapshot cache.
    Refresh,
    /// Scrape a single source and print its tournaments as JSON.
    Source { key: String },
    /// Show cache and lock state.
    Status,
    /// Validate a snapshot payload and apply it to the cache.
    Push {
        /// Read the payload from a file instead of stdin.
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Run scheduled refreshes until interrupted.
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout belongs to the `source` payload; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    let config = RefreshConfig::from_env();

    match cli.command.unwrap_or(Commands::Refresh) {
        Commands::Refresh => refresh(config).await,
        Commands::Source { key } => run_source(config, &key).await,
        Commands::Status => status(config).await,
        Commands::Push { file } => push(config, file).await,
        Commands::Watch => watch(config).await,
    }
}

async fn refresh(config: RefreshConfig) -> Result<()> {
    let registry = SourceRegistry::load(&config.workspace_root).await?;
    let coordinator = RefreshCoordinator::new(config, registry)?;
    match coordinator.refresh_sync().await? {
        RefreshStatus::InProgress => {
            println!("refresh already in progress; nothing to do");
        }
        _ => {
            let report = coordinator.status().await?;
            println!(
                "refresh complete: tournaments={} errors={}",
                report.tournaments,
                report.errors.len()
            );
        }
    }
    Ok(())
}

/// Subprocess entry point for isolation mode. Writes one compact JSON
/// object to stdout on success; exits 2 for an unknown key.
async fn run_source(config: RefreshConfig, key: &str) -> Result<()> {
    let Some(extractor) = extractor_for_key(key) else {
        eprintln!(
            "unknown source key \"{key}\"; known keys: {}",
            SOURCE_KEYS.join(", ")
        );
        std::process::exit(2);
    };

    let ctx = build_context(&config)?;
    let tournaments = extractor.scrape(&ctx).await?;
    let payload = RunnerPayload { tournaments };
    println!(
        "{}",
        serde_json::to_string(&payload).context("encoding source payload")?
    );
    Ok(())
}

async fn status(config: RefreshConfig) -> Result<()> {
    let registry = SourceRegistry::load(&config.workspace_root).await?;
    let coordinator = RefreshCoordinator::new(config, registry)?;
    let report = coordinator.status().await?;

    println!("cache: {}", coordinator.store().path().display());
    match &report.updated_at {
        Some(at) => println!("updated_at: {at}"),
        None => println!("updated_at: never refreshed"),
    }
    println!("tournaments: {}", report.tournaments);
    println!("refreshing: {}", report.refreshing);
    if report.errors.is_empty() {
        println!("source errors: none");
    } else {
        println!("source errors:");
        for line in &report.errors {
            println!("  {line}");
        }
    }
    Ok(())
}

async fn push(config: RefreshConfig, file: Option<PathBuf>) -> Result<()> {
    let text = match &file {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("reading payload from stdin")?;
            buf
        }
    };
    let payload: serde_json::Value =
        serde_json::from_str(&text).context("parsing payload JSON")?;

    let registry = SourceRegistry::load(&config.workspace_root).await?;
    let coordinator = RefreshCoordinator::new(config, registry)?;
    let snapshot = coordinator.push_snapshot(&payload).await?;
    println!(
        "snapshot applied: tournaments={} errors={}",
        snapshot.tournaments.len(),
        snapshot.errors.len()
    );
    Ok(())
}

async fn watch(config: RefreshConfig) -> Result<()> {
    let registry = SourceRegistry::load(&config.workspace_root).await?;
    let coordinator = Arc::new(RefreshCoordinator::new(config, registry)?);
    let Some(mut scheduler) = maybe_build_scheduler(coordinator).await? else {
        eprintln!("no refresh schedule configured; set SIDEOUT_REFRESH_CRON");
        return Ok(());
    };

    scheduler.start().await.context("starting scheduler")?;
    println!("scheduler running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await.context("waiting for interrupt")?;
    scheduler.shutdown().await.context("stopping scheduler")?;
    Ok(())
}
