//! Garden control core entry point: loads configuration, opens the store,
//! and either prints a load confirmation (`get-garden`) or runs the tick
//! loop until interrupted (`iterate-garden`).
//!
//! Signal handling runs a `tokio::select!` over `ctrl_c()`/SIGTERM, and
//! the graceful-shutdown closeout (close every open Activation, mark
//! every slave disconnected) before exit.

mod config;
mod connection;
mod db;
mod error;
mod garden;
mod models;
mod protocol;
mod relay;
mod rules;
mod schedule;

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use config::Config;
use db::Store;
use garden::Garden;

#[derive(Parser)]
#[command(name = "garden", version, about = "Horticultural automation control core.")]
struct Cli {
    /// Path to the SQLite database file. Falls back to `GARDEN_DB_PATH`.
    #[arg(long, global = true, env = "GARDEN_DB_PATH")]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load every entity table into memory once and print a confirmation.
    GetGarden,
    /// Enter the tick loop; run until SIGINT/SIGTERM.
    IterateGarden {
        /// Optional TOML config file (tick pacing, safety seconds, utc offset).
        #[arg(long)]
        config: Option<String>,
    },
}

fn db_path(cli: &Cli) -> Result<String> {
    cli.db
        .clone()
        .context("no database path given: pass --db or set GARDEN_DB_PATH")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    let result = match &cli.command {
        Commands::GetGarden => run_get_garden(&cli).await,
        Commands::IterateGarden { config } => run_iterate_garden(&cli, config.as_deref()).await,
    };

    if let Err(e) = result {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }

    Ok(())
}

async fn open_garden(cli: &Cli, config_path: Option<&str>) -> Result<Garden> {
    let path = db_path(cli)?;
    let config = match config_path {
        Some(p) => Config::load(p)?,
        None => Config::default(),
    };

    let store = Store::connect(&path)
        .await
        .with_context(|| format!("opening database {path}"))?;
    store.migrate().await.context("running migrations")?;

    Garden::load(store, config)
        .await
        .context("loading garden entities")
}

async fn run_get_garden(cli: &Cli) -> Result<()> {
    let garden = open_garden(cli, None).await?;
    info!(slaves = garden.slave_count(), "garden loaded");
    println!("garden loaded: {} slave(s) on record", garden.slave_count());
    Ok(())
}

async fn run_iterate_garden(cli: &Cli, config_path: Option<&str>) -> Result<()> {
    let mut garden = open_garden(cli, config_path).await?;
    let tick_interval = Duration::from_millis(garden.tick_interval_ms());

    info!("entering tick loop");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("installing SIGTERM handler")?;

    let exit_reason;
    loop {
        let tick_start = tokio::time::Instant::now();

        #[cfg(unix)]
        {
            tokio::select! {
                result = garden.tick() => {
                    if let Err(e) = result {
                        warn!(error = %e, "tick failed, continuing");
                    }
                }
                _ = &mut ctrl_c => {
                    exit_reason = "SIGINT";
                    break;
                }
                _ = sigterm.recv() => {
                    exit_reason = "SIGTERM";
                    break;
                }
            }
        }
        #[cfg(not(unix))]
        {
            tokio::select! {
                result = garden.tick() => {
                    if let Err(e) = result {
                        warn!(error = %e, "tick failed, continuing");
                    }
                }
                _ = &mut ctrl_c => {
                    exit_reason = "SIGINT";
                    break;
                }
            }
        }

        let elapsed = tick_start.elapsed();
        if elapsed < tick_interval {
            tokio::time::sleep(tick_interval - elapsed).await;
        }
    }

    warn!(signal = exit_reason, "shutting down tick loop");
    garden.shutdown().await.context("shutdown closeout")?;
    info!("shutdown complete");
    Ok(())
}
