//! osdflow OSD - Object Storage Daemon
//!
//! Runs the replication stage of one OSD. Peer OSDs are served from the
//! data directories listed under `[peers]`.

use anyhow::{Context, Result};
use clap::Parser;
use osdflow_common::Config;
use osdflow_osd::{FsPeerBackend, Osd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "osdflow-osd")]
#[command(about = "osdflow Object Storage Daemon")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/osdflow/osd.toml")]
    config: String,

    /// Directory holding the objects of this OSD
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Service ID of this OSD
    #[arg(long, env = "OSDFLOW_OSD_UUID")]
    uuid: Option<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config: Config = if Path::new(&args.config).exists() {
        let config_str = std::fs::read_to_string(&args.config)
            .with_context(|| format!("failed to read config file {}", args.config))?;
        toml::from_str(&config_str).unwrap_or_else(|e| {
            eprintln!("Warning: Failed to parse config file: {e}");
            Config::default()
        })
    } else {
        Config::default()
    };

    // CLI takes precedence
    if let Some(data_dir) = &args.data_dir {
        config.osd.data_dir.clone_from(data_dir);
    }
    if let Some(uuid) = &args.uuid {
        config.osd.uuid = Some(uuid.clone());
    }
    if args.log_level != "info" {
        config.logging.level.clone_from(&args.log_level);
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting osdflow OSD");
    info!(
        config = %args.config,
        data_dir = %config.osd.data_dir.display(),
        peers = config.peers.len(),
        "configuration loaded"
    );

    std::fs::create_dir_all(&config.osd.data_dir)
        .with_context(|| format!("failed to create data directory {}", config.osd.data_dir.display()))?;

    let backend = Arc::new(FsPeerBackend::from_config(Handle::current(), &config));
    let mut osd = Osd::new(config, backend);
    osd.start()?;
    info!(osd = %osd.id(), "OSD running");

    let mut crashes = osd.crashes();
    let crash = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for the shutdown signal")?;
            info!("Shutting down...");
            None
        }
        changed = crashes.changed() => {
            changed.ok().and_then(|()| crashes.borrow().clone())
        }
    };

    // joins the stage workers
    tokio::task::spawn_blocking(move || osd.shutdown())
        .await
        .context("shutdown task failed")?;

    match crash {
        Some(crash) => {
            error!(stage = %crash.stage, cause = %crash.cause, "OSD stopped after a stage crash");
            Err(anyhow::anyhow!("stage {} crashed: {}", crash.stage, crash.cause))
        }
        None => {
            info!("OSD stopped");
            Ok(())
        }
    }
}
