//! # chorus
//!
//! Chat server binary: loads configuration, opens the room/user store,
//! starts the hub and serves WebSocket clients until ctrl-c.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use chorus_server::{connect_backplane, load_config, spawn_hub, start, AppState};
use chorus_store::{Database, RoomRepo, UserRepo};
use chorus_telemetry::{init_telemetry, parse_level, TelemetryConfig};

/// Real-time room chat server.
#[derive(Parser, Debug)]
#[command(name = "chorus", about = "Real-time room chat server")]
struct Cli {
    /// JSON config file merged over the defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// SQLite file for room and user records (`:memory:` for none).
    #[arg(long)]
    db_path: Option<String>,

    /// Directory of static assets.
    #[arg(long)]
    public_dir: Option<String>,

    /// Log level (overridden by `RUST_LOG`).
    #[arg(long)]
    log_level: Option<String>,

    /// Broker shared with other chorus processes (e.g. `redis://127.0.0.1:6379`).
    #[arg(long)]
    backplane_url: Option<String>,
}

fn open_database(path: &str) -> Result<Database> {
    if path == ":memory:" {
        return Database::in_memory().context("Failed to open in-memory database");
    }
    Database::open(Path::new(path)).with_context(|| format!("Failed to open database: {path}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref()).context("Failed to load config")?;
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(db_path) = cli.db_path {
        config.db_path = db_path;
    }
    if let Some(public_dir) = cli.public_dir {
        config.public_dir = public_dir;
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    if let Some(url) = cli.backplane_url {
        config.backplane_url = Some(url);
    }

    init_telemetry(&TelemetryConfig {
        log_level: parse_level(&config.log_level),
        json: config.log_json,
        ..TelemetryConfig::default()
    });

    let db = open_database(&config.db_path)?;

    let backplane = connect_backplane(config.backplane_url.as_deref())
        .await
        .context("Failed to connect backplane")?;
    let hub = spawn_hub(
        backplane.clone(),
        Arc::new(RoomRepo::new(db.clone())),
        Arc::new(UserRepo::new(db)),
    )
    .await;

    let handle = start(AppState::new(hub, backplane, config))
        .await
        .context("Failed to start server")?;
    tracing::info!(addr = %handle.addr, "chorus ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}
