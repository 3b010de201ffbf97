//! repolens-api - HTTP server for the analysis pipeline
//!
//! Uses XDG Base Directory specification for file locations:
//! - Database: $XDG_DATA_HOME/repolens/data.db (~/.local/share/repolens/data.db)
//! - Logs: $XDG_STATE_HOME/repolens/repolens.log (~/.local/state/repolens/repolens.log)
//! - Config: $XDG_CONFIG_HOME/repolens/config.toml (~/.config/repolens/config.toml)

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use repolens_api::ApiServer;
use repolens_core::{Config, Database};

#[derive(Parser)]
#[command(name = "repolens-api")]
#[command(about = "Serve the repolens analysis API")]
#[command(version)]
struct Args {
    /// Config file path (defaults to the XDG location)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Bind port override
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = match &args.config {
        Some(path) => Config::load_from(path).context("failed to load configuration")?,
        None => Config::load().context("failed to load configuration")?,
    };
    if let Some(port) = args.port {
        config.server.port = port;
    }

    // Initialize logging
    let _log_guard =
        repolens_core::logging::init(&config.logging).context("failed to initialize logging")?;

    tracing::info!("repolens-api starting");

    // Open database at XDG-compliant path
    let db_path = Config::database_path();
    tracing::info!(path = %db_path.display(), "Opening database");

    let db = Database::open(&db_path).context("failed to open database")?;
    db.migrate().context("failed to run database migrations")?;

    ApiServer::new(config, Arc::new(db)).start().await
}
