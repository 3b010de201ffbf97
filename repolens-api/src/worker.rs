//! repolens-worker - one-shot queue drainer
//!
//! Each queue item is an independent processor invocation (the same
//! semantics as the HTTP trigger); this tool is for operators re-running a
//! specific item or draining a backlog without the trigger infrastructure.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use repolens_core::queue::{ProcessOutcome, Processor};
use repolens_core::{Config, Database};

#[derive(Parser)]
#[command(name = "repolens-worker")]
#[command(about = "Process pending analysis queue items")]
#[command(version)]
struct Args {
    /// Process a single item by ID instead of draining pending items
    #[arg(long)]
    item_id: Option<String>,

    /// Maximum number of pending items to drain
    #[arg(long, default_value = "10")]
    limit: usize,

    /// Config file path (defaults to the XDG location)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from(path).context("failed to load configuration")?,
        None => Config::load().context("failed to load configuration")?,
    };

    let _log_guard =
        repolens_core::logging::init(&config.logging).context("failed to initialize logging")?;

    tracing::info!("repolens-worker starting");

    let db_path = Config::database_path();
    let db = Database::open(&db_path).context("failed to open database")?;
    db.migrate().context("failed to run database migrations")?;
    let db = Arc::new(db);

    let processor = Processor::new(db.clone(), config.provider.clone());

    let item_ids: Vec<String> = match &args.item_id {
        Some(id) => vec![id.clone()],
        None => db
            .list_pending_items(args.limit)
            .context("failed to list pending items")?
            .into_iter()
            .map(|item| item.id)
            .collect(),
    };

    if item_ids.is_empty() {
        println!("No pending items.");
        return Ok(());
    }

    let mut completed = 0_usize;
    let mut failed = 0_usize;
    let mut skipped = 0_usize;

    for item_id in item_ids {
        match processor.process_item(&item_id).await {
            Ok(ProcessOutcome::Completed { analysis_type, .. }) => {
                completed += 1;
                println!("{}  completed ({})", item_id, analysis_type.as_str());
            }
            Ok(ProcessOutcome::Failed { message, .. }) => {
                failed += 1;
                println!("{}  error: {}", item_id, message);
            }
            Ok(outcome) => {
                skipped += 1;
                println!("{}  {}", item_id, outcome.status().as_str());
            }
            Err(e) => {
                failed += 1;
                eprintln!("{}  failed: {}", item_id, e);
            }
        }
    }

    println!(
        "Done: {} completed, {} failed, {} skipped.",
        completed, failed, skipped
    );
    Ok(())
}
