//! Consolidator - merges duplicate sales records in place
//!
//! Records sharing (CategoryShortName, branch, SupplierAlias, ArticleNo) are
//! collapsed into one whose measures are the group sums. Safe to re-run:
//! a consolidated store is left untouched.

use anyhow::{Context, Result};
use clap::Parser;
use records::{ConsolidationStatus, Consolidator, StoreConfig};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "consolidator", about = "Merges duplicate records by composite key")]
struct Args {
    /// Report what would change without writing
    #[arg(long, default_value = "false")]
    dry_run: bool,

    /// Records per insert batch (overrides INSERT_BATCH_SIZE)
    #[arg(long)]
    batch_size: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    records::init_tracing();
    let args = Args::parse();

    let config = StoreConfig::from_env().context("Invalid store configuration")?;
    let store = config.connect().await.context("Failed to open record store")?;
    let batch_size = args.batch_size.unwrap_or(config.batch_size);

    let consolidator = Consolidator::new(store, batch_size);
    let summary = if args.dry_run {
        consolidator.preview().await
    } else {
        consolidator.run().await
    }
    .context("Consolidation failed")?;

    match summary.status {
        ConsolidationStatus::Applied => info!(
            before = summary.original_count,
            after = summary.consolidated_count,
            merged = summary.duplicates_removed,
            "data consolidation complete"
        ),
        ConsolidationStatus::DryRun => info!(
            would_remove = summary.duplicates_removed,
            "dry run - no records written"
        ),
        ConsolidationStatus::Empty | ConsolidationStatus::AlreadyConsolidated => {
            info!(status = ?summary.status, "nothing to consolidate")
        }
    }
    if summary.coerced_to_zero > 0 {
        warn!(
            values = summary.coerced_to_zero,
            "non-numeric measure values were counted as 0"
        );
    }
    if !summary.failures.is_empty() {
        warn!(failed = summary.failures.len(), "some merged records could not be stored");
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&summary).context("Failed to render summary")?
    );
    Ok(())
}
