//! Importer - loads a CSV or Excel export into the records store
//!
//! By default the store contents are replaced by the file's rows; `--append`
//! adds them next to what is already stored.

use anyhow::{Context, Result};
use clap::Parser;
use records::{import_records, ingest, ImportMode, StoreConfig, UploadFormat};
use std::path::PathBuf;
use tokio::fs;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "importer", about = "Imports a CSV or Excel file into the records store")]
struct Args {
    /// File to import (.csv, .xls, .xlsx, .xlsb, .ods)
    #[arg(long)]
    file: PathBuf,

    /// Keep existing records instead of replacing them
    #[arg(long, default_value = "false")]
    append: bool,

    /// Parse only - don't touch the store
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

    let file_name = args
        .file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let format = UploadFormat::detect(&file_name, None)
        .with_context(|| format!("Cannot import {}", args.file.display()))?;

    let bytes = fs::read(&args.file)
        .await
        .with_context(|| format!("Failed to read {}", args.file.display()))?;
    info!(file = %args.file.display(), size = bytes.len(), ?format, "read input file");

    let upload = ingest(format, &bytes).context("Failed to parse input file")?;

    for (i, record) in upload.records.iter().take(3).enumerate() {
        info!(row = i + 1, key = %record.key(), "sample record");
    }

    if args.dry_run {
        info!(records = upload.records.len(), hash = %upload.content_hash, "dry run - nothing written");
        return Ok(());
    }

    let config = StoreConfig::from_env().context("Invalid store configuration")?;
    let store = config.connect().await.context("Failed to open record store")?;
    let mode = if args.append {
        ImportMode::Append
    } else {
        ImportMode::Replace
    };
    let batch_size = args.batch_size.unwrap_or(config.batch_size).max(1);

    let summary = import_records(store.as_ref(), &upload, mode, batch_size)
        .await
        .context("Import failed")?;

    if !summary.failures.is_empty() {
        warn!(failed = summary.failures.len(), "some records were rejected");
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&summary).context("Failed to render summary")?
    );
    Ok(())
}
