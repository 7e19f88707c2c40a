//! Import binary: loads every CSV file under a directory into PostgreSQL, one table per file.
//!
//! Table names are the file stems (`train_v2.csv` → `train_v2`). Each table gets an index on the
//! join key unless `--no-key-index` is passed. A failing file is reported and skipped; the exit
//! status is non-zero if any file failed.
//!
//! ## Usage
//!
//! ```sh
//! PGPASSWORD=... cargo run --release --bin import_csvs -- \
//!     --host localhost --database kkbox_churn --user etl --data-dir ~/data/kkbox-churn
//! ```

use std::fs;
use std::path::PathBuf;

use clap::Parser;
use indicatif::{HumanCount, HumanDuration, ProgressBar, ProgressStyle};
use tracing::{error, info};

use sluice::importer::DEFAULT_KEY_COLUMN;
use sluice::{
    BatchImporter, BulkLoader, ConnectionArgs, ConnectionConfig, ConnectionProvider,
    ImportOptions, LoadOptions,
};

#[derive(Parser, Debug)]
#[command(about = "Import every CSV file under a directory into PostgreSQL")]
struct Args {
    #[command(flatten)]
    connection: ConnectionArgs,

    /// Directory searched recursively for `*.csv` files.
    #[arg(long)]
    data_dir: PathBuf,

    /// Column to index on every imported table.
    #[arg(long, default_value = DEFAULT_KEY_COLUMN)]
    key_column: String,

    /// Skip creating the join-key index.
    #[arg(long, default_value_t = false)]
    no_key_index: bool,

    /// Drop tables that already exist instead of failing those files.
    #[arg(long, default_value_t = false)]
    replace: bool,

    /// Records sampled per file to infer column types.
    #[arg(long, default_value_t = sluice::schema::DEFAULT_SAMPLE_ROWS)]
    sample_rows: usize,

    /// Files loaded concurrently, each on its own connection.
    #[arg(long, default_value_t = 1)]
    max_concurrent: usize,

    /// Write a JSON report with one entry per file to this path.
    #[arg(long)]
    report: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let config = ConnectionConfig::from(args.connection.clone());
    info!("Database: {}", config.endpoint());
    info!("Data dir: {}", args.data_dir.display());

    let loader = BulkLoader::with_options(
        ConnectionProvider::new(config),
        LoadOptions {
            sample_rows: args.sample_rows,
            ..LoadOptions::default()
        },
    );
    let options = ImportOptions {
        build_key_index: !args.no_key_index,
        key_column: args.key_column.clone(),
        drop_existing: args.replace,
        max_concurrent: args.max_concurrent,
    };

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::with_template(
            "  Importing  {bar:40.cyan/blue} {pos}/{len} files [{elapsed_precise}] {msg}",
        )?
        .progress_chars("##-"),
    );
    let importer = BatchImporter::new(loader, options).with_progress(pb);

    let start = std::time::Instant::now();
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let report = rt.block_on(importer.import_all(&args.data_dir))?;

    for outcome in &report.outcomes {
        match &outcome.load {
            Ok(summary) => info!(
                "  {:<32} {:>14} rows, {} columns",
                summary.table,
                HumanCount(summary.rows),
                summary.columns
            ),
            Err(e) => error!("  {:<32} FAILED: {e}", outcome.table),
        }
        if let Some(Err(e)) = &outcome.index {
            error!("  {:<32} index FAILED: {e}", outcome.table);
        }
    }

    if let Some(path) = &args.report {
        fs::write(path, serde_json::to_string_pretty(&report.entries())?)?;
        info!("Wrote report to {}", path.display());
    }

    let failed = report.failed().count();
    info!(
        "Imported {}/{} files ({} rows) in {}",
        report.outcomes.len() - failed,
        report.outcomes.len(),
        HumanCount(report.total_rows()),
        HumanDuration(start.elapsed())
    );
    if failed > 0 {
        return Err(format!("{failed} file(s) failed to import").into());
    }
    Ok(())
}
