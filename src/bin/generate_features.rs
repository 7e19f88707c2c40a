//! Feature generation binary: aggregates the ingested churn tables of one dataset version into
//! `proc_all_features_<version>`, with an optional CSV snapshot next to it.
//!
//! Expects the tables `import_csvs` creates: `train`, `user_logs`, `transactions` (suffixed with
//! `_v2` for version 2) and `members_v3`.
//!
//! ## Usage
//!
//! ```sh
//! PGPASSWORD=... cargo run --release --bin generate_features -- \
//!     --host localhost --database kkbox_churn --user etl \
//!     --dataset-version 2 --output-dir ~/data/kkbox-churn
//! ```

use std::path::PathBuf;

use chrono::NaiveDate;
use churn::features::default_reference_date;
use churn::{DatasetVersion, FeatureAggregator, FeatureConfig, FeatureOutput};
use clap::Parser;
use indicatif::{HumanCount, HumanDuration};
use sluice::importer::DEFAULT_KEY_COLUMN;
use sluice::{ConnectionArgs, ConnectionConfig, ConnectionProvider};
use tracing::info;

#[derive(Parser, Debug)]
#[command(about = "Build the per-user churn feature table for one dataset version")]
struct Args {
    #[command(flatten)]
    connection: ConnectionArgs,

    /// Dataset release to aggregate (1 or 2).
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=2))]
    dataset_version: u8,

    /// Directory for the `proc_all_features_<version>.csv` snapshot.
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,

    /// Skip writing the CSV snapshot.
    #[arg(long, default_value_t = false)]
    no_snapshot: bool,

    /// Drop an existing feature table instead of failing.
    #[arg(long, default_value_t = false)]
    replace: bool,

    /// Join key shared by every source table.
    #[arg(long, default_value = DEFAULT_KEY_COLUMN)]
    key_column: String,

    /// Date tenure is measured against (YYYY-MM-DD).
    #[arg(long, default_value_t = default_reference_date())]
    reference_date: NaiveDate,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let version = DatasetVersion::try_from(args.dataset_version)?;
    let config = ConnectionConfig::from(args.connection.clone());
    info!("Database: {}", config.endpoint());
    info!("Dataset:  {version}");

    let aggregator = FeatureAggregator::new(
        ConnectionProvider::new(config),
        FeatureConfig {
            key_column: args.key_column.clone(),
            reference_date: args.reference_date,
            ..FeatureConfig::default()
        },
    );
    let output = FeatureOutput {
        snapshot_dir: (!args.no_snapshot).then(|| args.output_dir.clone()),
        replace_existing: args.replace,
    };

    let start = std::time::Instant::now();
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let summary = rt.block_on(aggregator.generate(version, &output))?;

    info!(
        "Wrote {} rows x {} columns to \"{}\" in {}",
        HumanCount(summary.rows),
        summary.columns,
        summary.table,
        HumanDuration(start.elapsed())
    );
    if let Some(path) = &summary.snapshot {
        info!("Snapshot: {}", path.display());
    }
    Ok(())
}
