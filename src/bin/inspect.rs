//! Inspect the database: run a read query (or preview a table) and print the result as a grid.
//!
//! ## Usage
//!
//! ```sh
//! cargo run --release --bin inspect -- --table proc_all_features_2 --limit 10
//! cargo run --release --bin inspect -- --query "SELECT is_churn, count(*) FROM train_v2 GROUP BY 1"
//! ```

use arrow::util::pretty::pretty_format_batches;
use clap::Parser;
use sluice::schema::quote_ident;
use sluice::{ConnectionArgs, ConnectionConfig, ConnectionProvider, QueryExecutor};

#[derive(Parser, Debug)]
#[command(about = "Run a query against the churn database and print the rows")]
struct Args {
    #[command(flatten)]
    connection: ConnectionArgs,

    /// Query to run. Must be a single read statement.
    #[arg(long, conflicts_with = "table", required_unless_present = "table")]
    query: Option<String>,

    /// Table to preview.
    #[arg(long)]
    table: Option<String>,

    /// Rows shown when previewing a table.
    #[arg(long, default_value_t = 5)]
    limit: usize,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let args = Args::parse();
    let query = match (&args.query, &args.table) {
        (Some(query), _) => query.clone(),
        (None, Some(table)) => format!("SELECT * FROM {} LIMIT {}", quote_ident(table), args.limit),
        (None, None) => return Err("one of --query or --table is required".into()),
    };

    let executor = QueryExecutor::new(ConnectionProvider::new(ConnectionConfig::from(
        args.connection.clone(),
    )));
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let result = rt.block_on(executor.execute(&query))?;

    println!("{}", pretty_format_batches(&[result.batch().clone()])?);
    println!(
        "({} rows, {} columns)",
        result.num_rows(),
        result.num_columns()
    );
    Ok(())
}
