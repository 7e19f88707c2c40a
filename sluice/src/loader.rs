//! Bulk loader: CSV file (or table value) → PostgreSQL table through `COPY ... FROM STDIN`.
//!
//! ## Phases
//!
//! 1. **Sample** - infer the column schema from the first records of the file.
//! 2. **Drop** - optionally `DROP TABLE IF EXISTS`, in its own transaction. A failure here is
//!    logged and rolled back but does not stop the load.
//! 3. **Create** - `CREATE TABLE` from the sample schema. An existing table is a
//!    [`SluiceError::SchemaConflict`] and is left untouched.
//! 4. **Empty** - `DELETE FROM` the new table so the bulk phase always starts from zero rows.
//! 5. **Copy** - stream every record (header skipped) in one transaction. Any failure rolls the
//!    whole copy back; the table stays, empty.

use std::path::{Path, PathBuf};
use std::time::Instant;

use bytes::Bytes;
use futures::SinkExt;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio_postgres::error::SqlState;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionProvider, PgConnection, bounded};
use crate::error::{Cause, Result, SluiceError};
use crate::schema::{DEFAULT_SAMPLE_ROWS, TableSchema, quote_ident};
use crate::table::TableValue;

/// Size of each chunk sent to the server during `COPY`.
pub const DEFAULT_CHUNK_BYTES: usize = 1 << 20;

#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Records read to infer a file's schema.
    pub sample_rows: usize,
    pub chunk_bytes: usize,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            sample_rows: DEFAULT_SAMPLE_ROWS,
            chunk_bytes: DEFAULT_CHUNK_BYTES,
        }
    }
}

/// What a successful load wrote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadSummary {
    pub table: String,
    pub rows: u64,
    pub columns: usize,
}

#[derive(Clone, Debug)]
pub struct BulkLoader {
    provider: ConnectionProvider,
    options: LoadOptions,
}

impl BulkLoader {
    pub fn new(provider: ConnectionProvider) -> Self {
        Self::with_options(provider, LoadOptions::default())
    }

    pub fn with_options(provider: ConnectionProvider, options: LoadOptions) -> Self {
        Self { provider, options }
    }

    pub fn provider(&self) -> &ConnectionProvider {
        &self.provider
    }

    /// Loads `path` into `table_name`, which defaults to the file stem.
    pub async fn load(
        &self,
        path: &Path,
        table_name: Option<&str>,
        drop_existing: bool,
    ) -> Result<LoadSummary> {
        let table = match table_name {
            Some(name) => name.to_string(),
            None => default_table_name(path)?,
        };
        let start = Instant::now();

        let schema = TableSchema::infer_from_csv(path, self.options.sample_rows)?;
        let mut conn = self.provider.acquire().await?;
        prepare_table(&mut conn, &table, &schema, drop_existing).await?;

        let load_failed = |source: Cause| SluiceError::LoadFailed {
            path: path.to_path_buf(),
            table: table.clone(),
            source,
        };
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| load_failed(Box::new(e)))?;
        let mut reader = BufReader::new(file);
        let mut header = String::new();
        reader
            .read_line(&mut header)
            .await
            .map_err(|e| load_failed(Box::new(e)))?;

        let rows = self.copy_into(&mut conn, path, &table, reader).await?;
        info!(
            "loaded {} rows into \"{table}\" from {} in {:.1}s",
            rows,
            path.display(),
            start.elapsed().as_secs_f64()
        );
        Ok(LoadSummary {
            table,
            rows,
            columns: schema.len(),
        })
    }

    /// Persists an in-memory table through the same create / empty / copy phases. The schema
    /// comes from the table's column types instead of a file sample.
    pub async fn load_table(
        &self,
        value: &TableValue,
        table_name: &str,
        drop_existing: bool,
    ) -> Result<LoadSummary> {
        let schema = TableSchema::from_arrow(&value.schema())?;
        let body = value.to_csv_bytes(false)?;

        let mut conn = self.provider.acquire().await?;
        prepare_table(&mut conn, table_name, &schema, drop_existing).await?;

        let origin = PathBuf::from(format!("<in-memory {table_name}>"));
        let rows = self
            .copy_into(&mut conn, &origin, table_name, body.as_slice())
            .await?;
        info!("persisted {rows} rows into \"{table_name}\"");
        Ok(LoadSummary {
            table: table_name.to_string(),
            rows,
            columns: schema.len(),
        })
    }

    /// Streams CSV records (no header) from `reader` into `table` inside a single transaction.
    async fn copy_into<R>(
        &self,
        conn: &mut PgConnection,
        origin: &Path,
        table: &str,
        reader: R,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let timeout = conn.operation_timeout();
        let result = bounded(
            "bulk copy",
            table,
            timeout,
            stream_copy(conn, table, reader, self.options.chunk_bytes),
        )
        .await;

        result.map_err(|e| {
            warn!("failed to ingest \"{table}\" from {}: {e}", origin.display());
            SluiceError::LoadFailed {
                path: origin.to_path_buf(),
                table: table.to_string(),
                source: Box::new(e),
            }
        })
    }
}

async fn stream_copy<R>(
    conn: &mut PgConnection,
    table: &str,
    mut reader: R,
    chunk_bytes: usize,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    // Dropping the transaction on any early return rolls the copy back.
    let tx = conn.transaction().await?;
    let statement = format!("COPY {} FROM STDIN WITH (FORMAT csv)", quote_ident(table));
    let sink = tx.copy_in::<_, Bytes>(statement.as_str()).await?;
    futures::pin_mut!(sink);

    let mut buf = vec![0u8; chunk_bytes.max(1)];
    let mut sent = 0usize;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        sink.send(Bytes::copy_from_slice(&buf[..n])).await?;
        sent += n;
    }
    let rows = sink.finish().await?;
    tx.commit().await?;
    debug!("copied {sent} bytes ({rows} rows) into \"{table}\"");
    Ok(rows)
}

/// Runs the drop / create / empty phases on `conn`.
async fn prepare_table(
    conn: &mut PgConnection,
    table: &str,
    schema: &TableSchema,
    drop_existing: bool,
) -> Result<()> {
    let quoted = quote_ident(table);

    if drop_existing {
        execute_isolated(conn, &format!("DROP TABLE IF EXISTS {quoted}")).await;
    }

    let creation = |source: tokio_postgres::Error| SluiceError::TableCreation {
        table: table.to_string(),
        source,
    };

    let tx = conn.transaction().await.map_err(creation)?;
    if let Err(source) = tx.batch_execute(&schema.create_statement(table)).await {
        return Err(if source.code() == Some(&SqlState::DUPLICATE_TABLE) {
            SluiceError::SchemaConflict {
                table: table.to_string(),
            }
        } else {
            creation(source)
        });
    }
    tx.batch_execute(&format!("DELETE FROM {quoted}"))
        .await
        .map_err(creation)?;
    tx.commit().await.map_err(creation)?;
    debug!("created {quoted} with {} columns", schema.len());
    Ok(())
}

/// Runs one statement in its own transaction. A failure is logged and rolled back, and the
/// caller carries on.
async fn execute_isolated(conn: &mut PgConnection, statement: &str) {
    let tx = match conn.transaction().await {
        Ok(tx) => tx,
        Err(e) => {
            warn!("could not open a transaction for `{statement}`: {e}");
            return;
        }
    };
    match tx.batch_execute(statement).await {
        Ok(()) => {
            if let Err(e) = tx.commit().await {
                warn!("`{statement}` failed to commit: {e}");
            }
        }
        Err(e) => {
            warn!("`{statement}` failed, rolling back: {e}");
            if let Err(e) = tx.rollback().await {
                warn!("rollback of `{statement}` failed: {e}");
            }
        }
    }
}

pub(crate) fn default_table_name(path: &Path) -> Result<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            SluiceError::InvalidConfig(format!("cannot derive a table name from {}", path.display()))
        })
}
