//! Query executor: runs SQL text and materializes the result as a [`TableValue`].
//!
//! The query is wrapped in `COPY (...) TO STDOUT WITH CSV HEADER`, so results come back through
//! the same streaming path bulk loads use, and are decoded by the Arrow CSV reader.
//!
//! **Trust boundary:** the SQL text runs verbatim. It must come from developer-authored code,
//! never from untrusted input.

use bytes::BytesMut;
use futures::TryStreamExt;
use tracing::{debug, warn};

use crate::connection::{ConnectionProvider, bounded};
use crate::error::{Result, SluiceError};
use crate::table::TableValue;

#[derive(Clone, Debug)]
pub struct QueryExecutor {
    provider: ConnectionProvider,
}

impl QueryExecutor {
    pub fn new(provider: ConnectionProvider) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &ConnectionProvider {
        &self.provider
    }

    /// Runs `query`. Errors are reported against the query text itself.
    pub async fn execute(&self, query: &str) -> Result<TableValue> {
        self.execute_named(&summarize(query), query).await
    }

    /// Runs `query`, reporting failures under `name`.
    ///
    /// An empty result is an empty table with the result's columns; any failure is a
    /// [`SluiceError::QueryFailed`], never an empty table.
    pub async fn execute_named(&self, name: &str, query: &str) -> Result<TableValue> {
        let copy_sql = copy_out_statement(query);
        let mut conn = self.provider.acquire().await?;
        let timeout = conn.operation_timeout();

        let result = bounded("query", name, timeout, async {
            // Dropping the transaction on an early return rolls it back.
            let tx = conn.transaction().await?;
            let stream = tx.copy_out(copy_sql.as_str()).await?;
            futures::pin_mut!(stream);

            let mut buf = BytesMut::new();
            while let Some(chunk) = stream.try_next().await? {
                buf.extend_from_slice(&chunk);
            }
            tx.commit().await?;
            debug!("query `{name}` returned {} bytes", buf.len());
            TableValue::from_csv_bytes(&buf)
        })
        .await;

        result.map_err(|e| {
            warn!("query `{name}` failed: {e}");
            SluiceError::QueryFailed {
                query: name.to_string(),
                source: Box::new(e),
            }
        })
    }
}

/// Strips surrounding whitespace and one trailing `;`, then wraps the query for `COPY TO`.
pub(crate) fn copy_out_statement(query: &str) -> String {
    let trimmed = query.trim();
    let body = trimmed.strip_suffix(';').unwrap_or(trimmed);
    format!("COPY ({body}) TO STDOUT WITH CSV HEADER")
}

/// First line of the query, shortened, for error messages.
fn summarize(query: &str) -> String {
    let line = query
        .trim()
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    if line.chars().count() > 80 {
        let head: String = line.chars().take(77).collect();
        format!("{head}...")
    } else {
        line
    }
}
