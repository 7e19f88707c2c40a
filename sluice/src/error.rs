//! Error taxonomy for everything that talks to the store.
//!
//! Every variant carries the context a user needs to find the failure: the file path, the
//! table name or the query name, next to the underlying cause.

use std::path::PathBuf;
use std::time::Duration;

use arrow::error::ArrowError;
use thiserror::Error;

/// Boxed cause for failures that can originate in several layers (store, IO, CSV codec).
pub type Cause = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum SluiceError {
    /// Network or authentication failure while opening a connection.
    #[error("failed to connect to {endpoint}: {source}")]
    Connection {
        endpoint: String,
        #[source]
        source: tokio_postgres::Error,
    },

    /// The target table already exists and dropping it was not requested.
    #[error("table \"{table}\" already exists; pass drop_existing to replace it")]
    SchemaConflict { table: String },

    #[error("failed to create table \"{table}\": {source}")]
    TableCreation {
        table: String,
        #[source]
        source: tokio_postgres::Error,
    },

    /// The bulk copy phase failed. The table may exist but is left empty.
    #[error("failed to load {} into \"{table}\": {source}", path.display())]
    LoadFailed {
        path: PathBuf,
        table: String,
        #[source]
        source: Cause,
    },

    #[error("query `{query}` failed: {source}")]
    QueryFailed {
        query: String,
        #[source]
        source: Cause,
    },

    /// The CSV sample could not be read or its schema could not be inferred.
    #[error("failed to infer a schema from {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: Cause,
    },

    #[error("failed to index \"{table}\" on \"{column}\": {source}")]
    Index {
        table: String,
        column: String,
        #[source]
        source: tokio_postgres::Error,
    },

    #[error("{operation} on {target} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        target: String,
        after: Duration,
    },

    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("invalid table: {0}")]
    InvalidTable(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("arrow error: {0}")]
    Arrow(#[from] ArrowError),
}

impl SluiceError {
    /// Whether this error is the overwrite guard rather than a real failure.
    pub fn is_schema_conflict(&self) -> bool {
        matches!(self, SluiceError::SchemaConflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, SluiceError>;
