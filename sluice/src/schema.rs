//! Column schemas for target tables: inferred from a CSV sample or taken from an Arrow schema,
//! and rendered as PostgreSQL DDL.

use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use arrow::csv::reader::Format;
use arrow::datatypes::{DataType, Schema};

use crate::error::{Result, SluiceError};

/// Number of data records read to infer a file's schema.
pub const DEFAULT_SAMPLE_ROWS: usize = 1000;

/// The column types a target table is created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PgType {
    BigInt,
    DoublePrecision,
    Text,
}

impl PgType {
    /// Integers map to `BIGINT`, floats to `DOUBLE PRECISION`. Anything else (text, booleans,
    /// dates, columns the sample could not decide on) is stored as `TEXT`.
    pub fn for_arrow(data_type: &DataType) -> Self {
        match data_type {
            DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32 => PgType::BigInt,
            DataType::Float16 | DataType::Float32 | DataType::Float64 => PgType::DoublePrecision,
            _ => PgType::Text,
        }
    }

    pub fn sql(&self) -> &'static str {
        match self {
            PgType::BigInt => "BIGINT",
            PgType::DoublePrecision => "DOUBLE PRECISION",
            PgType::Text => "TEXT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub pg_type: PgType,
}

/// Ordered, uniquely named column definitions of a target table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    columns: Vec<ColumnDef>,
}

impl TableSchema {
    pub fn new(columns: Vec<ColumnDef>) -> Result<Self> {
        if columns.is_empty() {
            return Err(SluiceError::InvalidTable("a table needs at least one column".into()));
        }
        let mut seen = HashSet::with_capacity(columns.len());
        for column in &columns {
            if !seen.insert(column.name.as_str()) {
                return Err(SluiceError::InvalidTable(format!(
                    "duplicate column name \"{}\"",
                    column.name
                )));
            }
        }
        Ok(Self { columns })
    }

    pub fn from_arrow(schema: &Schema) -> Result<Self> {
        Self::new(
            schema
                .fields()
                .iter()
                .map(|field| ColumnDef {
                    name: field.name().clone(),
                    pg_type: PgType::for_arrow(field.data_type()),
                })
                .collect(),
        )
    }

    /// Infers the schema from the header and the first `sample_rows` records of a CSV file.
    /// Only the sample is read; later rows that disagree surface during the bulk copy.
    pub fn infer_from_csv(path: &Path, sample_rows: usize) -> Result<Self> {
        let parse_error = |source: Box<dyn std::error::Error + Send + Sync>| SluiceError::Parse {
            path: path.to_path_buf(),
            source,
        };

        let file = File::open(path).map_err(|e| parse_error(Box::new(e)))?;
        let (schema, records) = Format::default()
            .with_header(true)
            .infer_schema(BufReader::new(file), Some(sample_rows))
            .map_err(|e| parse_error(Box::new(e)))?;
        tracing::debug!(
            "inferred {} columns from {} sampled records of {}",
            schema.fields().len(),
            records,
            path.display()
        );

        Self::from_arrow(&schema).map_err(|e| parse_error(Box::new(e)))
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn create_statement(&self, table: &str) -> String {
        let columns = self
            .columns
            .iter()
            .map(|c| format!("{} {}", quote_ident(&c.name), c.pg_type.sql()))
            .collect::<Vec<_>>()
            .join(", ");
        format!("CREATE TABLE {} ({columns})", quote_ident(table))
    }
}

/// Double-quotes an identifier so names taken verbatim from files keep their exact spelling.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
