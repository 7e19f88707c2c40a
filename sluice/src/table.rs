//! In-memory table values: the currency between the query executor and its consumers.
//!
//! A [`TableValue`] wraps a single Arrow [`RecordBatch`] whose column names are unique. It is
//! never mutated; joins, fills and projections all return new values.

use std::collections::{HashMap, HashSet};
use std::io::{Cursor, Write};
use std::sync::Arc;

use arrow::array::*;
use arrow::compute::{cast, concat_batches, take};
use arrow::csv::reader::Format;
use arrow::csv::{ReaderBuilder, WriterBuilder};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use tracing::warn;

use crate::error::{Result, SluiceError};

/// Rows per Arrow batch while decoding CSV. Decoded batches are concatenated afterwards.
const CSV_BATCH_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct TableValue {
    batch: RecordBatch,
}

impl TableValue {
    pub fn try_new(batch: RecordBatch) -> Result<Self> {
        let mut seen = HashSet::with_capacity(batch.num_columns());
        for field in batch.schema().fields() {
            if !seen.insert(field.name().as_str()) {
                return Err(SluiceError::InvalidTable(format!(
                    "duplicate column name \"{}\"",
                    field.name()
                )));
            }
        }
        Ok(Self { batch })
    }

    pub fn from_columns(columns: Vec<(&str, ArrayRef)>) -> Result<Self> {
        let fields: Vec<Field> = columns
            .iter()
            .map(|(name, array)| Field::new(*name, array.data_type().clone(), true))
            .collect();
        let arrays = columns.into_iter().map(|(_, array)| array).collect();
        Self::try_new(RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?)
    }

    /// Decodes CSV text with a header row. Column types are inferred over every record, so the
    /// result is typed consistently no matter how the rows are batched.
    pub fn from_csv_bytes(bytes: &[u8]) -> Result<Self> {
        let (schema, _) = Format::default()
            .with_header(true)
            .infer_schema(Cursor::new(bytes), None)?;
        let schema: SchemaRef = Arc::new(schema);

        let reader = ReaderBuilder::new(Arc::clone(&schema))
            .with_header(true)
            .with_batch_size(CSV_BATCH_SIZE)
            .build(Cursor::new(bytes))?;
        let batches = reader.collect::<std::result::Result<Vec<_>, _>>()?;

        let batch = match batches.len() {
            0 => RecordBatch::new_empty(Arc::clone(&schema)),
            1 => batches.into_iter().next().unwrap_or_else(|| RecordBatch::new_empty(schema)),
            _ => concat_batches(&schema, &batches)?,
        };
        Self::try_new(batch)
    }

    pub fn batch(&self) -> &RecordBatch {
        &self.batch
    }

    pub fn into_batch(self) -> RecordBatch {
        self.batch
    }

    pub fn schema(&self) -> SchemaRef {
        self.batch.schema()
    }

    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn num_columns(&self) -> usize {
        self.batch.num_columns()
    }

    pub fn column_names(&self) -> Vec<String> {
        self.batch
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect()
    }

    pub fn column(&self, name: &str) -> Option<&ArrayRef> {
        self.batch.column_by_name(name)
    }

    fn require_column(&self, name: &str) -> Result<&ArrayRef> {
        self.column(name)
            .ok_or_else(|| SluiceError::InvalidTable(format!("missing column \"{name}\"")))
    }

    /// Returns a copy with `name` set to `array`, replacing the column in place if it exists and
    /// appending it otherwise.
    pub fn with_column(&self, name: &str, array: ArrayRef) -> Result<Self> {
        let schema = self.batch.schema();
        let mut fields: Vec<Field> = schema.fields().iter().map(|f| f.as_ref().clone()).collect();
        let mut columns = self.batch.columns().to_vec();
        let field = Field::new(name, array.data_type().clone(), true);
        match schema.index_of(name) {
            Ok(idx) => {
                fields[idx] = field;
                columns[idx] = array;
            }
            Err(_) => {
                fields.push(field);
                columns.push(array);
            }
        }
        Self::try_new(RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)?)
    }

    pub fn without_column(&self, name: &str) -> Result<Self> {
        let idx = self.batch.schema().index_of(name)?;
        let keep: Vec<usize> = (0..self.num_columns()).filter(|&i| i != idx).collect();
        Self::try_new(self.batch.project(&keep)?)
    }

    /// Left join on `key`: every row of `self` is kept exactly once, in order. Right rows are
    /// matched on the string rendering of the key, so integer and text keys with the same digits
    /// match. Unmatched rows get nulls in the right-hand columns. When the right side holds a key
    /// more than once, the first occurrence wins.
    pub fn left_join(&self, right: &TableValue, key: &str) -> Result<TableValue> {
        let left_keys = key_strings(self.require_column(key)?)?;
        let right_keys = key_strings(right.require_column(key)?)?;

        let mut lookup: HashMap<&str, u32> = HashMap::with_capacity(right_keys.len());
        let mut duplicates = 0usize;
        for (row, value) in right_keys.iter().enumerate() {
            if let Some(k) = value {
                if lookup.contains_key(k.as_str()) {
                    duplicates += 1;
                } else {
                    lookup.insert(k.as_str(), take_index(row)?);
                }
            }
        }
        if duplicates > 0 {
            warn!("{duplicates} duplicate \"{key}\" values on the right side of a join were ignored");
        }

        let indices: UInt32Array = left_keys
            .iter()
            .map(|k| k.as_deref().and_then(|k| lookup.get(k).copied()))
            .collect();

        let schema = self.batch.schema();
        let mut fields: Vec<Field> = schema.fields().iter().map(|f| f.as_ref().clone()).collect();
        let mut columns = self.batch.columns().to_vec();
        for (field, array) in right.schema().fields().iter().zip(right.batch.columns()) {
            if field.name() == key {
                continue;
            }
            if schema.column_with_name(field.name()).is_some() {
                return Err(SluiceError::InvalidTable(format!(
                    "column \"{}\" exists on both sides of the join",
                    field.name()
                )));
            }
            fields.push(field.as_ref().clone().with_nullable(true));
            columns.push(take(array.as_ref(), &indices, None)?);
        }

        let batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)?;
        Self::try_new(batch)
    }

    /// Replaces every missing cell with `sentinel`.
    ///
    /// Numeric columns receive the number itself (float NaN counts as missing), boolean columns
    /// are widened to `Int64` first, and every other column is rendered as text and receives the
    /// sentinel's text form.
    pub fn fill_missing(&self, sentinel: i64) -> Result<TableValue> {
        let schema = self.batch.schema();
        let mut fields = Vec::with_capacity(self.num_columns());
        let mut columns = Vec::with_capacity(self.num_columns());

        for (field, array) in schema.fields().iter().zip(self.batch.columns()) {
            let filled = fill_column(array, sentinel)?;
            fields.push(Field::new(
                field.name(),
                filled.data_type().clone(),
                filled.null_count() > 0,
            ));
            columns.push(filled);
        }

        let batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)?;
        Self::try_new(batch)
    }

    /// Writes the table as CSV. Nulls become empty fields, which PostgreSQL's CSV `COPY` reads
    /// back as NULL.
    pub fn write_csv<W: Write>(&self, writer: W, header: bool) -> Result<()> {
        let mut writer = WriterBuilder::new().with_header(header).build(writer);
        writer.write(&self.batch)?;
        Ok(())
    }

    pub fn to_csv_bytes(&self, header: bool) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.write_csv(&mut out, header)?;
        Ok(out)
    }
}

/// Row position as a `take` index. Right sides beyond `u32::MAX` rows cannot be joined.
fn take_index(row: usize) -> Result<u32> {
    u32::try_from(row).map_err(|_| {
        SluiceError::InvalidTable(format!(
            "right side of a join has more than {} rows",
            u32::MAX
        ))
    })
}

fn key_strings(array: &ArrayRef) -> Result<Vec<Option<String>>> {
    let rendered = cast(array.as_ref(), &DataType::Utf8)?;
    let strings = rendered
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| SluiceError::InvalidTable("join key is not castable to text".into()))?;
    Ok(strings.iter().map(|v| v.map(str::to_string)).collect())
}

fn fill_column(array: &ArrayRef, sentinel: i64) -> Result<ArrayRef> {
    let filled: ArrayRef = match array.data_type() {
        DataType::Float64 | DataType::Float32 | DataType::Float16 => {
            let floats = cast(array.as_ref(), &DataType::Float64)?;
            let floats = floats
                .as_any()
                .downcast_ref::<Float64Array>()
                .ok_or_else(|| SluiceError::InvalidTable("float column did not cast".into()))?;
            let fill = sentinel as f64;
            Arc::new(
                floats
                    .iter()
                    .map(|v| Some(v.filter(|x| !x.is_nan()).unwrap_or(fill)))
                    .collect::<Float64Array>(),
            )
        }
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32
        | DataType::Boolean
        | DataType::Null => {
            let ints = cast(array.as_ref(), &DataType::Int64)?;
            let ints = ints
                .as_any()
                .downcast_ref::<Int64Array>()
                .ok_or_else(|| SluiceError::InvalidTable("integer column did not cast".into()))?;
            Arc::new(
                ints.iter()
                    .map(|v| Some(v.unwrap_or(sentinel)))
                    .collect::<Int64Array>(),
            )
        }
        _ => {
            let text = cast(array.as_ref(), &DataType::Utf8)?;
            let text = text
                .as_any()
                .downcast_ref::<StringArray>()
                .ok_or_else(|| SluiceError::InvalidTable("column did not cast to text".into()))?;
            let fill = sentinel.to_string();
            Arc::new(
                text.iter()
                    .map(|v| Some(v.unwrap_or(fill.as_str())))
                    .collect::<StringArray>(),
            )
        }
    };
    Ok(filled)
}
