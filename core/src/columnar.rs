//! Parquet encoding of result tables.
//!
//! Cache entries and processed snapshots are single-batch Parquet files.
//! Each column is stored under the Arrow type its values share: `Int64`,
//! `Float64` or `Utf8`. A column whose values mix types (SQLite allows it)
//! is stored as `Utf8` holding one JSON-encoded value per cell and listed in
//! the schema metadata, so it reads back with its variants intact.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, Float64Array, Int64Array, RecordBatch, RecordBatchOptions, StringArray,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;

use crate::{
    error::{PushError, PushResult},
    table::{Table, Value},
};

/// Schema metadata key listing the JSON-encoded columns.
pub const JSON_COLUMNS_KEY: &str = "pushlift.json_columns";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Integer,
    Real,
    Text,
    Mixed,
}

fn column_kind<'a>(values: impl Iterator<Item = &'a Value>) -> ColumnKind {
    let mut kind = None;
    for value in values {
        let this = match value {
            Value::Null => continue,
            Value::Integer(_) => ColumnKind::Integer,
            Value::Real(_) => ColumnKind::Real,
            Value::Text(_) => ColumnKind::Text,
        };
        match kind {
            None => kind = Some(this),
            Some(k) if k == this => {}
            Some(_) => return ColumnKind::Mixed,
        }
    }
    // All-null columns are written as nullable text.
    kind.unwrap_or(ColumnKind::Text)
}

// =============================================================================
// Table -> RecordBatch
// =============================================================================

pub fn table_to_record_batch(table: &Table) -> PushResult<RecordBatch> {
    let mut fields = Vec::with_capacity(table.columns().len());
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(table.columns().len());
    let mut json_columns: Vec<&str> = Vec::new();

    for (idx, name) in table.columns().iter().enumerate() {
        let (data_type, array): (DataType, ArrayRef) = match column_kind(table.column(idx)) {
            ColumnKind::Integer => {
                let values: Vec<Option<i64>> = table
                    .column(idx)
                    .map(|v| match v {
                        Value::Integer(i) => Some(*i),
                        _ => None,
                    })
                    .collect();
                (DataType::Int64, Arc::new(Int64Array::from(values)))
            }
            ColumnKind::Real => {
                let values: Vec<Option<f64>> = table
                    .column(idx)
                    .map(|v| match v {
                        Value::Real(f) => Some(*f),
                        _ => None,
                    })
                    .collect();
                (DataType::Float64, Arc::new(Float64Array::from(values)))
            }
            ColumnKind::Text => {
                let values: Vec<Option<&str>> = table
                    .column(idx)
                    .map(|v| match v {
                        Value::Text(s) => Some(s.as_str()),
                        _ => None,
                    })
                    .collect();
                (DataType::Utf8, Arc::new(StringArray::from(values)))
            }
            ColumnKind::Mixed => {
                let values = table
                    .column(idx)
                    .map(|v| match v {
                        Value::Null => Ok(None),
                        other => serde_json::to_string(other).map(Some),
                    })
                    .collect::<Result<Vec<Option<String>>, _>>()?;
                json_columns.push(name.as_str());
                (DataType::Utf8, Arc::new(StringArray::from(values)))
            }
        };
        fields.push(Field::new(name, data_type, true));
        columns.push(array);
    }

    let mut metadata = HashMap::new();
    if !json_columns.is_empty() {
        metadata.insert(
            JSON_COLUMNS_KEY.to_string(),
            serde_json::to_string(&json_columns)?,
        );
    }
    let schema: SchemaRef = Arc::new(Schema::new_with_metadata(fields, metadata));
    let options = RecordBatchOptions::new().with_row_count(Some(table.len()));
    Ok(RecordBatch::try_new_with_options(schema, columns, &options)?)
}

// =============================================================================
// RecordBatch -> Table
// =============================================================================

fn json_columns(schema: &Schema) -> PushResult<Vec<String>> {
    match schema.metadata().get(JSON_COLUMNS_KEY) {
        Some(list) => Ok(serde_json::from_str(list)?),
        None => Ok(Vec::new()),
    }
}

fn downcast<'a, T: 'static>(field: &Field, array: &'a ArrayRef) -> PushResult<&'a T> {
    array.as_any().downcast_ref::<T>().ok_or_else(|| {
        PushError::SchemaMismatch(format!(
            "column '{}' does not match its declared type {}",
            field.name(),
            field.data_type()
        ))
    })
}

fn column_values(field: &Field, array: &ArrayRef, json_encoded: bool) -> PushResult<Vec<Value>> {
    let len = array.len();
    match array.data_type() {
        DataType::Int64 => {
            let a = downcast::<Int64Array>(field, array)?;
            Ok((0..len)
                .map(|i| {
                    if a.is_null(i) {
                        Value::Null
                    } else {
                        Value::Integer(a.value(i))
                    }
                })
                .collect())
        }
        DataType::Float64 => {
            let a = downcast::<Float64Array>(field, array)?;
            Ok((0..len)
                .map(|i| {
                    if a.is_null(i) {
                        Value::Null
                    } else {
                        Value::Real(a.value(i))
                    }
                })
                .collect())
        }
        DataType::Utf8 => {
            let a = downcast::<StringArray>(field, array)?;
            (0..len)
                .map(|i| -> PushResult<Value> {
                    if a.is_null(i) {
                        Ok(Value::Null)
                    } else if json_encoded {
                        Ok(serde_json::from_str(a.value(i))?)
                    } else {
                        Ok(Value::Text(a.value(i).to_string()))
                    }
                })
                .collect()
        }
        DataType::Null => Ok(vec![Value::Null; len]),
        other => Err(PushError::SchemaMismatch(format!(
            "column '{}' has unsupported type {other}",
            field.name()
        ))),
    }
}

/// Append the rows of `batch` to `table`. Column names must match.
pub fn append_record_batch(table: &mut Table, batch: &RecordBatch) -> PushResult<()> {
    let schema = batch.schema();
    let names: Vec<&String> = schema.fields().iter().map(|f| f.name()).collect();
    let same_columns = names.len() == table.columns().len()
        && names.iter().zip(table.columns()).all(|(a, b)| *a == b);
    if !same_columns {
        return Err(PushError::SchemaMismatch(format!(
            "batch columns [{}] do not match table columns [{}]",
            names.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", "),
            table.columns().join(", ")
        )));
    }

    let json = json_columns(&schema)?;
    let mut columns = Vec::with_capacity(names.len());
    for (field, array) in schema.fields().iter().zip(batch.columns()) {
        let encoded = json.iter().any(|c| c == field.name());
        columns.push(column_values(field, array, encoded)?.into_iter());
    }

    for _ in 0..batch.num_rows() {
        let row: Vec<Value> = columns
            .iter_mut()
            .map(|c| c.next().unwrap_or(Value::Null))
            .collect();
        table.push_row(row)?;
    }
    Ok(())
}

// =============================================================================
// Files
// =============================================================================

/// Write `table` as a Parquet file, replacing any file at `path`.
pub fn write_parquet(table: &Table, path: &Path) -> PushResult<()> {
    let batch = table_to_record_batch(table)?;

    let file = File::create(path)?;
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();

    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(())
}

pub fn read_parquet(path: &Path) -> PushResult<Table> {
    let file = File::open(path)?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
    let columns = builder
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .collect();
    let reader = builder.build()?;

    let mut table = Table::new(columns);
    for batch in reader {
        append_record_batch(&mut table, &batch?)?;
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Table {
        let mut t = Table::with_columns(&["user_id", "push_count", "rate", "first_push"]);
        t.push_row(vec![
            Value::Text("a".into()),
            Value::Integer(3),
            Value::Real(0.25),
            Value::Text("2025-05-22 10:00:00".into()),
        ])
        .unwrap();
        t.push_row(vec![
            Value::Text("b".into()),
            Value::Integer(1),
            Value::Null,
            Value::Null,
        ])
        .unwrap();
        t
    }

    #[test]
    fn parquet_file_preserves_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.parquet");
        write_parquet(&sample(), &path).unwrap();
        assert_eq!(read_parquet(&path).unwrap(), sample());
    }

    #[test]
    fn column_types_follow_values() {
        let batch = table_to_record_batch(&sample()).unwrap();
        assert_eq!(batch.num_rows(), 2);
        let types: Vec<DataType> = batch
            .schema()
            .fields()
            .iter()
            .map(|f| f.data_type().clone())
            .collect();
        assert_eq!(
            types,
            vec![DataType::Utf8, DataType::Int64, DataType::Float64, DataType::Utf8]
        );
        assert!(batch.schema().metadata().get(JSON_COLUMNS_KEY).is_none());
    }

    #[test]
    fn integral_reals_stay_real() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reals.parquet");
        let mut t = Table::with_columns(&["x"]);
        t.push_row(vec![Value::Real(2.0)]).unwrap();
        write_parquet(&t, &path).unwrap();
        assert_eq!(read_parquet(&path).unwrap(), t);
    }

    #[test]
    fn mixed_columns_keep_their_variants() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mixed.parquet");
        let mut t = Table::with_columns(&["v", "n"]);
        t.push_row(vec![Value::Integer(7), Value::Null]).unwrap();
        t.push_row(vec![Value::Real(2.0), Value::Null]).unwrap();
        t.push_row(vec![Value::Text("7".into()), Value::Null]).unwrap();
        t.push_row(vec![Value::Null, Value::Null]).unwrap();

        let batch = table_to_record_batch(&t).unwrap();
        assert_eq!(
            batch.schema().metadata().get(JSON_COLUMNS_KEY).map(String::as_str),
            Some("[\"v\"]")
        );

        write_parquet(&t, &path).unwrap();
        assert_eq!(read_parquet(&path).unwrap(), t);
    }

    #[test]
    fn empty_table_keeps_its_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.parquet");
        let t = Table::with_columns(&["user_id", "push_count"]);
        write_parquet(&t, &path).unwrap();
        let back = read_parquet(&path).unwrap();
        assert!(back.is_empty());
        assert_eq!(back.columns(), t.columns());
    }

    #[test]
    fn garbage_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("torn.parquet");
        std::fs::write(&path, b"PAR1\x00\x01torn").unwrap();
        assert!(read_parquet(&path).is_err());
    }

    #[test]
    fn batch_with_other_columns_is_rejected() {
        let batch = table_to_record_batch(&sample()).unwrap();
        let mut other = Table::with_columns(&["user_id"]);
        assert!(matches!(
            append_record_batch(&mut other, &batch),
            Err(PushError::SchemaMismatch(_))
        ));
    }
}
