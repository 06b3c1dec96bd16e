//! Column-labelled result tables.
//!
//! Every query result crosses into the pipeline as a `Table`. Typed records
//! are parsed out of rows through `Tabular`, so a column that drifts in
//! name or type fails here instead of in the aggregation stage.

use crate::{
    error::{PushError, PushResult},
    types::TIMESTAMP_FORMAT,
};
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Integer(_) => "integer",
            Value::Real(_) => "real",
            Value::Text(_) => "text",
        }
    }

    pub fn timestamp(ts: Option<NaiveDateTime>) -> Value {
        ts.map_or(Value::Null, |t| Value::Text(t.format(TIMESTAMP_FORMAT).to_string()))
    }

    pub fn opt_text(s: Option<&str>) -> Value {
        s.map_or(Value::Null, |s| Value::Text(s.to_string()))
    }

    pub fn opt_real(v: Option<f64>) -> Value {
        v.map_or(Value::Null, Value::Real)
    }
}

impl From<rusqlite::types::ValueRef<'_>> for Value {
    fn from(v: rusqlite::types::ValueRef<'_>) -> Self {
        use rusqlite::types::ValueRef;
        match v {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::Integer(i),
            ValueRef::Real(f) => Value::Real(f),
            ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
                Value::Text(String::from_utf8_lossy(bytes).into_owned())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn with_columns(columns: &[&str]) -> Self {
        Self::new(columns.iter().map(|c| c.to_string()).collect())
    }

    pub fn push_row(&mut self, row: Vec<Value>) -> PushResult<()> {
        if row.len() != self.columns.len() {
            return Err(PushError::SchemaMismatch(format!(
                "row has {} values, table has {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Values of the column at `idx`, top to bottom.
    pub fn column(&self, idx: usize) -> impl Iterator<Item = &Value> + '_ {
        self.rows.iter().map(move |row| &row[idx])
    }

    pub fn rows(&self) -> impl Iterator<Item = Row<'_>> {
        self.rows.iter().map(move |values| Row {
            columns: &self.columns,
            values,
        })
    }

    /// Append a column, filling every existing row via `fill`.
    pub fn add_column(&mut self, name: &str, mut fill: impl FnMut(&Row<'_>) -> Value) {
        let new_values: Vec<Value> = self.rows().map(|row| fill(&row)).collect();
        self.columns.push(name.to_string());
        for (row, value) in self.rows.iter_mut().zip(new_values) {
            row.push(value);
        }
    }

    /// Replace a column's values in place, or append it when absent.
    pub fn set_column(&mut self, name: &str, mut fill: impl FnMut(&Row<'_>) -> Value) {
        match self.column_index(name) {
            Some(idx) => {
                let new_values: Vec<Value> = self.rows().map(|row| fill(&row)).collect();
                for (row, value) in self.rows.iter_mut().zip(new_values) {
                    row[idx] = value;
                }
            }
            None => self.add_column(name, fill),
        }
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&Row<'_>) -> bool) {
        let columns = &self.columns;
        self.rows.retain(|values| keep(&Row { columns, values }));
    }

    /// Project onto `columns` in the given order. Columns absent from this
    /// table are filled with `Value::Null`.
    pub fn reorder(&self, columns: &[String]) -> Table {
        let indices: Vec<Option<usize>> = columns.iter().map(|c| self.column_index(c)).collect();
        let rows = self
            .rows
            .iter()
            .map(|row| {
                indices
                    .iter()
                    .map(|idx| idx.map_or(Value::Null, |i| row[i].clone()))
                    .collect()
            })
            .collect();
        Table {
            columns: columns.to_vec(),
            rows,
        }
    }

    /// Union of two tables with identical column lists.
    pub fn concat(mut self, other: Table) -> PushResult<Table> {
        if self.columns != other.columns {
            return Err(PushError::SchemaMismatch(format!(
                "cannot concatenate [{}] with [{}]",
                self.columns.join(", "),
                other.columns.join(", ")
            )));
        }
        self.rows.extend(other.rows);
        Ok(self)
    }

    pub fn from_records<T: Tabular>(records: &[T]) -> Table {
        Table {
            columns: T::COLUMNS.iter().map(|c| c.to_string()).collect(),
            rows: records.iter().map(Tabular::to_row).collect(),
        }
    }

    pub fn to_records<T: Tabular>(&self) -> PushResult<Vec<T>> {
        self.rows().map(|row| T::from_row(&row)).collect()
    }
}

/// Borrowed view of one table row.
pub struct Row<'a> {
    columns: &'a [String],
    values: &'a [Value],
}

impl<'a> Row<'a> {
    pub fn get(&self, column: &str) -> Option<&'a Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|i| &self.values[i])
    }

    fn require(&self, column: &str) -> PushResult<&'a Value> {
        self.get(column).ok_or_else(|| PushError::MissingColumn {
            column: column.to_string(),
        })
    }

    fn mismatch(column: &str, expected: &'static str, found: &Value) -> PushError {
        PushError::ColumnType {
            column: column.to_string(),
            expected,
            found: found.type_name().to_string(),
        }
    }

    /// Text value; integers are rendered, blanks kept. Null is `None`.
    pub fn opt_text(&self, column: &str) -> PushResult<Option<String>> {
        match self.require(column)? {
            Value::Null => Ok(None),
            Value::Text(s) => Ok(Some(s.clone())),
            Value::Integer(i) => Ok(Some(i.to_string())),
            other => Err(Self::mismatch(column, "text", other)),
        }
    }

    pub fn text(&self, column: &str) -> PushResult<String> {
        self.opt_text(column)?
            .ok_or_else(|| Self::mismatch(column, "text", &Value::Null))
    }

    pub fn opt_int(&self, column: &str) -> PushResult<Option<i64>> {
        match self.require(column)? {
            Value::Null => Ok(None),
            Value::Integer(i) => Ok(Some(*i)),
            Value::Real(f) if f.fract() == 0.0 => Ok(Some(*f as i64)),
            other => Err(Self::mismatch(column, "integer", other)),
        }
    }

    /// Integer value with null read as zero (aggregates over no rows).
    pub fn int_or_zero(&self, column: &str) -> PushResult<i64> {
        Ok(self.opt_int(column)?.unwrap_or(0))
    }

    pub fn opt_real(&self, column: &str) -> PushResult<Option<f64>> {
        match self.require(column)? {
            Value::Null => Ok(None),
            Value::Integer(i) => Ok(Some(*i as f64)),
            Value::Real(f) => Ok(Some(*f)),
            other => Err(Self::mismatch(column, "real", other)),
        }
    }

    pub fn real_or_zero(&self, column: &str) -> PushResult<f64> {
        Ok(self.opt_real(column)?.unwrap_or(0.0))
    }

    pub fn opt_timestamp(&self, column: &str) -> PushResult<Option<NaiveDateTime>> {
        match self.require(column)? {
            Value::Null => Ok(None),
            Value::Text(s) => parse_timestamp(s)
                .map(Some)
                .ok_or_else(|| Self::mismatch(column, "timestamp", &Value::Text(s.clone()))),
            other => Err(Self::mismatch(column, "timestamp", other)),
        }
    }
}

/// Parse the timestamp renderings both stores emit.
pub fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    const FORMATS: [&str; 4] = [
        TIMESTAMP_FORMAT,
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
    ];
    let s = s.trim();
    FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

/// A record type with a fixed column layout.
pub trait Tabular: Sized {
    const COLUMNS: &'static [&'static str];

    fn to_row(&self) -> Vec<Value>;

    fn from_row(row: &Row<'_>) -> PushResult<Self>;
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
    fn row_length_must_match() {
        let mut t = Table::with_columns(&["a", "b"]);
        assert!(t.push_row(vec![Value::Null]).is_err());
    }

    #[test]
    fn typed_accessors_validate() {
        let t = sample();
        let row = t.rows().next().unwrap();
        assert_eq!(row.text("user_id").unwrap(), "a");
        assert_eq!(row.opt_int("push_count").unwrap(), Some(3));
        assert_eq!(row.opt_real("push_count").unwrap(), Some(3.0));
        assert!(row.opt_timestamp("first_push").unwrap().is_some());
        assert!(matches!(
            row.opt_int("user_id"),
            Err(PushError::ColumnType { .. })
        ));
        assert!(matches!(
            row.opt_int("missing"),
            Err(PushError::MissingColumn { .. })
        ));
    }

    #[test]
    fn reorder_fills_absent_columns_with_null() {
        let t = sample();
        let cols: Vec<String> = ["rate", "extra", "user_id"].iter().map(|s| s.to_string()).collect();
        let r = t.reorder(&cols);
        assert_eq!(r.columns(), cols.as_slice());
        let row = r.rows().next().unwrap();
        assert_eq!(row.get("extra"), Some(&Value::Null));
        assert_eq!(row.get("user_id"), Some(&Value::Text("a".into())));
    }

    #[test]
    fn concat_requires_identical_columns() {
        let a = sample();
        let b = sample();
        assert_eq!(a.clone().concat(b).unwrap().len(), 4);
        let c = Table::with_columns(&["user_id"]);
        assert!(a.concat(c).is_err());
    }

    #[test]
    fn sub_second_timestamps_survive_rendering() {
        let ts = NaiveDate::from_ymd_opt(2025, 5, 22)
            .unwrap()
            .and_hms_milli_opt(10, 0, 0, 250)
            .unwrap();
        let whole = NaiveDate::from_ymd_opt(2025, 5, 22)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();
        assert_eq!(
            Value::timestamp(Some(whole)),
            Value::Text("2025-05-22 10:00:00".into())
        );

        let mut t = Table::with_columns(&["at"]);
        t.push_row(vec![Value::timestamp(Some(ts))]).unwrap();
        let row = t.rows().next().unwrap();
        assert_eq!(row.get("at"), Some(&Value::Text("2025-05-22 10:00:00.250".into())));
        assert_eq!(row.opt_timestamp("at").unwrap(), Some(ts));
    }

    #[test]
    fn timestamp_formats_parse() {
        assert!(parse_timestamp("2025-05-22 10:00:00").is_some());
        assert!(parse_timestamp("2025-05-22T10:00:00").is_some());
        assert!(parse_timestamp("2025-05-22 10:00:00.123").is_some());
        assert!(parse_timestamp("2025-05-22").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }
}
