//! Named query parameters.
//!
//! The same parameter set is bound into the statement and rendered into the
//! cache key, so a filter value never reaches the SQL text itself.

use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Null,
    Int(i64),
    Text(String),
    IntList(Vec<i64>),
    TextList(Vec<String>),
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Text(v)
    }
}

impl From<Vec<i64>> for ParamValue {
    fn from(v: Vec<i64>) -> Self {
        ParamValue::IntList(v)
    }
}

impl From<Vec<String>> for ParamValue {
    fn from(v: Vec<String>) -> Self {
        ParamValue::TextList(v)
    }
}

impl<T: Into<ParamValue>> From<Option<T>> for ParamValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(ParamValue::Null, Into::into)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryParams(BTreeMap<String, ParamValue>);

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<ParamValue>) -> Self {
        self.0.insert(name.to_string(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.0.get(name)
    }

    /// Stable rendering: keys sorted, JSON encoded.
    pub fn render(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_default()
    }

    /// Flatten into `(":name", value)` bindings; list entries become
    /// `:name_0`, `:name_1`, ...
    pub fn bindings(&self) -> Vec<(String, rusqlite::types::Value)> {
        use rusqlite::types::Value as Sql;
        let mut out = Vec::new();
        for (name, value) in &self.0 {
            match value {
                ParamValue::Null => out.push((format!(":{name}"), Sql::Null)),
                ParamValue::Int(i) => out.push((format!(":{name}"), Sql::Integer(*i))),
                ParamValue::Text(s) => out.push((format!(":{name}"), Sql::Text(s.clone()))),
                ParamValue::IntList(items) => {
                    for (i, item) in items.iter().enumerate() {
                        out.push((format!(":{name}_{i}"), Sql::Integer(*item)));
                    }
                }
                ParamValue::TextList(items) => {
                    for (i, item) in items.iter().enumerate() {
                        out.push((format!(":{name}_{i}"), Sql::Text(item.clone())));
                    }
                }
            }
        }
        out
    }
}

/// Placeholder list for a list parameter: `:name_0, :name_1, ...`.
pub fn list_placeholders(name: &str, len: usize) -> String {
    (0..len)
        .map(|i| format!(":{name}_{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}
