//! Generic row representation and SQL <-> JSON value mapping.
//!
//! The store is table-agnostic: a row is a JSON object keyed by column name
//! plus the two local control flags. Domain crates work with typed views on
//! top; replication only ever needs the field map.

use crate::config::{FieldMap, TableConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A row as held by the local store.
///
/// `fields` carries the replicated projection (the columns listed in the
/// table config); `synced` and `deleted` are local-only control flags and
/// never appear inside `fields`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRow {
    pub fields: FieldMap,
    pub synced: bool,
    pub deleted: bool,
}

impl StoredRow {
    /// A freshly authored local row: unsynced, not deleted.
    pub fn new(fields: FieldMap) -> Self {
        Self {
            fields,
            synced: false,
            deleted: false,
        }
    }

    /// The row's primary key under the given config, as a string.
    pub fn key(&self, config: &TableConfig) -> String {
        match self.fields.get(config.primary_key) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        }
    }

    /// The row's `updated_at` timestamp, or the empty string when unset.
    pub fn updated_at(&self) -> &str {
        self.fields
            .get("updated_at")
            .and_then(Value::as_str)
            .unwrap_or("")
    }
}

/// Convert a JSON field value into an owned SQLite value for binding.
pub(crate) fn value_to_sql(value: &Value) -> rusqlite::types::Value {
    use rusqlite::types::Value as Sql;
    match value {
        Value::Null => Sql::Null,
        Value::Bool(b) => Sql::Integer(i64::from(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Sql::Integer(i)
            } else {
                Sql::Real(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => Sql::Text(s.clone()),
        // Nested JSON is persisted as its serialized form.
        other => Sql::Text(other.to_string()),
    }
}

/// Convert a SQLite column value back into a JSON field value.
pub(crate) fn sql_to_value(value: rusqlite::types::ValueRef<'_>) -> Value {
    use rusqlite::types::ValueRef;
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(_) => Value::Null,
    }
}
