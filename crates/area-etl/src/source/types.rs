//! Raw value and row types produced by source readers.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

/// A raw column value as read from the legacy source, before coercion.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Null,
    Bool(bool),
    I64(i64),
    F64(f64),
    Decimal(Decimal),
    Text(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
    /// Date-only legacy value
    Date(NaiveDate),
    /// Naive legacy timestamp; interpreted as UTC by convention
    DateTime(NaiveDateTime),
    DateTimeUtc(DateTime<Utc>),
}

impl RawValue {
    pub fn is_null(&self) -> bool {
        matches!(self, RawValue::Null)
    }

    /// Trimmed text content, when this value is textual. Empty after
    /// trimming counts as absent.
    pub fn as_trimmed_text(&self) -> Option<&str> {
        match self {
            RawValue::Text(s) => {
                let t = s.trim();
                if t.is_empty() {
                    None
                } else {
                    Some(t)
                }
            }
            _ => None,
        }
    }

    /// JSON rendering used when packing unmapped columns into `extra`.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            RawValue::Null => Value::Null,
            RawValue::Bool(b) => Value::Bool(*b),
            RawValue::I64(n) => Value::from(*n),
            RawValue::F64(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            RawValue::Decimal(d) => Value::String(d.to_string()),
            RawValue::Text(s) => Value::String(s.clone()),
            RawValue::Bytes(b) => Value::String(hex::encode(b)),
            RawValue::Uuid(u) => Value::String(u.to_string()),
            RawValue::Date(d) => Value::String(d.to_string()),
            RawValue::DateTime(dt) => Value::String(dt.format("%Y-%m-%d %H:%M:%S").to_string()),
            RawValue::DateTimeUtc(dt) => Value::String(dt.to_rfc3339()),
        }
    }
}

/// One row from the legacy source: ordered `(column, value)` pairs.
#[derive(Debug, Clone, Default)]
pub struct SourceRow {
    pub columns: Vec<(String, RawValue)>,
}

impl SourceRow {
    pub fn new(columns: Vec<(String, RawValue)>) -> Self {
        Self { columns }
    }

    /// Value of a column; missing columns read as null.
    pub fn get(&self, name: &str) -> &RawValue {
        self.columns
            .iter()
            .find(|(col, _)| col == name)
            .map(|(_, v)| v)
            .unwrap_or(&RawValue::Null)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|(col, _)| col == name)
    }
}
