//! Coercion of raw legacy rows into typed target records.
//!
//! Coercion failures are data-quality outcomes: the offending row is
//! quarantined with a [`QuarantineReason`] and the batch continues. Only
//! infrastructure errors abort a table.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde_json::Value;
use uuid::Uuid;

use crate::report::QuarantineReason;
use crate::schema::{EnumDomain, FieldSpec, FieldType, SchemaCatalog, TableSpec};
use crate::source::{RawValue, SourceRow};

/// A typed value bound for a target column.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Bool(bool),
    I16(i16),
    I32(i32),
    I64(i64),
    Decimal(Decimal),
    Text(String),
    Uuid(Uuid),
    Timestamp(DateTime<Utc>),
    Json(Value),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            FieldValue::Uuid(u) => Some(*u),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::Null => Value::Null,
            FieldValue::Bool(b) => Value::Bool(*b),
            FieldValue::I16(n) => Value::from(*n),
            FieldValue::I32(n) => Value::from(*n),
            FieldValue::I64(n) => Value::from(*n),
            FieldValue::Decimal(d) => Value::String(d.to_string()),
            FieldValue::Text(s) => Value::String(s.clone()),
            FieldValue::Uuid(u) => Value::String(u.to_string()),
            FieldValue::Timestamp(t) => Value::String(t.to_rfc3339()),
            FieldValue::Json(v) => v.clone(),
        }
    }
}

/// A coerced row keyed by target field name, in catalog field order.
#[derive(Debug, Clone)]
pub struct Record {
    pub table: String,
    /// Legacy unique key, when the table declares a `source_key` column.
    pub source_key: Option<String>,
    fields: Vec<(String, FieldValue)>,
}

impl Record {
    /// A record with one null slot per catalog field, in declared order.
    pub fn new(spec: &TableSpec) -> Self {
        Self {
            table: spec.name.clone(),
            source_key: None,
            fields: spec
                .fields
                .iter()
                .map(|f| (f.name.clone(), FieldValue::Null))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> &FieldValue {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
            .unwrap_or(&FieldValue::Null)
    }

    pub fn set(&mut self, name: &str, value: FieldValue) {
        if let Some(slot) = self.fields.iter_mut().find(|(n, _)| n == name) {
            slot.1 = value;
        } else {
            self.fields.push((name.to_string(), value));
        }
    }

    pub fn fields(&self) -> &[(String, FieldValue)] {
        &self.fields
    }

    /// Column values in the given order, nulls included.
    pub fn values_for(&self, columns: &[String]) -> Vec<FieldValue> {
        columns.iter().map(|c| self.get(c).clone()).collect()
    }
}

/// Coerce one raw source row into a [`Record`].
///
/// FK-backed fields and the minted primary key are left null here; the
/// transform stage fills them via the identity registry. Unmapped source
/// columns are packed into the table's `extra` JSON field when one is
/// declared.
pub fn coerce_row(
    spec: &TableSpec,
    catalog: &SchemaCatalog,
    row: &SourceRow,
) -> std::result::Result<Record, QuarantineReason> {
    let mut record = Record::new(spec);
    record.source_key = spec
        .source_key
        .as_deref()
        .and_then(|col| row.get(col).as_trimmed_text())
        .map(|s| s.to_string());

    for field in &spec.fields {
        if spec.fk_for_field(&field.name).is_some() || field.name == spec.primary_key {
            continue;
        }
        let Some(source_col) = field.source.as_deref() else {
            continue;
        };
        let domain = field
            .domain
            .as_deref()
            .and_then(|name| catalog.domain(name));
        let value = coerce_value(field, domain, row.get(source_col))?;
        record.set(&field.name, value);
    }

    if let Some(extra_name) = &spec.extra_field {
        let extra = pack_extra(spec, row);
        if !extra.is_empty() {
            record.set(extra_name, FieldValue::Json(Value::Object(extra)));
        }
    }

    Ok(record)
}

/// Source columns not consumed by any field, FK edge or flag column, packed
/// as lowercase-keyed JSON.
fn pack_extra(spec: &TableSpec, row: &SourceRow) -> serde_json::Map<String, Value> {
    let mut mapped: Vec<&str> = spec
        .fields
        .iter()
        .filter_map(|f| f.source.as_deref())
        .collect();
    for fk in &spec.foreign_keys {
        if let Some(col) = fk.source.as_deref() {
            mapped.push(col);
        } else if let Some(field) = spec.field(&fk.field) {
            if let Some(col) = field.source.as_deref() {
                mapped.push(col);
            }
        }
    }
    if let Some(col) = spec.source_key.as_deref() {
        mapped.push(col);
    }
    if let Some(col) = spec.disabled_flag.as_deref() {
        mapped.push(col);
    }

    let mut extra = serde_json::Map::new();
    for (name, value) in &row.columns {
        if mapped.iter().any(|m| m.eq_ignore_ascii_case(name)) {
            continue;
        }
        if value.is_null() {
            continue;
        }
        extra.insert(name.to_lowercase(), value.to_json());
    }
    extra
}

/// Coerce one raw value to the field's semantic type.
pub fn coerce_value(
    field: &FieldSpec,
    domain: Option<&EnumDomain>,
    raw: &RawValue,
) -> std::result::Result<FieldValue, QuarantineReason> {
    match &field.field_type {
        FieldType::Text => coerce_text(field, domain, raw),
        FieldType::Bool => coerce_bool(field, raw),
        FieldType::SmallInt | FieldType::Integer | FieldType::BigInt => coerce_int(field, raw),
        FieldType::Decimal { precision, scale } => coerce_decimal(field, raw, *precision, *scale),
        FieldType::Timestamp => coerce_timestamp(field, raw),
        FieldType::Uuid => coerce_uuid(field, raw),
        FieldType::Json => Ok(coerce_json(raw)),
    }
}

fn invalid(field: &FieldSpec, raw: &RawValue) -> QuarantineReason {
    QuarantineReason::InvalidEnumValue {
        field: field.name.clone(),
        value: render_raw(raw),
    }
}

fn overflow(field: &FieldSpec, raw: &RawValue) -> QuarantineReason {
    QuarantineReason::NumericOverflow {
        field: field.name.clone(),
        value: render_raw(raw),
    }
}

fn render_raw(raw: &RawValue) -> String {
    match raw.to_json() {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

fn coerce_text(
    field: &FieldSpec,
    domain: Option<&EnumDomain>,
    raw: &RawValue,
) -> std::result::Result<FieldValue, QuarantineReason> {
    let text = match raw {
        RawValue::Null => None,
        RawValue::Text(_) => raw.as_trimmed_text().map(|s| s.to_string()),
        RawValue::I64(n) => Some(n.to_string()),
        RawValue::F64(n) => Some(n.to_string()),
        RawValue::Decimal(d) => Some(d.to_string()),
        RawValue::Uuid(u) => Some(u.to_string()),
        RawValue::Bool(b) => Some(if *b { "true" } else { "false" }.to_string()),
        RawValue::Date(d) => Some(d.to_string()),
        RawValue::DateTime(dt) => Some(dt.format("%Y-%m-%d %H:%M:%S").to_string()),
        RawValue::DateTimeUtc(dt) => Some(dt.to_rfc3339()),
        RawValue::Bytes(b) => Some(hex::encode(b)),
    };

    match domain {
        Some(d) => match &text {
            Some(s) => match d.canonical(s) {
                Some(canon) => Ok(FieldValue::Text(canon)),
                None => Err(invalid(field, raw)),
            },
            // Null input falls back to the domain default when declared.
            None => Ok(d
                .default
                .clone()
                .map(FieldValue::Text)
                .unwrap_or(FieldValue::Null)),
        },
        None => Ok(text.map(FieldValue::Text).unwrap_or(FieldValue::Null)),
    }
}

fn coerce_bool(
    field: &FieldSpec,
    raw: &RawValue,
) -> std::result::Result<FieldValue, QuarantineReason> {
    match raw {
        RawValue::Null => Ok(FieldValue::Null),
        RawValue::Bool(b) => Ok(FieldValue::Bool(*b)),
        RawValue::I64(0) => Ok(FieldValue::Bool(false)),
        RawValue::I64(1) => Ok(FieldValue::Bool(true)),
        RawValue::Decimal(d) if d.is_zero() => Ok(FieldValue::Bool(false)),
        RawValue::Decimal(d) if *d == Decimal::ONE => Ok(FieldValue::Bool(true)),
        RawValue::Text(_) => match raw.as_trimmed_text() {
            None => Ok(FieldValue::Null),
            // Legacy flags: S/N (si/no) alongside the usual spellings.
            Some(s) => match s.to_uppercase().as_str() {
                "S" | "Y" | "T" | "TRUE" | "1" => Ok(FieldValue::Bool(true)),
                "N" | "F" | "FALSE" | "0" => Ok(FieldValue::Bool(false)),
                _ => Err(invalid(field, raw)),
            },
        },
        _ => Err(invalid(field, raw)),
    }
}

fn coerce_int(
    field: &FieldSpec,
    raw: &RawValue,
) -> std::result::Result<FieldValue, QuarantineReason> {
    let n: i64 = match raw {
        RawValue::Null => return Ok(FieldValue::Null),
        RawValue::I64(n) => *n,
        RawValue::Bool(b) => i64::from(*b),
        RawValue::F64(x) if x.fract() == 0.0 && x.abs() < i64::MAX as f64 => *x as i64,
        RawValue::Decimal(d) if d.fract().is_zero() => {
            d.to_i64().ok_or_else(|| overflow(field, raw))?
        }
        RawValue::Text(_) => match raw.as_trimmed_text() {
            None if field.blank_as_zero => 0,
            None => return Ok(FieldValue::Null),
            Some("?") if field.blank_as_zero => 0,
            Some(s) => s.parse::<i64>().map_err(|_| overflow(field, raw))?,
        },
        _ => return Err(overflow(field, raw)),
    };

    match field.field_type {
        FieldType::SmallInt => i16::try_from(n)
            .map(FieldValue::I16)
            .map_err(|_| overflow(field, raw)),
        FieldType::Integer => i32::try_from(n)
            .map(FieldValue::I32)
            .map_err(|_| overflow(field, raw)),
        _ => Ok(FieldValue::I64(n)),
    }
}

fn coerce_decimal(
    field: &FieldSpec,
    raw: &RawValue,
    precision: u32,
    scale: u32,
) -> std::result::Result<FieldValue, QuarantineReason> {
    let d: Decimal = match raw {
        RawValue::Null => return Ok(FieldValue::Null),
        RawValue::Decimal(d) => *d,
        RawValue::I64(n) => Decimal::from(*n),
        RawValue::F64(x) => Decimal::from_f64(*x).ok_or_else(|| overflow(field, raw))?,
        RawValue::Text(_) => match raw.as_trimmed_text() {
            None if field.blank_as_zero => Decimal::ZERO,
            None => return Ok(FieldValue::Null),
            Some("?") if field.blank_as_zero => Decimal::ZERO,
            Some(s) => s.parse::<Decimal>().map_err(|_| overflow(field, raw))?,
        },
        _ => return Err(overflow(field, raw)),
    };

    let rounded = d.round_dp(scale);
    // More integer digits than precision allows is an overflow; rounding to
    // scale is silent.
    if precision > scale && precision - scale <= 28 {
        let limit = Decimal::from_i128_with_scale(10i128.pow(precision - scale), 0);
        if rounded.abs() >= limit {
            return Err(overflow(field, raw));
        }
    }
    Ok(FieldValue::Decimal(rounded))
}

fn coerce_timestamp(
    field: &FieldSpec,
    raw: &RawValue,
) -> std::result::Result<FieldValue, QuarantineReason> {
    match raw {
        RawValue::Null => Ok(FieldValue::Null),
        RawValue::DateTimeUtc(dt) => Ok(FieldValue::Timestamp(*dt)),
        // Naive legacy timestamps carry no zone; treated as UTC by convention.
        RawValue::DateTime(naive) => Ok(FieldValue::Timestamp(Utc.from_utc_datetime(naive))),
        RawValue::Date(d) => Ok(FieldValue::Timestamp(midnight_utc(*d))),
        RawValue::Text(_) => match raw.as_trimmed_text() {
            None => Ok(FieldValue::Null),
            Some(s) => parse_timestamp(s)
                .map(FieldValue::Timestamp)
                .ok_or_else(|| invalid(field, raw)),
        },
        _ => Err(invalid(field, raw)),
    }
}

fn midnight_utc(d: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&d.and_hms_opt(0, 0, 0).unwrap_or_default())
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(midnight_utc(d));
    }
    None
}

fn coerce_uuid(
    field: &FieldSpec,
    raw: &RawValue,
) -> std::result::Result<FieldValue, QuarantineReason> {
    match raw {
        RawValue::Null => Ok(FieldValue::Null),
        RawValue::Uuid(u) => Ok(FieldValue::Uuid(*u)),
        RawValue::Text(_) => match raw.as_trimmed_text() {
            None => Ok(FieldValue::Null),
            Some(s) => Uuid::parse_str(s)
                .map(FieldValue::Uuid)
                .map_err(|_| invalid(field, raw)),
        },
        _ => Err(invalid(field, raw)),
    }
}

fn coerce_json(raw: &RawValue) -> FieldValue {
    match raw {
        RawValue::Null => FieldValue::Null,
        RawValue::Text(s) => {
            let t = s.trim();
            if t.is_empty() {
                FieldValue::Null
            } else {
                // Lenient: non-JSON text is kept as a JSON string.
                FieldValue::Json(
                    serde_json::from_str(t).unwrap_or_else(|_| Value::String(t.to_string())),
                )
            }
        }
        other => FieldValue::Json(other.to_json()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Normalize;

    fn field(name: &str, field_type: FieldType) -> FieldSpec {
        FieldSpec {
            name: name.to_string(),
            field_type,
            source: Some(name.to_uppercase()),
            nullable: true,
            domain: None,
            rule: None,
            blank_as_zero: false,
        }
    }

    #[test]
    fn test_bool_legacy_flags() {
        let f = field("is_active", FieldType::Bool);
        assert_eq!(
            coerce_value(&f, None, &RawValue::Text("S".into())).unwrap(),
            FieldValue::Bool(true)
        );
        assert_eq!(
            coerce_value(&f, None, &RawValue::Text(" n ".into())).unwrap(),
            FieldValue::Bool(false)
        );
        assert_eq!(
            coerce_value(&f, None, &RawValue::I64(1)).unwrap(),
            FieldValue::Bool(true)
        );
        assert!(coerce_value(&f, None, &RawValue::Text("boh".into())).is_err());
    }

    #[test]
    fn test_blank_as_zero() {
        let mut f = field("beds", FieldType::Integer);
        f.blank_as_zero = true;
        assert_eq!(
            coerce_value(&f, None, &RawValue::Text("".into())).unwrap(),
            FieldValue::I32(0)
        );
        assert_eq!(
            coerce_value(&f, None, &RawValue::Text("?".into())).unwrap(),
            FieldValue::I32(0)
        );
        assert_eq!(
            coerce_value(&f, None, &RawValue::Text("12".into())).unwrap(),
            FieldValue::I32(12)
        );

        let plain = field("beds", FieldType::Integer);
        assert_eq!(
            coerce_value(&plain, None, &RawValue::Text("".into())).unwrap(),
            FieldValue::Null
        );
        assert!(coerce_value(&plain, None, &RawValue::Text("?".into())).is_err());
    }

    #[test]
    fn test_int_range_check() {
        let f = field("level", FieldType::SmallInt);
        assert_eq!(
            coerce_value(&f, None, &RawValue::I64(7)).unwrap(),
            FieldValue::I16(7)
        );
        let err = coerce_value(&f, None, &RawValue::I64(40_000)).unwrap_err();
        assert!(matches!(err, QuarantineReason::NumericOverflow { .. }));
    }

    #[test]
    fn test_decimal_rounds_and_overflows() {
        let f = field(
            "latitude",
            FieldType::Decimal {
                precision: 9,
                scale: 6,
            },
        );
        let v = coerce_value(&f, None, &RawValue::Text("45.1234567".into())).unwrap();
        assert_eq!(v, FieldValue::Decimal("45.123457".parse().unwrap()));

        let err = coerce_value(&f, None, &RawValue::Text("1234.0".into())).unwrap_err();
        assert!(matches!(err, QuarantineReason::NumericOverflow { .. }));
    }

    #[test]
    fn test_date_only_promoted_to_midnight_utc() {
        let f = field("created_at", FieldType::Timestamp);
        let d = NaiveDate::from_ymd_opt(2019, 3, 14).unwrap();
        let v = coerce_value(&f, None, &RawValue::Date(d)).unwrap();
        assert_eq!(
            v,
            FieldValue::Timestamp(Utc.with_ymd_and_hms(2019, 3, 14, 0, 0, 0).unwrap())
        );

        let v = coerce_value(&f, None, &RawValue::Text("2019-03-14".into())).unwrap();
        assert_eq!(
            v,
            FieldValue::Timestamp(Utc.with_ymd_and_hms(2019, 3, 14, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_enum_domain_rejects_unknown() {
        let mut f = field("activity", FieldType::Text);
        f.domain = Some("node_activity".to_string());
        let d = EnumDomain {
            values: vec!["EROGA".into(), "NON_EROGA".into(), "MISTA".into()],
            normalize: Normalize::UpperUnderscore,
            ..Default::default()
        };
        assert_eq!(
            coerce_value(&f, Some(&d), &RawValue::Text("eroga".into())).unwrap(),
            FieldValue::Text("EROGA".into())
        );
        let err = coerce_value(&f, Some(&d), &RawValue::Text("INVALID".into())).unwrap_err();
        assert!(matches!(err, QuarantineReason::InvalidEnumValue { .. }));
    }

    #[test]
    fn test_trimmed_empty_text_is_null() {
        let f = field("email", FieldType::Text);
        assert_eq!(
            coerce_value(&f, None, &RawValue::Text("   ".into())).unwrap(),
            FieldValue::Null
        );
        assert_eq!(
            coerce_value(&f, None, &RawValue::Text(" a@b.it ".into())).unwrap(),
            FieldValue::Text("a@b.it".into())
        );
    }

    #[test]
    fn test_record_roundtrip() {
        let spec = TableSpec {
            name: "toponyms".to_string(),
            db: crate::schema::TargetDb::Core,
            source: Default::default(),
            primary_key: "id".to_string(),
            natural_key: vec!["name".to_string()],
            source_key: None,
            fields: vec![field("id", FieldType::Uuid), field("name", FieldType::Text)],
            foreign_keys: vec![],
            extra_field: None,
            disabled_flag: None,
        };
        let mut r = Record::new(&spec);
        assert!(r.get("name").is_null());
        r.set("name", FieldValue::Text("VIA".into()));
        assert_eq!(r.get("name").as_text(), Some("VIA"));
        let vals = r.values_for(&["id".to_string(), "name".to_string()]);
        assert!(vals[0].is_null());
    }
}
