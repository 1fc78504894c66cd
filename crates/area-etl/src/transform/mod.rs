//! Row transformation: identity resolution, entity rules, audit stamps.
//!
//! Transformation is pure with respect to the target databases; everything it
//! needs (coerced row, registry, catalog) is local. Rows either become
//! [`Record`]s ready for upsert or [`QuarantineEntry`]s, never errors.

mod rules;
mod xdb;

pub use xdb::{XdbRef, XdbResolver};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::extract::{coerce_row, FieldValue, Record};
use crate::registry::IdentityRegistry;
use crate::report::{QuarantineEntry, QuarantineReason};
use crate::schema::{FieldRule, FkEdge, SchemaCatalog, TableSpec};
use crate::source::SourceRow;

/// A self-referential FK left null in pass one, to be patched once the whole
/// table is loaded and every parent id is known.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingPatch {
    pub table: String,
    pub row_id: Uuid,
    pub field: String,
    /// Legacy key of the parent row.
    pub parent_key: String,
}

/// Outcome of transforming one source row.
#[derive(Debug)]
pub enum TransformOutcome {
    Transformed(Record, Vec<PendingPatch>),
    Quarantined(QuarantineEntry),
}

/// Result of transforming a whole table batch.
#[derive(Debug, Default)]
pub struct TableTransform {
    pub records: Vec<Record>,
    pub patches: Vec<PendingPatch>,
    pub quarantine: Vec<QuarantineEntry>,
}

/// Stateless row mapper; identity state lives in the shared registry.
pub struct Transformer {
    registry: Arc<IdentityRegistry>,
    xdb: Arc<XdbResolver>,
    catalog: Arc<SchemaCatalog>,
    /// Run instant used to fill absent audit timestamps, fixed once so every
    /// row of a run stamps identically.
    now: DateTime<Utc>,
}

impl Transformer {
    pub fn new(
        registry: Arc<IdentityRegistry>,
        xdb: Arc<XdbResolver>,
        catalog: Arc<SchemaCatalog>,
    ) -> Self {
        Self {
            registry,
            xdb,
            catalog,
            now: Utc::now(),
        }
    }

    /// Transform every row of a table batch.
    pub fn transform_all(&self, spec: &TableSpec, rows: &[SourceRow]) -> TableTransform {
        let mut out = TableTransform::default();
        for row in rows {
            match self.transform_row(spec, row) {
                TransformOutcome::Transformed(record, patches) => {
                    out.records.push(record);
                    out.patches.extend(patches);
                }
                TransformOutcome::Quarantined(entry) => {
                    tracing::warn!(
                        table = %entry.table,
                        source_key = entry.source_key.as_deref().unwrap_or("?"),
                        reason = %entry.reason,
                        "row quarantined"
                    );
                    out.quarantine.push(entry);
                }
            }
        }
        out
    }

    pub fn transform_row(&self, spec: &TableSpec, row: &SourceRow) -> TransformOutcome {
        let mut record = match coerce_row(spec, &self.catalog, row) {
            Ok(r) => r,
            Err(reason) => return TransformOutcome::Quarantined(self.quarantine(spec, row, reason)),
        };

        // Non-self FK fields become registry-minted UUIDs.
        for fk in &spec.foreign_keys {
            if fk.self_referential {
                continue;
            }
            let Some(key) = self.fk_source_key(spec, fk, row) else {
                continue;
            };
            let id = match self.catalog.db_of(&fk.references) {
                Some(ref_db) if ref_db != spec.db => {
                    self.xdb
                        .resolve(&spec.name, &fk.field, &fk.references, ref_db, &key)
                }
                _ => self.registry.resolve(&fk.references, &key),
            };
            record.set(&fk.field, FieldValue::Uuid(id));
        }

        // Mint this row's own id. Tables without a legacy key column derive
        // the registry key from the natural-key values.
        let key = match record.source_key.clone() {
            Some(k) => k,
            None => {
                let k = self.derived_key(spec, &record);
                record.source_key = Some(k.clone());
                k
            }
        };
        let id = self.registry.resolve(&spec.name, &key);
        record.set(&spec.primary_key, FieldValue::Uuid(id));

        // Self edges stay null in pass one and are patched later.
        let mut patches = Vec::new();
        for fk in &spec.foreign_keys {
            if !fk.self_referential {
                continue;
            }
            if let Some(parent_key) = self.fk_source_key(spec, fk, row) {
                patches.push(PendingPatch {
                    table: spec.name.clone(),
                    row_id: id,
                    field: fk.field.clone(),
                    parent_key,
                });
            }
        }

        if let Err(reason) = rules::apply(spec, &mut record) {
            return TransformOutcome::Quarantined(self.quarantine(spec, row, reason));
        }

        self.apply_time_rules(spec, &mut record, row);

        for field in &spec.fields {
            if field.nullable || !record.get(&field.name).is_null() {
                continue;
            }
            // Self edges are legitimately null until pass two.
            if spec
                .fk_for_field(&field.name)
                .is_some_and(|fk| fk.self_referential)
            {
                continue;
            }
            return TransformOutcome::Quarantined(self.quarantine(
                spec,
                row,
                QuarantineReason::MissingRequiredField {
                    field: field.name.clone(),
                },
            ));
        }

        TransformOutcome::Transformed(record, patches)
    }

    /// Legacy key carried by an FK edge's source column, trimmed. `None`
    /// means the reference is absent and the field stays null.
    fn fk_source_key(&self, spec: &TableSpec, fk: &FkEdge, row: &SourceRow) -> Option<String> {
        let col = fk
            .source
            .as_deref()
            .or_else(|| spec.field(&fk.field).and_then(|f| f.source.as_deref()))?;
        row.get(col).as_trimmed_text().map(|s| s.to_string())
    }

    /// Registry key for tables without a legacy id column: the natural-key
    /// values joined in declaration order.
    fn derived_key(&self, spec: &TableSpec, record: &Record) -> String {
        spec.upsert_key()
            .iter()
            .map(|col| match record.get(col) {
                FieldValue::Null => String::new(),
                FieldValue::Text(s) => s.clone(),
                other => match other.to_json() {
                    Value::String(s) => s,
                    v => v.to_string(),
                },
            })
            .collect::<Vec<_>>()
            .join("|")
    }

    fn apply_time_rules(&self, spec: &TableSpec, record: &mut Record, row: &SourceRow) {
        let mut created: Option<FieldValue> = None;
        let mut updated: Option<FieldValue> = None;

        for field in &spec.fields {
            if field.rule == Some(FieldRule::CreatedAt) {
                if record.get(&field.name).is_null() {
                    record.set(&field.name, FieldValue::Timestamp(self.now));
                }
                created = Some(record.get(&field.name).clone());
            }
        }
        for field in &spec.fields {
            if field.rule == Some(FieldRule::UpdatedAt) {
                if record.get(&field.name).is_null() {
                    if let Some(c) = &created {
                        record.set(&field.name, c.clone());
                    }
                }
                updated = Some(record.get(&field.name).clone());
            }
        }

        let disabled = spec
            .disabled_flag
            .as_deref()
            .and_then(|col| row.get(col).as_trimmed_text())
            .map(|s| s.eq_ignore_ascii_case("s"))
            .unwrap_or(false);
        for field in &spec.fields {
            if field.rule == Some(FieldRule::DisabledAt) {
                let value = if disabled {
                    updated.clone().unwrap_or(FieldValue::Timestamp(self.now))
                } else {
                    FieldValue::Null
                };
                record.set(&field.name, value);
            }
        }
    }

    fn quarantine(
        &self,
        spec: &TableSpec,
        row: &SourceRow,
        reason: QuarantineReason,
    ) -> QuarantineEntry {
        QuarantineEntry {
            table: spec.name.clone(),
            source_key: spec
                .source_key
                .as_deref()
                .and_then(|col| row.get(col).as_trimmed_text())
                .map(|s| s.to_string()),
            reason,
            row: row_json(row),
        }
    }
}

fn row_json(row: &SourceRow) -> Value {
    let mut map = serde_json::Map::new();
    for (name, value) in &row.columns {
        map.insert(name.clone(), value.to_json());
    }
    Value::Object(map)
}
