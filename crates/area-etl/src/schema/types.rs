//! Table catalog types: target tables, fields, enumerated domains, FK edges.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Physical target database a table belongs to.
///
/// Each variant is one independently provisioned PostgreSQL database; the
/// variant doubles as the run-scoping "module" name on the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetDb {
    /// Core registry: companies, structures, UDOs, resolutions, users
    Core,
    /// Organizational chart (POA): organigrams, nodes, areas
    Poa,
    /// Planning subsystem (Cronos): plans and planned specialties
    Cronos,
    /// Authorization procedures (AUAC): procedures and requirements
    Auac,
    /// Prescriptions (PPF)
    Ppf,
    /// HR personnel
    Hr,
}

impl TargetDb {
    /// All databases, in module order.
    pub const ALL: [TargetDb; 6] = [
        TargetDb::Core,
        TargetDb::Poa,
        TargetDb::Cronos,
        TargetDb::Auac,
        TargetDb::Ppf,
        TargetDb::Hr,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TargetDb::Core => "core",
            TargetDb::Poa => "poa",
            TargetDb::Cronos => "cronos",
            TargetDb::Auac => "auac",
            TargetDb::Ppf => "ppf",
            TargetDb::Hr => "hr",
        }
    }
}

impl std::fmt::Display for TargetDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TargetDb {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "core" => Ok(TargetDb::Core),
            "poa" => Ok(TargetDb::Poa),
            "cronos" => Ok(TargetDb::Cronos),
            "auac" => Ok(TargetDb::Auac),
            "ppf" => Ok(TargetDb::Ppf),
            "hr" => Ok(TargetDb::Hr),
            other => Err(format!("unknown module '{}'", other)),
        }
    }
}

/// Semantic type of a target field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Uuid,
    Text,
    Bool,
    SmallInt,
    Integer,
    BigInt,
    /// Fixed-precision numeric. Values are rounded to `scale`; more than
    /// `precision` total digits is an overflow.
    Decimal {
        precision: u32,
        scale: u32,
    },
    /// Timezone-aware timestamp (UTC). Legacy date-only values are promoted
    /// to midnight UTC.
    Timestamp,
    Json,
}

impl FieldType {
    /// PostgreSQL cast suffix used when binding parameters as text.
    pub fn pg_cast(&self) -> &'static str {
        match self {
            FieldType::Uuid => "::uuid",
            FieldType::Text => "::text",
            FieldType::Bool => "::boolean",
            FieldType::SmallInt => "::smallint",
            FieldType::Integer => "::integer",
            FieldType::BigInt => "::bigint",
            FieldType::Decimal { .. } => "::numeric",
            FieldType::Timestamp => "::timestamptz",
            FieldType::Json => "::jsonb",
        }
    }
}

/// Input normalization applied before validating an enumerated value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalize {
    /// Trim only
    #[default]
    None,
    /// Trim and lowercase
    Lower,
    /// Trim, uppercase, spaces and dots to underscores
    UpperUnderscore,
}

/// A named, versioned allowed-value set for enumerated text fields.
///
/// Validation order: normalize the raw value, apply the alias map, then check
/// membership in `values`. Null or blank input falls back to `default` when
/// one is declared.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnumDomain {
    pub values: Vec<String>,
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub normalize: Normalize,
}

impl EnumDomain {
    /// Normalize a raw input according to the domain's rule.
    pub fn normalize_input(&self, raw: &str) -> String {
        let trimmed = raw.trim();
        match self.normalize {
            Normalize::None => trimmed.to_string(),
            Normalize::Lower => trimmed.to_lowercase(),
            Normalize::UpperUnderscore => trimmed
                .to_uppercase()
                .replace([' ', '.'], "_")
                .replace("__", "_"),
        }
    }

    /// Map a raw source value to its canonical target value, if allowed.
    pub fn canonical(&self, raw: &str) -> Option<String> {
        let normalized = self.normalize_input(raw);
        if normalized.is_empty() {
            return self.default.clone();
        }
        let candidate = self
            .aliases
            .get(&normalized)
            .cloned()
            .unwrap_or(normalized);
        // Membership is case-insensitive; the declared spelling wins, so a
        // lowercase-normalizing domain still accepts canonical input.
        self.values
            .iter()
            .find(|v| v.eq_ignore_ascii_case(&candidate))
            .cloned()
    }
}

/// Catalog-declared derivation rule for audit-timestamp fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldRule {
    /// Fall back to the run instant when the legacy creation stamp is null
    CreatedAt,
    /// Fall back to `created_at` when the legacy modification stamp is null
    UpdatedAt,
    /// Set to `updated_at` when the table's disabled flag column is `S`
    DisabledAt,
}

/// One target field: name, semantic type, nullability and coercion hints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// Source column feeding this field. `None` means the value is derived
    /// (minted id, FK resolution, or an entity rule).
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default = "default_true")]
    pub nullable: bool,
    /// Named enumerated domain this field validates against.
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub rule: Option<FieldRule>,
    /// Legacy convention: `""` and `"?"` coerce to zero for this numeric field.
    #[serde(default)]
    pub blank_as_zero: bool,
}

/// A foreign-key edge from one table field to another table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FkEdge {
    /// Referencing field on this table
    pub field: String,
    /// Referenced table name
    pub references: String,
    #[serde(default = "default_id")]
    pub ref_field: String,
    #[serde(default = "default_true")]
    pub nullable: bool,
    /// Source column carrying the legacy reference; defaults to the field's
    /// own `source` column.
    #[serde(default)]
    pub source: Option<String>,
    /// Set by the catalog loader when `references` equals the owning table.
    /// Self edges are excluded from topological ordering and patched in a
    /// second pass.
    #[serde(default)]
    pub self_referential: bool,
}

/// How to read a table's rows from the legacy source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceSpec {
    /// Legacy table or view, schema-qualified (e.g. `AUAC_USR.NODI`)
    #[serde(default)]
    pub table: Option<String>,
    /// Full SQL override for joins and synthesized columns
    #[serde(default)]
    pub query: Option<String>,
    /// Row filter appended to the generated SELECT
    #[serde(default, rename = "where")]
    pub where_clause: Option<String>,
}

impl SourceSpec {
    /// Build the extraction SQL for this table.
    pub fn build_query(&self) -> Option<String> {
        if let Some(q) = &self.query {
            return Some(q.clone());
        }
        let table = self.table.as_ref()?;
        let mut sql = format!("SELECT * FROM {}", table);
        if let Some(w) = &self.where_clause {
            if !w.is_empty() {
                sql.push_str(" WHERE ");
                sql.push_str(w);
            }
        }
        Some(sql)
    }
}

/// One target table: destination database, field specs, keys and FK edges.
///
/// Loaded once from the catalog, immutable during a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSpec {
    pub name: String,
    pub db: TargetDb,
    #[serde(default)]
    pub source: SourceSpec,
    #[serde(default = "default_id")]
    pub primary_key: String,
    /// Natural unique key used as the upsert conflict target. Empty means
    /// "use the primary key".
    #[serde(default)]
    pub natural_key: Vec<String>,
    /// Source column carrying the legacy unique id, used as the registry key
    /// for this table's rows. `None` means the key is derived from the
    /// natural-key field values after transform.
    #[serde(default)]
    pub source_key: Option<String>,
    pub fields: Vec<FieldSpec>,
    #[serde(default)]
    pub foreign_keys: Vec<FkEdge>,
    /// Name of the JSON field receiving unmapped legacy columns.
    #[serde(default)]
    pub extra_field: Option<String>,
    /// Source column holding the legacy `S`/`N` disabled flag (drives the
    /// `disabled_at` rule).
    #[serde(default)]
    pub disabled_flag: Option<String>,
}

impl TableSpec {
    /// Upsert conflict columns: the natural key, or the primary key when no
    /// natural key is declared.
    pub fn upsert_key(&self) -> Vec<String> {
        if self.natural_key.is_empty() {
            vec![self.primary_key.clone()]
        } else {
            self.natural_key.clone()
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// The FK edge owning a field, if any.
    pub fn fk_for_field(&self, name: &str) -> Option<&FkEdge> {
        self.foreign_keys.iter().find(|fk| fk.field == name)
    }

    pub fn has_self_edges(&self) -> bool {
        self.foreign_keys.iter().any(|fk| fk.self_referential)
    }
}

fn default_true() -> bool {
    true
}

fn default_id() -> String {
    "id".to_string()
}
