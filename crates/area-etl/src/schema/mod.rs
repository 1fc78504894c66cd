//! Schema metadata: the target-table catalog and its dependency graph.
//!
//! The catalog is a YAML document declaring every target table (destination
//! database, field specs, natural key, FK edges, source SQL) plus the named
//! enumerated domains fields validate against. It is data, not code: adding
//! an allowed enum value or a table filter is a catalog edit.

pub mod graph;
pub mod types;

pub use graph::{DependencyGraph, LoadOrder};
pub use types::*;

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{EtlError, Result};

/// The full set of [`TableSpec`]s plus shared enumerated domains.
///
/// Loaded once at run start, immutable afterwards.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct SchemaCatalog {
    #[serde(default)]
    pub domains: BTreeMap<String, EnumDomain>,
    pub tables: Vec<TableSpec>,
}

/// The catalog shipped with the crate, covering all six target databases.
pub const BUILTIN_CATALOG: &str = include_str!("../../catalog/tables.yaml");

impl SchemaCatalog {
    /// Load and validate a catalog from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate a catalog from YAML text.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let mut catalog: SchemaCatalog = serde_yaml::from_str(yaml)?;
        catalog.finish()?;
        Ok(catalog)
    }

    /// The catalog embedded in the crate.
    pub fn builtin() -> Result<Self> {
        Self::from_yaml(BUILTIN_CATALOG)
    }

    /// Mark self-referential edges and validate cross-references.
    fn finish(&mut self) -> Result<()> {
        let names: Vec<String> = self.tables.iter().map(|t| t.name.clone()).collect();
        {
            let mut seen = std::collections::BTreeSet::new();
            for name in &names {
                if !seen.insert(name) {
                    return Err(EtlError::catalog(format!("duplicate table '{}'", name)));
                }
            }
        }

        for table in &mut self.tables {
            for fk in &mut table.foreign_keys {
                fk.self_referential = fk.references == table.name;
            }
        }

        for table in &self.tables {
            if table.source.build_query().is_none() {
                return Err(EtlError::catalog(format!(
                    "table '{}' has neither a source table nor a source query",
                    table.name
                )));
            }
            if table.field(&table.primary_key).is_none() {
                return Err(EtlError::catalog(format!(
                    "table '{}': primary key field '{}' is not declared",
                    table.name, table.primary_key
                )));
            }
            for key in &table.natural_key {
                if table.field(key).is_none() {
                    return Err(EtlError::catalog(format!(
                        "table '{}': natural key field '{}' is not declared",
                        table.name, key
                    )));
                }
            }
            if table.source_key.is_none() && table.natural_key.is_empty() {
                return Err(EtlError::catalog(format!(
                    "table '{}' needs a source_key or a natural key to derive row identity",
                    table.name
                )));
            }
            for fk in &table.foreign_keys {
                if !names.contains(&fk.references) {
                    return Err(EtlError::catalog(format!(
                        "table '{}': FK field '{}' references unknown table '{}'",
                        table.name, fk.field, fk.references
                    )));
                }
                if table.field(&fk.field).is_none() {
                    return Err(EtlError::catalog(format!(
                        "table '{}': FK field '{}' is not declared",
                        table.name, fk.field
                    )));
                }
                if fk.self_referential && table.source_key.is_none() {
                    return Err(EtlError::catalog(format!(
                        "table '{}' has a self-referential edge and needs a source_key",
                        table.name
                    )));
                }
            }
            for field in &table.fields {
                if let Some(domain) = &field.domain {
                    if !self.domains.contains_key(domain) {
                        return Err(EtlError::catalog(format!(
                            "table '{}': field '{}' uses unknown domain '{}'",
                            table.name, field.name, domain
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    pub fn table(&self, name: &str) -> Option<&TableSpec> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn domain(&self, name: &str) -> Option<&EnumDomain> {
        self.domains.get(name)
    }

    /// Database a table lives in. Unknown tables return `None`.
    pub fn db_of(&self, table: &str) -> Option<TargetDb> {
        self.table(table).map(|t| t.db)
    }

    /// Restrict the catalog to the given modules and/or explicit table list.
    /// Empty filters keep everything. FK edges pointing outside the subset
    /// stay on the specs; the graph builder ignores them and references
    /// resolve through the registry.
    pub fn scoped(&self, modules: &[TargetDb], tables: &[String]) -> Result<Self> {
        for name in tables {
            if self.table(name).is_none() {
                return Err(EtlError::catalog(format!(
                    "scoped table '{}' is not in the catalog",
                    name
                )));
            }
        }

        let keep = |t: &TableSpec| -> bool {
            let module_ok = modules.is_empty() || modules.contains(&t.db);
            let table_ok = tables.is_empty() || tables.iter().any(|n| n == &t.name);
            module_ok && table_ok
        };

        let subset: Vec<TableSpec> = self.tables.iter().filter(|t| keep(t)).cloned().collect();
        if subset.is_empty() {
            return Err(EtlError::catalog(
                "run scope selects no tables".to_string(),
            ));
        }

        Ok(SchemaCatalog {
            domains: self.domains.clone(),
            tables: subset,
        })
    }
}
