//! Cross-database reference tracking.
//!
//! Physical FOREIGN KEY constraints cannot span the six target databases, so
//! a reference into another database resolves through the registry like any
//! other and is additionally recorded here. After all waves complete the
//! orchestrator probes each remote database once and downgrades missing rows
//! to run-report warnings.

use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::registry::IdentityRegistry;
use crate::schema::TargetDb;

/// One recorded reference from a row in `from_table` into a table that lives
/// in a different target database.
#[derive(Debug, Clone, PartialEq)]
pub struct XdbRef {
    pub from_table: String,
    pub field: String,
    pub ref_table: String,
    pub ref_db: TargetDb,
    pub target_id: Uuid,
}

/// Resolver for FK fields whose referenced table lives in another database.
pub struct XdbResolver {
    registry: Arc<IdentityRegistry>,
    refs: Mutex<Vec<XdbRef>>,
}

impl XdbResolver {
    pub fn new(registry: Arc<IdentityRegistry>) -> Self {
        Self {
            registry,
            refs: Mutex::new(Vec::new()),
        }
    }

    /// Resolve a cross-database reference and record it for the end-of-run
    /// existence probe.
    pub fn resolve(
        &self,
        from_table: &str,
        field: &str,
        ref_table: &str,
        ref_db: TargetDb,
        source_key: &str,
    ) -> Uuid {
        let target_id = self.registry.resolve(ref_table, source_key);
        self.refs.lock().expect("xdb lock").push(XdbRef {
            from_table: from_table.to_string(),
            field: field.to_string(),
            ref_table: ref_table.to_string(),
            ref_db,
            target_id,
        });
        target_id
    }

    /// Drain the recorded references, deduplicated by `(ref_table, id)`.
    pub fn take_refs(&self) -> Vec<XdbRef> {
        let mut refs = std::mem::take(&mut *self.refs.lock().expect("xdb lock"));
        refs.sort_by(|a, b| {
            (&a.ref_table, a.target_id, &a.from_table, &a.field)
                .cmp(&(&b.ref_table, b.target_id, &b.from_table, &b.field))
        });
        refs.dedup_by(|a, b| a.ref_table == b.ref_table && a.target_id == b.target_id);
        refs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolves_through_registry() {
        let registry = Arc::new(IdentityRegistry::new());
        let xdb = XdbResolver::new(Arc::clone(&registry));

        let id = xdb.resolve("organigrams", "legal_entity_id", "companies", TargetDb::Core, "C1");
        assert_eq!(registry.lookup("companies", "C1"), Some(id));
        // Same key through the plain registry path yields the same id.
        assert_eq!(registry.resolve("companies", "C1"), id);
    }

    #[test]
    fn test_take_refs_dedups_by_target() {
        let registry = Arc::new(IdentityRegistry::new());
        let xdb = XdbResolver::new(registry);

        xdb.resolve("organigrams", "legal_entity_id", "companies", TargetDb::Core, "C1");
        xdb.resolve("procedures", "company_id", "companies", TargetDb::Core, "C1");
        xdb.resolve("organigrams", "legal_entity_id", "companies", TargetDb::Core, "C2");

        let refs = xdb.take_refs();
        assert_eq!(refs.len(), 2);
        assert!(xdb.take_refs().is_empty());
    }
}
