//! Dependency graph over target tables and its topological load order.
//!
//! Edges come from the catalog's FK declarations. Self-referential edges are
//! excluded from ordering (they are patched in a second pass after the owning
//! table's first pass is loaded); everything else must form a DAG or the run
//! aborts before any extraction.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{EtlError, Result};
use crate::schema::SchemaCatalog;

/// Topological load order, grouped into waves.
///
/// A wave is a set of tables with no dependency relationship to one another;
/// tables inside a wave may be migrated by parallel workers. Waves are
/// emitted in dependency order and each wave is sorted alphabetically, so the
/// flattened order is fully deterministic.
#[derive(Debug, Clone)]
pub struct LoadOrder {
    pub waves: Vec<Vec<String>>,
}

impl LoadOrder {
    /// The flattened table order.
    pub fn tables(&self) -> Vec<String> {
        self.waves.iter().flatten().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.waves.iter().map(|w| w.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.waves.is_empty()
    }

    /// Position of each table in the flattened order.
    pub fn positions(&self) -> BTreeMap<String, usize> {
        self.tables()
            .into_iter()
            .enumerate()
            .map(|(i, t)| (t, i))
            .collect()
    }
}

/// Directed dependency graph over the catalog's tables.
pub struct DependencyGraph {
    /// dependency -> dependents (edge points from referenced to referencing)
    dependents: BTreeMap<String, BTreeSet<String>>,
    /// number of non-self FK dependencies per table
    indegree: BTreeMap<String, usize>,
}

impl DependencyGraph {
    /// Build the graph from a catalog. Self-referential edges are skipped;
    /// edges pointing outside the catalog's table set (possible when a run is
    /// scoped to a module subset) are skipped too, because the referenced
    /// table is not part of this run.
    pub fn build(catalog: &SchemaCatalog) -> Self {
        let names: BTreeSet<String> = catalog.tables.iter().map(|t| t.name.clone()).collect();

        let mut dependents: BTreeMap<String, BTreeSet<String>> =
            names.iter().map(|n| (n.clone(), BTreeSet::new())).collect();
        let mut indegree: BTreeMap<String, usize> =
            names.iter().map(|n| (n.clone(), 0)).collect();

        for table in &catalog.tables {
            for fk in &table.foreign_keys {
                if fk.self_referential || !names.contains(&fk.references) {
                    continue;
                }
                // A table may reference the same parent through several
                // fields; count the dependency once.
                if dependents
                    .get_mut(&fk.references)
                    .expect("referenced table present")
                    .insert(table.name.clone())
                {
                    *indegree.get_mut(&table.name).expect("table present") += 1;
                }
            }
        }

        Self {
            dependents,
            indegree,
        }
    }

    /// Kahn's algorithm, layered into waves.
    ///
    /// Returns [`EtlError::CyclicDependency`] naming the tables left with
    /// unsatisfied dependencies when a cycle survives self-edge removal.
    pub fn topological_order(&self) -> Result<LoadOrder> {
        let mut indegree = self.indegree.clone();
        let mut waves: Vec<Vec<String>> = Vec::new();
        let mut placed = 0usize;

        // BTreeMap iteration keeps every wave alphabetical.
        let mut ready: Vec<String> = indegree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(name, _)| name.clone())
            .collect();

        while !ready.is_empty() {
            placed += ready.len();
            let mut next: BTreeSet<String> = BTreeSet::new();
            for name in &ready {
                if let Some(children) = self.dependents.get(name) {
                    for child in children {
                        let deg = indegree.get_mut(child).expect("child present");
                        *deg -= 1;
                        if *deg == 0 {
                            next.insert(child.clone());
                        }
                    }
                }
            }
            waves.push(ready);
            ready = next.into_iter().collect();
        }

        if placed != self.indegree.len() {
            let mut stuck: Vec<String> = indegree
                .iter()
                .filter(|(_, deg)| **deg > 0)
                .map(|(name, _)| name.clone())
                .collect();
            stuck.sort();
            return Err(EtlError::CyclicDependency(stuck.join(", ")));
        }

        Ok(LoadOrder { waves })
    }
}
