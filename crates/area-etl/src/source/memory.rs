//! In-memory source backend for tests and dry runs.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::Result;
use crate::schema::TableSpec;
use crate::source::{SourceReader, SourceRow};

/// Fixture-backed source: rows are keyed by target table name.
#[derive(Default)]
pub struct MemorySource {
    rows: Mutex<HashMap<String, Vec<SourceRow>>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the rows returned for a table. Replaces earlier fixtures.
    pub fn insert(&self, table: impl Into<String>, rows: Vec<SourceRow>) {
        self.rows.lock().expect("source lock").insert(table.into(), rows);
    }
}

#[async_trait]
impl SourceReader for MemorySource {
    async fn fetch(&self, spec: &TableSpec) -> Result<Vec<SourceRow>> {
        Ok(self
            .rows
            .lock()
            .expect("source lock")
            .get(&spec.name)
            .cloned()
            .unwrap_or_default())
    }

    async fn probe(&self) -> Result<()> {
        Ok(())
    }

    fn source_type(&self) -> &str {
        "memory"
    }
}
