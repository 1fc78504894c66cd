//! Target database writers.
//!
//! The orchestrator talks to one [`TargetWriter`] per physical database. The
//! PostgreSQL implementation wraps a deadpool pool; the in-memory one backs
//! tests and dry runs with the same upsert semantics.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use tokio_postgres::{Config as PgConfig, NoTls, SimpleQueryMessage};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::TargetConfig;
use crate::error::{EtlError, Result};
use crate::extract::{FieldValue, Record};
use crate::load::{build_id_lookup_sql, build_patch_sql, build_upsert_sql, physical_table};
use crate::schema::TableSpec;

/// Write interface over one target database.
#[async_trait]
pub trait TargetWriter: Send + Sync {
    /// Upsert a table batch inside a single transaction. Returns the number
    /// of rows actually written (inserted or changed); unchanged rows do not
    /// count, so a no-op rerun reports zero.
    async fn upsert(&self, spec: &TableSpec, records: &[Record]) -> Result<u64>;

    /// Second-pass self-reference patches: set `field` to the parent id for
    /// each `(row_id, parent_id)` pair, one transaction per call.
    async fn apply_patches(
        &self,
        spec: &TableSpec,
        field: &str,
        pairs: &[(Uuid, Uuid)],
    ) -> Result<u64>;

    /// Which of the given primary-key ids are absent from the table.
    async fn missing_ids(&self, spec: &TableSpec, ids: &[Uuid]) -> Result<Vec<Uuid>>;

    /// Cheap connectivity probe.
    async fn probe(&self) -> Result<()>;

    /// Driver name for logs.
    fn target_type(&self) -> &'static str;
}

/// Build a deadpool pool for one target database.
pub fn build_pool(config: &TargetConfig, max_conns: usize) -> Result<Pool> {
    let mut pg_config = PgConfig::new();
    pg_config.host(&config.host);
    pg_config.port(config.port);
    pg_config.dbname(&config.database);
    pg_config.user(&config.user);
    pg_config.password(&config.password);

    let mgr_config = ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    };
    let mgr = Manager::from_config(pg_config, NoTls, mgr_config);
    Pool::builder(mgr)
        .max_size(max_conns)
        .build()
        .map_err(|e| EtlError::pool(e.to_string(), format!("building pool for {}", config.database)))
}

/// PostgreSQL writer over a deadpool pool.
pub struct PgTarget {
    pool: Pool,
    prefix: String,
    batch_size: usize,
    database: String,
}

impl PgTarget {
    pub async fn new(
        config: &TargetConfig,
        prefix: &str,
        batch_size: usize,
        max_conns: usize,
    ) -> Result<Self> {
        let pool = build_pool(config, max_conns)?;

        let client = pool
            .get()
            .await
            .map_err(|e| EtlError::pool(e.to_string(), format!("connecting to {}", config.database)))?;
        client.simple_query("SELECT 1").await?;

        info!(
            "Connected to PostgreSQL target: {}:{}/{}",
            config.host, config.port, config.database
        );

        Ok(Self {
            pool,
            prefix: prefix.to_string(),
            batch_size: batch_size.max(1),
            database: config.database.clone(),
        })
    }

    async fn client(&self) -> Result<deadpool_postgres::Object> {
        self.pool
            .get()
            .await
            .map_err(|e| EtlError::pool(e.to_string(), format!("target {}", self.database)))
    }

    fn table_name(&self, spec: &TableSpec) -> String {
        physical_table(&self.prefix, &spec.name)
    }
}

/// Sum the affected-row counts out of a `simple_query` response.
fn rows_affected(messages: &[SimpleQueryMessage]) -> u64 {
    messages
        .iter()
        .map(|m| match m {
            SimpleQueryMessage::CommandComplete(n) => *n,
            _ => 0,
        })
        .sum()
}

#[async_trait]
impl TargetWriter for PgTarget {
    async fn upsert(&self, spec: &TableSpec, records: &[Record]) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }
        let table = self.table_name(spec);
        let mut client = self.client().await?;
        let tx = client.transaction().await?;

        let mut written = 0u64;
        for chunk in records.chunks(self.batch_size) {
            let sql = build_upsert_sql(&table, spec, chunk);
            let messages = tx.simple_query(&sql).await.map_err(|e| {
                // A database error inside the batch means the mapping is
                // wrong; the whole transaction rolls back when `tx` drops.
                match e.code() {
                    Some(_) => EtlError::load(&spec.name, e.to_string()),
                    None => EtlError::Target(e),
                }
            })?;
            written += rows_affected(&messages);
        }

        tx.commit().await?;
        debug!(table = %table, rows = records.len(), written, "batch upserted");
        Ok(written)
    }

    async fn apply_patches(
        &self,
        spec: &TableSpec,
        field: &str,
        pairs: &[(Uuid, Uuid)],
    ) -> Result<u64> {
        if pairs.is_empty() {
            return Ok(0);
        }
        let table = self.table_name(spec);
        let mut client = self.client().await?;
        let tx = client.transaction().await?;

        let mut patched = 0u64;
        for chunk in pairs.chunks(self.batch_size) {
            let statements: Vec<String> = chunk
                .iter()
                .map(|(row_id, parent_id)| {
                    build_patch_sql(&table, spec, field, *row_id, *parent_id)
                })
                .collect();
            let messages = tx
                .simple_query(&statements.join(";\n"))
                .await
                .map_err(|e| match e.code() {
                    Some(_) => EtlError::load(&spec.name, e.to_string()),
                    None => EtlError::Target(e),
                })?;
            patched += rows_affected(&messages);
        }

        tx.commit().await?;
        debug!(table = %table, field, patched, "self-reference patches applied");
        Ok(patched)
    }

    async fn missing_ids(&self, spec: &TableSpec, ids: &[Uuid]) -> Result<Vec<Uuid>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let table = self.table_name(spec);
        let client = self.client().await?;

        let mut found = std::collections::HashSet::with_capacity(ids.len());
        for chunk in ids.chunks(self.batch_size) {
            let sql = build_id_lookup_sql(&table, spec, chunk);
            for message in client.simple_query(&sql).await? {
                if let SimpleQueryMessage::Row(row) = message {
                    if let Some(id) = row.get(0).and_then(|t| Uuid::parse_str(t).ok()) {
                        found.insert(id);
                    }
                }
            }
        }
        Ok(ids.iter().copied().filter(|id| !found.contains(id)).collect())
    }

    async fn probe(&self) -> Result<()> {
        let client = self.client().await?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }

    fn target_type(&self) -> &'static str {
        "postgres"
    }
}

/// In-memory writer with real upsert semantics, for tests and dry runs.
///
/// Rows are keyed by the spec's upsert key so the idempotence and
/// rerun-with-new-row properties can be asserted without a database.
#[derive(Default)]
pub struct MemoryTarget {
    tables: Mutex<HashMap<String, Vec<Record>>>,
}

impl MemoryTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the stored rows for a table.
    pub fn rows(&self, table: &str) -> Vec<Record> {
        self.tables
            .lock()
            .expect("target lock")
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.tables
            .lock()
            .expect("target lock")
            .get(table)
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn key_of(spec: &TableSpec, record: &Record) -> Vec<FieldValue> {
        record.values_for(&spec.upsert_key())
    }
}

#[async_trait]
impl TargetWriter for MemoryTarget {
    async fn upsert(&self, spec: &TableSpec, records: &[Record]) -> Result<u64> {
        let mut tables = self.tables.lock().expect("target lock");
        let rows = tables.entry(spec.name.clone()).or_default();

        let mut written = 0u64;
        for record in records {
            let key = Self::key_of(spec, record);
            match rows.iter_mut().find(|r| Self::key_of(spec, r) == key) {
                Some(existing) => {
                    // Primary key and self-referential FKs never update;
                    // everything else does, with the same change detection
                    // as the SQL path.
                    let mut changed = false;
                    for (name, value) in record.fields() {
                        if name == &spec.primary_key
                            || spec
                                .fk_for_field(name)
                                .is_some_and(|fk| fk.self_referential)
                        {
                            continue;
                        }
                        if existing.get(name) != value {
                            existing.set(name, value.clone());
                            changed = true;
                        }
                    }
                    if changed {
                        written += 1;
                    }
                }
                None => {
                    rows.push(record.clone());
                    written += 1;
                }
            }
        }
        Ok(written)
    }

    async fn apply_patches(
        &self,
        spec: &TableSpec,
        field: &str,
        pairs: &[(Uuid, Uuid)],
    ) -> Result<u64> {
        let mut tables = self.tables.lock().expect("target lock");
        let rows = tables.entry(spec.name.clone()).or_default();

        let mut patched = 0u64;
        for (row_id, parent_id) in pairs {
            if let Some(row) = rows
                .iter_mut()
                .find(|r| r.get(&spec.primary_key).as_uuid() == Some(*row_id))
            {
                if row.get(field).as_uuid() != Some(*parent_id) {
                    row.set(field, FieldValue::Uuid(*parent_id));
                    patched += 1;
                }
            }
        }
        Ok(patched)
    }

    async fn missing_ids(&self, spec: &TableSpec, ids: &[Uuid]) -> Result<Vec<Uuid>> {
        let tables = self.tables.lock().expect("target lock");
        let present: std::collections::HashSet<Uuid> = tables
            .get(&spec.name)
            .map(|rows| {
                rows.iter()
                    .filter_map(|r| r.get(&spec.primary_key).as_uuid())
                    .collect()
            })
            .unwrap_or_default();
        Ok(ids.iter().copied().filter(|id| !present.contains(id)).collect())
    }

    async fn probe(&self) -> Result<()> {
        Ok(())
    }

    fn target_type(&self) -> &'static str {
        "memory"
    }
}
