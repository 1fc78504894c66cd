//! Run driver.
//!
//! Walks the dependency waves produced by the graph, migrates the tables of
//! each wave on a bounded worker pool, persists freshly minted identities at
//! every wave boundary, and closes the run with the cross-database existence
//! probe. Per-table failures never abort the process: they mark the table
//! failed, skip whatever depends on the remaining waves, and still hand back
//! a full [`RunReport`].

mod pools;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{EtlError, Result};
use crate::registry::{IdentityRegistry, RegistryStore};
use crate::report::{QuarantineEntry, RunReport, TableReport, TableStatus};
use crate::schema::{DependencyGraph, LoadOrder, SchemaCatalog, TableSpec, TargetDb};
use crate::source::SourceReader;
use crate::target::TargetWriter;
use crate::transform::{Transformer, XdbRef, XdbResolver};

/// Backoff never sleeps longer than this, however many retries are left.
const MAX_BACKOFF_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    max_retries: u32,
    base_ms: u64,
}

/// Everything one table migration needs, owned so it can cross into a task.
struct TableJob {
    spec: TableSpec,
    source: Arc<dyn SourceReader>,
    target: Arc<dyn TargetWriter>,
    transformer: Arc<Transformer>,
    registry: Arc<IdentityRegistry>,
    policy: RetryPolicy,
}

struct TableOutcome {
    report: TableReport,
    quarantine: Vec<QuarantineEntry>,
    warnings: Vec<String>,
}

/// Coordinates a full migration run.
pub struct Orchestrator {
    config: Config,
    /// Full catalog; used to classify cross-database references and to name
    /// tables outside the run scope.
    catalog: Arc<SchemaCatalog>,
    /// Catalog restricted to the configured modules/tables; drives the graph.
    scope: Arc<SchemaCatalog>,
    source: Arc<dyn SourceReader>,
    targets: HashMap<TargetDb, Arc<dyn TargetWriter>>,
    registry: Arc<IdentityRegistry>,
    store: Arc<dyn RegistryStore>,
    xdb: Arc<XdbResolver>,
}

impl Orchestrator {
    /// Connect to the source and to every target database the scoped catalog
    /// touches. With `dry_run` the writers and the registry store are
    /// replaced by in-memory stand-ins, so the run exercises the full
    /// pipeline without writing anywhere.
    pub async fn new(config: Config, dry_run: bool) -> Result<Self> {
        let catalog = pools::load_catalog(&config)?;
        let scope = catalog.scoped(&config.run.modules, &config.run.tables)?;
        info!(
            tables = scope.tables.len(),
            dry_run,
            config_hash = %config.hash(),
            "initializing orchestrator"
        );

        let source = pools::build_source(&config).await?;
        let targets = pools::build_targets(&config, &scope, dry_run).await?;
        let store = pools::build_registry_store(&config, dry_run)?;

        let registry = Arc::new(IdentityRegistry::new());
        let xdb = Arc::new(XdbResolver::new(Arc::clone(&registry)));
        Ok(Self {
            config,
            catalog: Arc::new(catalog),
            scope: Arc::new(scope),
            source,
            targets,
            registry,
            store,
            xdb,
        })
    }

    /// Assemble an orchestrator from pre-built components. Used by tests and
    /// by embedders that bring their own source or sinks.
    pub fn with_components(
        config: Config,
        catalog: SchemaCatalog,
        source: Arc<dyn SourceReader>,
        targets: HashMap<TargetDb, Arc<dyn TargetWriter>>,
        store: Arc<dyn RegistryStore>,
    ) -> Result<Self> {
        let scope = catalog.scoped(&config.run.modules, &config.run.tables)?;
        let registry = Arc::new(IdentityRegistry::new());
        let xdb = Arc::new(XdbResolver::new(Arc::clone(&registry)));
        Ok(Self {
            config,
            catalog: Arc::new(catalog),
            scope: Arc::new(scope),
            source,
            targets,
            registry,
            store,
            xdb,
        })
    }

    /// The load order this run would use, without touching any database.
    pub fn plan(&self) -> Result<LoadOrder> {
        DependencyGraph::build(&self.scope).topological_order()
    }

    /// The catalog restricted to this run's scope.
    pub fn scope(&self) -> &SchemaCatalog {
        &self.scope
    }

    /// Probe source, targets, and registry store connectivity.
    pub async fn health_check(&self) -> Result<()> {
        self.source.probe().await?;
        info!(kind = self.source.source_type(), "source reachable");

        let mut dbs: Vec<TargetDb> = self.targets.keys().copied().collect();
        dbs.sort();
        for db in dbs {
            self.targets[&db].probe().await?;
            info!(database = %db, kind = self.targets[&db].target_type(), "target reachable");
        }

        self.store.init().await?;
        info!(backend = self.store.backend_type(), "registry store reachable");
        Ok(())
    }

    /// Execute the migration.
    ///
    /// Returns `Err` only when the run cannot meaningfully start or continue:
    /// a cyclic catalog, a missing writer, registry hydration failure, or a
    /// failure to persist minted identities (losing those would poison FK
    /// resolution on the next run). Everything else, including per-table
    /// failures and cancellation, lands in the returned report.
    pub async fn run(&self, cancel: CancellationToken) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let order = self.plan()?;
        info!(
            run_id = %run_id,
            tables = order.len(),
            waves = order.waves.len(),
            workers = self.config.run.get_workers(),
            "starting migration run"
        );

        // Resolve every spec and writer up front so a scoping mistake aborts
        // before any row moves.
        let mut spec_waves: Vec<Vec<TableSpec>> = Vec::with_capacity(order.waves.len());
        for wave in &order.waves {
            let mut specs = Vec::with_capacity(wave.len());
            for name in wave {
                let spec = self.scope.table(name).cloned().ok_or_else(|| {
                    EtlError::catalog(format!("load order references unknown table '{}'", name))
                })?;
                if !self.targets.contains_key(&spec.db) {
                    return Err(EtlError::Config(format!(
                        "no writer for database '{}' required by table '{}'",
                        spec.db, spec.name
                    )));
                }
                specs.push(spec);
            }
            spec_waves.push(specs);
        }

        self.store.init().await?;
        let persisted = self.store.load().await?;
        if !persisted.is_empty() {
            info!(
                mappings = persisted.len(),
                backend = self.store.backend_type(),
                "hydrated identity registry"
            );
        }
        self.registry.absorb(persisted);

        let transformer = Arc::new(Transformer::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.xdb),
            Arc::clone(&self.catalog),
        ));
        let semaphore = Arc::new(Semaphore::new(self.config.run.get_workers()));
        let policy = RetryPolicy {
            max_retries: self.config.run.get_max_retries(),
            base_ms: self.config.run.get_retry_base_ms(),
        };

        let mut report = RunReport::new(run_id, started_at, order.tables());
        let mut fatal = false;
        let mut cancelled = false;

        for (wave_no, specs) in spec_waves.into_iter().enumerate() {
            if fatal || cancelled {
                for spec in specs {
                    report.add_table(TableReport::skipped(spec.name, spec.db));
                }
                continue;
            }
            info!(wave = wave_no + 1, size = specs.len(), "starting wave");

            let mut handles = Vec::with_capacity(specs.len());
            for spec in specs {
                // Cancellation is honored at table boundaries: in-flight
                // tables finish, nothing new starts.
                if cancel.is_cancelled() {
                    if !cancelled {
                        cancelled = true;
                        info!("cancellation requested, finishing in-flight tables");
                    }
                    report.add_table(TableReport::skipped(spec.name, spec.db));
                    continue;
                }

                let permit = Arc::clone(&semaphore)
                    .acquire_owned()
                    .await
                    .expect("semaphore closed");
                let name = spec.name.clone();
                let db = spec.db;
                let job = TableJob {
                    spec,
                    source: Arc::clone(&self.source),
                    target: Arc::clone(&self.targets[&db]),
                    transformer: Arc::clone(&transformer),
                    registry: Arc::clone(&self.registry),
                    policy,
                };
                let handle = tokio::spawn(async move {
                    let result = migrate_table(job).await;
                    drop(permit);
                    result
                });
                handles.push((name, db, handle));
            }

            for (name, db, handle) in handles {
                match handle.await {
                    Ok(Ok(outcome)) => {
                        info!(
                            table = %name,
                            loaded = outcome.report.rows_loaded,
                            quarantined = outcome.report.rows_quarantined,
                            patched = outcome.report.patches_applied,
                            "table completed"
                        );
                        report.warnings.extend(outcome.warnings);
                        report.quarantine.extend(outcome.quarantine);
                        report.add_table(outcome.report);
                    }
                    Ok(Err(e)) => {
                        error!(table = %name, "table failed: {}", e.format_detailed());
                        report.add_table(TableReport::failed(&name, db, e.to_string()));
                        fatal = true;
                    }
                    Err(e) => {
                        error!(table = %name, "table task panicked: {}", e);
                        report.add_table(TableReport::failed(
                            &name,
                            db,
                            format!("task panicked: {}", e),
                        ));
                        fatal = true;
                    }
                }
            }

            self.flush_registry(policy).await?;

            if cancel.is_cancelled() && !cancelled {
                cancelled = true;
                info!("cancellation requested, skipping remaining waves");
            }
        }

        if !fatal && !cancelled {
            self.check_cross_references(&mut report).await;
        }

        report.finish(cancelled);
        info!(
            run_id = %run_id,
            status = ?report.status,
            tables = report.tables.len(),
            rows_loaded = report.rows_loaded,
            rows_quarantined = report.rows_quarantined,
            duration_s = report.duration_seconds,
            "run finished"
        );
        Ok(report)
    }

    /// Persist identities minted since the last flush. Failure here is fatal:
    /// rows carrying an unpersisted identity are already in the targets, and
    /// a later run would mint different UUIDs for the same legacy keys.
    async fn flush_registry(&self, policy: RetryPolicy) -> Result<()> {
        let minted = self.registry.take_dirty();
        if minted.is_empty() {
            return Ok(());
        }
        let count = minted.len();
        let entries = Arc::new(minted);
        let store = Arc::clone(&self.store);
        let mut retries = 0;
        with_retries("identity registry", policy, &mut retries, move || {
            let store = Arc::clone(&store);
            let entries = Arc::clone(&entries);
            async move { store.append(&entries).await }.boxed()
        })
        .await
        .map_err(|e| match e {
            EtlError::RetriesExhausted {
                attempts, message, ..
            } => EtlError::Registry(format!(
                "failed to persist {} identity mappings after {} attempts: {}",
                count, attempts, message
            )),
            other => other,
        })?;
        debug!(mappings = count, "persisted identity mappings");
        Ok(())
    }

    /// End-of-run existence probe for references that cross database
    /// boundaries. Findings are warnings: the other database may simply not
    /// have been migrated yet.
    async fn check_cross_references(&self, report: &mut RunReport) {
        let refs = self.xdb.take_refs();
        if refs.is_empty() {
            return;
        }
        info!(references = refs.len(), "verifying cross-database references");

        let mut by_table: BTreeMap<String, Vec<XdbRef>> = BTreeMap::new();
        for r in refs {
            by_table.entry(r.ref_table.clone()).or_default().push(r);
        }

        for (table, refs) in by_table {
            let Some(spec) = self.catalog.table(&table) else {
                report.warnings.push(format!(
                    "cross-database references into unknown table '{}' cannot be verified",
                    table
                ));
                continue;
            };
            let Some(writer) = self.targets.get(&spec.db) else {
                report.warnings.push(format!(
                    "{} cross-database references into '{}' ({}) not verified: database outside run scope",
                    refs.len(),
                    table,
                    spec.db
                ));
                continue;
            };

            let ids: Vec<Uuid> = refs.iter().map(|r| r.target_id).collect();
            match writer.missing_ids(spec, &ids).await {
                Ok(missing) if missing.is_empty() => {}
                Ok(missing) => {
                    let missing: HashSet<Uuid> = missing.into_iter().collect();
                    for r in refs.iter().filter(|r| missing.contains(&r.target_id)) {
                        warn!(
                            from = %r.from_table,
                            field = %r.field,
                            to = %table,
                            id = %r.target_id,
                            "cross-database reference has no target row"
                        );
                        report.warnings.push(format!(
                            "{}.{} references {} row {} which does not exist yet",
                            r.from_table, r.field, table, r.target_id
                        ));
                    }
                }
                Err(e) => {
                    report.warnings.push(format!(
                        "cross-database check against '{}' failed: {}",
                        table, e
                    ));
                }
            }
        }
    }
}

/// Migrate one table end to end: fetch, transform, upsert, patch.
async fn migrate_table(job: TableJob) -> Result<TableOutcome> {
    let started = Instant::now();
    let mut retries = 0u32;
    info!(table = %job.spec.name, db = %job.spec.db, "starting table");

    let rows = {
        let source = Arc::clone(&job.source);
        let spec = job.spec.clone();
        with_retries(&job.spec.name, job.policy, &mut retries, move || {
            let source = Arc::clone(&source);
            let spec = spec.clone();
            async move { source.fetch(&spec).await }.boxed()
        })
        .await?
    };
    let extracted = rows.len() as u64;
    debug!(table = %job.spec.name, rows = extracted, "fetched source rows");

    let transformed = job.transformer.transform_all(&job.spec, &rows);
    let records = Arc::new(transformed.records);
    let patches = transformed.patches;
    let quarantine = transformed.quarantine;

    let loaded = if records.is_empty() {
        0
    } else {
        let target = Arc::clone(&job.target);
        let spec = job.spec.clone();
        let records = Arc::clone(&records);
        with_retries(&job.spec.name, job.policy, &mut retries, move || {
            let target = Arc::clone(&target);
            let spec = spec.clone();
            let records = Arc::clone(&records);
            async move { target.upsert(&spec, &records).await }.boxed()
        })
        .await?
    };

    let mut warnings = Vec::new();
    let mut patches_applied = 0u64;
    if !patches.is_empty() {
        // Parents are resolved strictly by lookup: a parent that never minted
        // an identity (quarantined, or filtered at the source) leaves the
        // field null.
        let mut by_field: BTreeMap<String, Vec<(Uuid, Uuid)>> = BTreeMap::new();
        for patch in &patches {
            match job.registry.lookup(&job.spec.name, &patch.parent_key) {
                Some(parent_id) => by_field
                    .entry(patch.field.clone())
                    .or_default()
                    .push((patch.row_id, parent_id)),
                None => {
                    warn!(
                        table = %job.spec.name,
                        row = %patch.row_id,
                        parent = %patch.parent_key,
                        "self-reference parent unknown, leaving null"
                    );
                    warnings.push(format!(
                        "{}: row {} references unknown parent '{}', {} left null",
                        job.spec.name, patch.row_id, patch.parent_key, patch.field
                    ));
                }
            }
        }

        // A parent can hold an identity yet be absent from the table (its own
        // row was quarantined). Patching those would trip the FK, so probe
        // and patch only what exists.
        let loaded_ids: HashSet<Uuid> = records
            .iter()
            .filter_map(|r| r.get(&job.spec.primary_key).as_uuid())
            .collect();
        let mut unknown: Vec<Uuid> = by_field
            .values()
            .flatten()
            .map(|(_, parent)| *parent)
            .filter(|id| !loaded_ids.contains(id))
            .collect();
        unknown.sort();
        unknown.dedup();
        let missing: HashSet<Uuid> = if unknown.is_empty() {
            HashSet::new()
        } else {
            job.target
                .missing_ids(&job.spec, &unknown)
                .await?
                .into_iter()
                .collect()
        };

        for (field, pairs) in by_field {
            let (ready, dangling): (Vec<_>, Vec<_>) = pairs
                .into_iter()
                .partition(|(_, parent)| !missing.contains(parent));
            for (row_id, parent_id) in dangling {
                warnings.push(format!(
                    "{}: row {} references parent {} that was not loaded, {} left null",
                    job.spec.name, row_id, parent_id, field
                ));
            }
            if !ready.is_empty() {
                patches_applied += job.target.apply_patches(&job.spec, &field, &ready).await?;
            }
        }
    }

    let report = TableReport {
        table: job.spec.name.clone(),
        db: job.spec.db,
        status: TableStatus::Completed,
        rows_extracted: extracted,
        rows_transformed: records.len() as u64,
        rows_loaded: loaded,
        rows_quarantined: quarantine.len() as u64,
        patches_applied,
        attempts: retries + 1,
        duration_ms: started.elapsed().as_millis() as u64,
        error: None,
    };
    Ok(TableOutcome {
        report,
        quarantine,
        warnings,
    })
}

/// Retry `op` on transient errors with bounded exponential backoff.
/// Non-transient errors pass straight through.
async fn with_retries<T>(
    label: &str,
    policy: RetryPolicy,
    retries: &mut u32,
    mut op: impl FnMut() -> BoxFuture<'static, Result<T>>,
) -> Result<T> {
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && *retries < policy.max_retries => {
                *retries += 1;
                let delay = backoff_delay(policy.base_ms, *retries);
                warn!(
                    "Transient failure on {} (attempt {}/{}), retrying in {:?}: {}",
                    label, *retries, policy.max_retries, delay, e
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) if e.is_transient() => {
                return Err(EtlError::RetriesExhausted {
                    table: label.to_string(),
                    attempts: *retries + 1,
                    message: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        }
    }
}

fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let factor = 1u64 << attempt.saturating_sub(1).min(16);
    Duration::from_millis(base_ms.saturating_mul(factor).min(MAX_BACKOFF_MS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(500, 1), Duration::from_millis(500));
        assert_eq!(backoff_delay(500, 2), Duration::from_millis(1000));
        assert_eq!(backoff_delay(500, 3), Duration::from_millis(2000));
        assert_eq!(backoff_delay(500, 10), Duration::from_millis(MAX_BACKOFF_MS));
        // Huge attempt counts must not overflow.
        assert_eq!(backoff_delay(500, 200), Duration::from_millis(MAX_BACKOFF_MS));
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy {
            max_retries: 3,
            base_ms: 1,
        };
        let mut retries = 0;
        let counter = Arc::clone(&calls);
        let result = with_retries("flaky", policy, &mut retries, move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(EtlError::pool("connection reset", "test"))
                } else {
                    Ok(42)
                }
            }
            .boxed()
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retries, 2);
    }

    #[tokio::test]
    async fn test_retry_budget_exhausts() {
        let policy = RetryPolicy {
            max_retries: 2,
            base_ms: 1,
        };
        let mut retries = 0;
        let result: Result<()> = with_retries("down", policy, &mut retries, || {
            async { Err(EtlError::pool("timed out", "test")) }.boxed()
        })
        .await;
        match result {
            Err(EtlError::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected RetriesExhausted, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_non_transient_error_fails_fast() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy {
            max_retries: 5,
            base_ms: 1,
        };
        let mut retries = 0;
        let counter = Arc::clone(&calls);
        let result: Result<()> = with_retries("broken", policy, &mut retries, move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(EtlError::load("companies", "unique violation"))
            }
            .boxed()
        })
        .await;
        assert!(matches!(result, Err(EtlError::Load { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(retries, 0);
    }
}
