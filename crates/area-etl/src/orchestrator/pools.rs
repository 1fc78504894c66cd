//! Connection factories for the orchestrator: source reader, one target
//! writer per database in scope, and the identity registry store.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{Config, RegistryBackend};
use crate::error::Result;
use crate::registry::{FileStore, MemoryStore, PgStore, RegistryStore};
use crate::schema::{SchemaCatalog, TargetDb};
use crate::source::{MssqlSource, SourceReader};
use crate::target::{build_pool, MemoryTarget, PgTarget, TargetWriter};

/// Load the table catalog: an external YAML file when configured, the
/// compiled-in one otherwise.
pub(super) fn load_catalog(config: &Config) -> Result<SchemaCatalog> {
    match &config.run.catalog_path {
        Some(path) => SchemaCatalog::load(path),
        None => SchemaCatalog::builtin(),
    }
}

pub(super) async fn build_source(config: &Config) -> Result<Arc<dyn SourceReader>> {
    let source = MssqlSource::with_max_connections(
        config.source.clone(),
        config.run.get_max_source_connections() as u32,
    )
    .await?;
    Ok(Arc::new(source))
}

/// One writer per database the scoped catalog touches. Databases outside the
/// scope need no credentials. A dry run swaps every writer for an in-memory
/// sink so nothing reaches PostgreSQL.
pub(super) async fn build_targets(
    config: &Config,
    scope: &SchemaCatalog,
    dry_run: bool,
) -> Result<HashMap<TargetDb, Arc<dyn TargetWriter>>> {
    let mut dbs: Vec<TargetDb> = scope.tables.iter().map(|t| t.db).collect();
    dbs.sort();
    dbs.dedup();

    let mut targets: HashMap<TargetDb, Arc<dyn TargetWriter>> = HashMap::new();
    for db in dbs {
        let writer: Arc<dyn TargetWriter> = if dry_run {
            Arc::new(MemoryTarget::new())
        } else {
            Arc::new(
                PgTarget::new(
                    config.target(db)?,
                    &config.run.table_prefix,
                    config.run.get_batch_size(),
                    config.run.get_max_target_connections(),
                )
                .await?,
            )
        };
        targets.insert(db, writer);
    }
    Ok(targets)
}

/// Registry store per the configured backend. A dry run always gets a memory
/// store: minted identities must not outlive a run that wrote nothing.
pub(super) fn build_registry_store(
    config: &Config,
    dry_run: bool,
) -> Result<Arc<dyn RegistryStore>> {
    if dry_run {
        return Ok(Arc::new(MemoryStore::new()));
    }
    let store: Arc<dyn RegistryStore> = match config.run.registry.backend {
        RegistryBackend::File => Arc::new(FileStore::new(config.run.registry.get_path())),
        RegistryBackend::Postgres => {
            // Mappings live next to the core data; two connections are plenty
            // for one load and one append per wave.
            let pool = build_pool(config.target(TargetDb::Core)?, 2)?;
            Arc::new(PgStore::new(pool))
        }
        RegistryBackend::Memory => Arc::new(MemoryStore::new()),
    };
    Ok(store)
}
