//! Configuration type definitions with auto-tuning based on system resources.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::info;

use crate::error::{EtlError, Result};
use crate::schema::TargetDb;

/// System resource information for auto-tuning.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total RAM in bytes.
    pub total_memory_bytes: u64,
    /// Total RAM in GB.
    pub total_memory_gb: f64,
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Detect system resources.
    pub fn detect() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        let total_memory_bytes = sys.total_memory();
        Self {
            total_memory_bytes,
            total_memory_gb: total_memory_bytes as f64 / (1024.0 * 1024.0 * 1024.0),
            cpu_cores: sys.cpus().len(),
        }
    }

    pub fn log(&self) {
        info!(
            "System resources: {:.1} GB RAM, {} CPU cores",
            self.total_memory_gb, self.cpu_cores
        );
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Legacy source database (MSSQL).
    pub source: SourceConfig,

    /// One PostgreSQL target per database module. Scoped runs only need
    /// entries for the modules they touch.
    pub targets: BTreeMap<TargetDb, TargetConfig>,

    /// Run behavior.
    #[serde(default)]
    pub run: RunConfig,
}

impl Config {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that weren't explicitly set in the config file.
    pub fn with_auto_tuning(mut self) -> Self {
        let resources = SystemResources::detect();
        resources.log();
        self.run = self.run.with_auto_tuning(&resources);
        self
    }

    /// Target configuration for a database, or a config error naming it.
    pub fn target(&self, db: TargetDb) -> Result<&TargetConfig> {
        self.targets.get(&db).ok_or_else(|| {
            EtlError::Config(format!("no target configured for database '{}'", db))
        })
    }
}

/// Source database (MSSQL) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 1433).
    #[serde(default = "default_mssql_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    pub password: String,

    /// Encrypt the connection (default: false).
    #[serde(default)]
    pub encrypt: bool,

    /// Trust the server certificate (default: true).
    #[serde(default = "default_true")]
    pub trust_server_cert: bool,
}

/// One PostgreSQL target database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    pub password: String,
}

/// Identity registry persistence backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryBackend {
    /// Signed JSON file (default).
    #[default]
    File,
    /// `id_mappings` table in the core target database.
    Postgres,
    /// Not persisted. Only sensible for tests and dry runs.
    Memory,
}

/// Identity registry configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub backend: RegistryBackend,

    /// File path for the `file` backend (default: `registry.json`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl RegistryConfig {
    pub fn get_path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| PathBuf::from("registry.json"))
    }
}

/// Run behavior configuration.
/// Performance-related fields use Option<T> to distinguish between "not set"
/// (use auto-tuned default) and "explicitly set" (use provided value).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RunConfig {
    /// Parallel table workers per wave. Auto-tuned from CPU cores if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    /// Rows per upsert statement. Auto-tuned from RAM if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,

    /// Retry attempts for transient failures (default: 3).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    /// Base backoff delay in milliseconds, doubled per attempt (default: 500).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_base_ms: Option<u64>,

    /// Database modules to migrate. Empty means all.
    #[serde(default)]
    pub modules: Vec<TargetDb>,

    /// Explicit table subset. Empty means all tables in scope.
    #[serde(default)]
    pub tables: Vec<String>,

    /// External table catalog. Defaults to the catalog built into the crate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog_path: Option<PathBuf>,

    /// Prefix prepended to every target table name.
    #[serde(default)]
    pub table_prefix: String,

    /// Identity registry persistence.
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Maximum MSSQL connections. Auto-tuned from workers if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_source_connections: Option<usize>,

    /// Maximum connections per PostgreSQL target. Auto-tuned from workers if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_target_connections: Option<usize>,
}

impl RunConfig {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that are None (not explicitly set).
    pub fn with_auto_tuning(mut self, resources: &SystemResources) -> Self {
        let ram_gb = resources.total_memory_gb;
        let cores = resources.cpu_cores;

        // Workers: cores - 2, clamped to 2..=8. The tables are small enough
        // that wave width, not CPU, is the practical ceiling.
        if self.workers.is_none() {
            self.workers = Some(cores.saturating_sub(2).clamp(2, 8));
        }
        let workers = self.workers.unwrap_or(4);

        // Upsert batch: 500 rows base, +500 per 8 GB of RAM, cap at 5000.
        if self.batch_size.is_none() {
            let batch = 500 + (ram_gb / 8.0) as usize * 500;
            self.batch_size = Some(batch.min(5_000));
        }

        if self.max_source_connections.is_none() {
            self.max_source_connections = Some((workers + 2).min(16));
        }

        if self.max_target_connections.is_none() {
            self.max_target_connections = Some((workers * 2).clamp(4, 32));
        }

        info!(
            "Auto-tuned run config: workers={}, batch_size={}, source_conns={}, target_conns={}",
            self.workers.unwrap_or(4),
            self.batch_size.unwrap_or(500),
            self.max_source_connections.unwrap_or(8),
            self.max_target_connections.unwrap_or(8),
        );

        self
    }

    // Accessor methods that return the effective value (with fallback
    // defaults), used when the config hasn't been auto-tuned yet.

    pub fn get_workers(&self) -> usize {
        self.workers.unwrap_or(4)
    }

    pub fn get_batch_size(&self) -> usize {
        self.batch_size.unwrap_or(500)
    }

    pub fn get_max_retries(&self) -> u32 {
        self.max_retries.unwrap_or(3)
    }

    pub fn get_retry_base_ms(&self) -> u64 {
        self.retry_base_ms.unwrap_or(500)
    }

    pub fn get_max_source_connections(&self) -> usize {
        self.max_source_connections.unwrap_or(8)
    }

    pub fn get_max_target_connections(&self) -> usize {
        self.max_target_connections.unwrap_or(8)
    }
}

fn default_mssql_port() -> u16 {
    1433
}

fn default_pg_port() -> u16 {
    5432
}

fn default_true() -> bool {
    true
}
