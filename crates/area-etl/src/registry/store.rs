//! Persistence backends for the identity registry.
//!
//! The orchestrator works with `Arc<dyn RegistryStore>` without knowing the
//! concrete backend: a signed JSON file, a table in the core target
//! database, or plain memory for tests and dry runs.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use deadpool_postgres::Pool;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

use super::IdentityMapping;
use crate::error::{EtlError, Result};
use crate::load::quote_literal;

type HmacSha256 = Hmac<Sha256>;

/// Fixed signing tag: the registry must stay verifiable across configuration
/// changes, so the key cannot derive from the config hash.
const SIGNING_KEY: &[u8] = b"area-etl/registry/v1";

/// Storage backend for identity mappings.
///
/// Implementations must be `Send + Sync`; the orchestrator flushes newly
/// minted mappings after every wave.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// Prepare the backing storage. Idempotent.
    async fn init(&self) -> Result<()>;

    /// Load all persisted mappings.
    async fn load(&self) -> Result<Vec<IdentityMapping>>;

    /// Persist newly minted mappings.
    async fn append(&self, entries: &[IdentityMapping]) -> Result<()>;

    /// Backend name for logging.
    fn backend_type(&self) -> &'static str;
}

#[derive(Debug, Serialize, Deserialize)]
struct RegistryFile {
    entries: Vec<IdentityMapping>,
    hmac: Option<String>,
}

fn compute_hmac(entries: &[IdentityMapping]) -> Result<String> {
    let content = serde_json::to_string(entries)?;
    let mut mac = HmacSha256::new_from_slice(SIGNING_KEY)
        .map_err(|e| EtlError::Registry(format!("failed to create HMAC: {}", e)))?;
    mac.update(content.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Signed JSON file store. The whole mapping set is rewritten on each flush
/// with an atomic temp-file rename.
pub struct FileStore {
    path: PathBuf,
    cache: Mutex<Vec<IdentityMapping>>,
}

impl FileStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            cache: Mutex::new(Vec::new()),
        }
    }

    fn write_all(&self, entries: &[IdentityMapping]) -> Result<()> {
        let file = RegistryFile {
            entries: entries.to_vec(),
            hmac: Some(compute_hmac(entries)?),
        };
        let content = serde_json::to_string_pretty(&file)?;

        // Atomic write: temp file in the same directory, then rename.
        let temp_path = self.path.with_extension("tmp");
        std::fs::write(&temp_path, &content)?;
        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

#[async_trait]
impl RegistryStore for FileStore {
    async fn init(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }

    async fn load(&self) -> Result<Vec<IdentityMapping>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path)?;
        let file: RegistryFile = serde_json::from_str(&content)?;

        if let Some(stored) = &file.hmac {
            let expected = compute_hmac(&file.entries)?;
            if stored != &expected {
                return Err(EtlError::Registry(
                    "registry file integrity check failed: HMAC mismatch".to_string(),
                ));
            }
        } else {
            tracing::warn!(
                path = %self.path.display(),
                "registry file has no HMAC signature, integrity cannot be verified"
            );
        }

        *self.cache.lock().expect("registry store lock") = file.entries.clone();
        Ok(file.entries)
    }

    async fn append(&self, entries: &[IdentityMapping]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut cache = self.cache.lock().expect("registry store lock");
        cache.extend_from_slice(entries);
        self.write_all(&cache)
    }

    fn backend_type(&self) -> &'static str {
        "file"
    }
}

/// Registry table in the core target database.
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn client(&self) -> Result<deadpool_postgres::Object> {
        self.pool
            .get()
            .await
            .map_err(|e| EtlError::pool(e.to_string(), "registry store"))
    }
}

/// Multi-row insert with literal values, run through `simple_query`.
/// Mappings are immutable once minted, so conflicts do nothing.
fn build_append_sql(entries: &[IdentityMapping]) -> String {
    let values: Vec<String> = entries
        .iter()
        .map(|e| {
            format!(
                "({}, {}, '{}'::uuid)",
                quote_literal(&e.source_domain),
                quote_literal(&e.source_key),
                e.target_id
            )
        })
        .collect();
    format!(
        "INSERT INTO id_mappings (source_domain, source_key, target_id) VALUES {} \
         ON CONFLICT (source_domain, source_key) DO NOTHING",
        values.join(", ")
    )
}

#[async_trait]
impl RegistryStore for PgStore {
    async fn init(&self) -> Result<()> {
        let client = self.client().await?;
        client
            .batch_execute(
                "CREATE TABLE IF NOT EXISTS id_mappings (
                    source_domain TEXT NOT NULL,
                    source_key TEXT NOT NULL,
                    target_id UUID NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                    PRIMARY KEY (source_domain, source_key)
                )",
            )
            .await?;
        Ok(())
    }

    async fn load(&self) -> Result<Vec<IdentityMapping>> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT source_domain, source_key, target_id::text FROM id_mappings",
                &[],
            )
            .await?;
        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get(2);
            entries.push(IdentityMapping {
                source_domain: row.get(0),
                source_key: row.get(1),
                target_id: Uuid::parse_str(&id)
                    .map_err(|e| EtlError::Registry(format!("malformed target_id: {}", e)))?,
            });
        }
        Ok(entries)
    }

    async fn append(&self, entries: &[IdentityMapping]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let client = self.client().await?;
        client.simple_query(&build_append_sql(entries)).await?;
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "postgres"
    }
}

/// In-memory store for tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<Vec<IdentityMapping>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RegistryStore for MemoryStore {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn load(&self) -> Result<Vec<IdentityMapping>> {
        Ok(self.entries.lock().expect("registry store lock").clone())
    }

    async fn append(&self, entries: &[IdentityMapping]) -> Result<()> {
        self.entries
            .lock()
            .expect("registry store lock")
            .extend_from_slice(entries);
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
