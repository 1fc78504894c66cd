//! # area-etl
//!
//! Batch migration engine for the regional healthcare registry: moves the
//! legacy denormalized SQL Server schema into six normalized PostgreSQL
//! databases, with support for:
//!
//! - **Dependency-ordered loading**: tables are migrated in topological
//!   waves so FK targets always land before their referents
//! - **Identity resolution**: every legacy key maps to exactly one UUID,
//!   persisted across runs so re-runs and cross-database references agree
//! - **Idempotent upserts** on natural keys, one transaction per table
//! - **Row quarantine** for values that violate the target model, without
//!   aborting the batch
//! - **Parallel waves** with a bounded worker pool and retry with backoff
//!
//! ## Example
//!
//! ```rust,no_run
//! use area_etl::{Config, Orchestrator};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> area_etl::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let orchestrator = Orchestrator::new(config, false).await?;
//!     let report = orchestrator.run(CancellationToken::new()).await?;
//!     println!("Loaded {} rows", report.rows_loaded);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod extract;
pub mod load;
pub mod orchestrator;
pub mod registry;
pub mod report;
pub mod schema;
pub mod source;
pub mod target;
pub mod transform;

// Re-exports for convenient access
pub use config::{Config, RegistryBackend, RunConfig, SourceConfig, TargetConfig};
pub use error::{EtlError, Result};
pub use extract::{FieldValue, Record};
pub use orchestrator::Orchestrator;
pub use registry::{IdentityRegistry, RegistryStore};
pub use report::{QuarantineEntry, QuarantineReason, RunReport, RunStatus, TableStatus};
pub use schema::{DependencyGraph, LoadOrder, SchemaCatalog, TableSpec, TargetDb};
pub use source::{MssqlSource, SourceReader, SourceRow};
pub use target::{PgTarget, TargetWriter};
pub use transform::Transformer;
