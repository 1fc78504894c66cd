//! Legacy source access: the read trait and its implementations.

mod memory;
mod mssql;
mod types;

pub use memory::MemorySource;
pub use mssql::MssqlSource;
pub use types::*;

use async_trait::async_trait;

use crate::error::Result;
use crate::schema::TableSpec;

/// Row-oriented read interface over the legacy source.
///
/// One call per table, scoped by the table's catalog source spec (a table, a
/// join, or a filtered view). Implementations are read-only with respect to
/// the source.
#[async_trait]
pub trait SourceReader: Send + Sync {
    /// Fetch every row for the table's legacy equivalent.
    async fn fetch(&self, spec: &TableSpec) -> Result<Vec<SourceRow>>;

    /// Cheap connectivity probe.
    async fn probe(&self) -> Result<()>;

    /// Driver name for logs.
    fn source_type(&self) -> &str;
}
