//! Error types for the migration engine.

use thiserror::Error;

/// Main error type for migration operations.
///
/// Quarantine reasons are deliberately *not* part of this enum: a row that
/// fails validation is set aside (see [`crate::report::QuarantineEntry`]) and
/// the batch keeps going. Everything here aborts a table or the whole run.
#[derive(Error, Debug)]
pub enum EtlError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Table catalog error (unknown reference, malformed field spec, etc.)
    #[error("Catalog error: {0}")]
    Catalog(String),

    /// The dependency graph has a cycle after removing self-referential edges
    #[error("Cyclic dependency between tables: {0}")]
    CyclicDependency(String),

    /// Source database connection or query error
    #[error("Source database error: {0}")]
    Source(#[from] tiberius::error::Error),

    /// Target database connection or query error
    #[error("Target database error: {0}")]
    Target(#[from] tokio_postgres::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// Load failed for a specific table (constraint violation, rollback)
    #[error("Load failed for table {table}: {message}")]
    Load { table: String, message: String },

    /// Identity registry store error
    #[error("Registry error: {0}")]
    Registry(String),

    /// Transient failures exhausted their retry budget
    #[error("Table {table} failed after {attempts} attempts: {message}")]
    RetriesExhausted {
        table: String,
        attempts: u32,
        message: String,
    },

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Migration was cancelled (SIGINT, etc.)
    #[error("Migration cancelled")]
    Cancelled,
}

impl EtlError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl Into<String>, context: impl Into<String>) -> Self {
        EtlError::Pool {
            message: message.into(),
            context: context.into(),
        }
    }

    /// Create a Load error
    pub fn load(table: impl Into<String>, message: impl Into<String>) -> Self {
        EtlError::Load {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a Catalog error
    pub fn catalog(message: impl Into<String>) -> Self {
        EtlError::Catalog(message.into())
    }

    /// Whether this error is worth retrying with backoff.
    ///
    /// Network-level failures (dropped connections, timeouts, pool
    /// exhaustion) are transient. Constraint violations are not: they mean
    /// the mapping is wrong and retrying would only repeat the rollback.
    pub fn is_transient(&self) -> bool {
        match self {
            EtlError::Io(_) | EtlError::Pool { .. } => true,
            EtlError::Source(_) => true,
            EtlError::Target(e) => e.code().is_none(),
            _ => false,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        // Add error chain for wrapped errors
        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            EtlError::Config(_) | EtlError::Catalog(_) => 2,
            EtlError::CyclicDependency(_) => 3,
            EtlError::Cancelled => 130,
            _ => 1,
        }
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, EtlError>;
