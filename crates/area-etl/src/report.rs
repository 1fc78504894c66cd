//! Run reporting: per-table outcomes, quarantined rows and the final summary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::Result;
use crate::schema::TargetDb;

/// Why a row was set aside instead of loaded.
///
/// These are data-quality outcomes, not run errors: the batch continues and
/// the entries surface in the [`RunReport`].
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum QuarantineReason {
    #[error("invalid enum value '{value}' for field '{field}'")]
    InvalidEnumValue { field: String, value: String },

    #[error("numeric overflow in field '{field}': {value}")]
    NumericOverflow { field: String, value: String },

    #[error("fields '{first}' and '{second}' are mutually exclusive")]
    MutuallyExclusiveFieldViolation { first: String, second: String },

    #[error("missing required field '{field}'")]
    MissingRequiredField { field: String },
}

/// A rejected row: where it came from, why, and a raw snapshot for triage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuarantineEntry {
    pub table: String,
    /// Legacy key of the offending row, when one was readable.
    pub source_key: Option<String>,
    #[serde(flatten)]
    pub reason: QuarantineReason,
    /// Raw source row as JSON.
    pub row: serde_json::Value,
}

/// Terminal state of one table's batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    Completed,
    Failed,
    /// Not attempted: the run stopped (cancellation or an earlier fatal
    /// failure) before this table's boundary.
    Skipped,
}

/// Counts and outcome for one table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableReport {
    pub table: String,
    pub db: TargetDb,
    pub status: TableStatus,
    pub rows_extracted: u64,
    pub rows_transformed: u64,
    pub rows_loaded: u64,
    pub rows_quarantined: u64,
    /// Self-referential FK patches applied in the second pass.
    pub patches_applied: u64,
    /// Attempts consumed by the retry policy (1 = first try succeeded).
    pub attempts: u32,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TableReport {
    pub fn skipped(table: impl Into<String>, db: TargetDb) -> Self {
        Self {
            table: table.into(),
            db,
            status: TableStatus::Skipped,
            rows_extracted: 0,
            rows_transformed: 0,
            rows_loaded: 0,
            rows_quarantined: 0,
            patches_applied: 0,
            attempts: 0,
            duration_ms: 0,
            error: None,
        }
    }

    pub fn failed(table: impl Into<String>, db: TargetDb, error: impl Into<String>) -> Self {
        let mut report = Self::skipped(table, db);
        report.status = TableStatus::Failed;
        report.error = Some(error.into());
        report
    }
}

/// Overall run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    /// Every table loaded but some rows were quarantined.
    CompletedWithQuarantine,
    Failed,
    Cancelled,
}

/// Aggregated result of one migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_seconds: f64,
    /// Topological order the run used.
    pub table_order: Vec<String>,
    pub tables: Vec<TableReport>,
    pub rows_loaded: u64,
    pub rows_quarantined: u64,
    pub failed_tables: Vec<String>,
    /// Soft findings (cross-database references that do not exist remotely,
    /// unresolved self-reference parents, ...).
    pub warnings: Vec<String>,
    pub quarantine: Vec<QuarantineEntry>,
}

impl RunReport {
    pub fn new(run_id: Uuid, started_at: DateTime<Utc>, table_order: Vec<String>) -> Self {
        Self {
            run_id,
            status: RunStatus::Completed,
            started_at,
            completed_at: started_at,
            duration_seconds: 0.0,
            table_order,
            tables: Vec::new(),
            rows_loaded: 0,
            rows_quarantined: 0,
            failed_tables: Vec::new(),
            warnings: Vec::new(),
            quarantine: Vec::new(),
        }
    }

    pub fn add_table(&mut self, report: TableReport) {
        self.rows_loaded += report.rows_loaded;
        self.rows_quarantined += report.rows_quarantined;
        if report.status == TableStatus::Failed {
            self.failed_tables.push(report.table.clone());
        }
        self.tables.push(report);
    }

    /// Set the final status and timing. `cancelled` wins over failure so an
    /// interrupted run is distinguishable from a broken one.
    pub fn finish(&mut self, cancelled: bool) {
        self.completed_at = Utc::now();
        self.duration_seconds = (self.completed_at - self.started_at)
            .num_milliseconds()
            .max(0) as f64
            / 1000.0;
        self.status = if cancelled {
            RunStatus::Cancelled
        } else if !self.failed_tables.is_empty() {
            RunStatus::Failed
        } else if self.rows_quarantined > 0 {
            RunStatus::CompletedWithQuarantine
        } else {
            RunStatus::Completed
        };
    }

    pub fn table(&self, name: &str) -> Option<&TableReport> {
        self.tables.iter().find(|t| t.table == name)
    }

    pub fn has_failures(&self) -> bool {
        !self.failed_tables.is_empty()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
