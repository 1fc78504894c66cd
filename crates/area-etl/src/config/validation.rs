//! Configuration validation.

use super::Config;
use crate::error::{EtlError, Result};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    // Source validation
    if config.source.host.is_empty() {
        return Err(EtlError::Config("source.host is required".into()));
    }
    if config.source.database.is_empty() {
        return Err(EtlError::Config("source.database is required".into()));
    }
    if config.source.user.is_empty() {
        return Err(EtlError::Config("source.user is required".into()));
    }

    // Target validation: every declared target must be complete. Whether the
    // run's scope is fully covered is checked against the catalog at startup.
    if config.targets.is_empty() {
        return Err(EtlError::Config("at least one target is required".into()));
    }
    for (db, target) in &config.targets {
        if target.host.is_empty() {
            return Err(EtlError::Config(format!("targets.{}.host is required", db)));
        }
        if target.database.is_empty() {
            return Err(EtlError::Config(format!(
                "targets.{}.database is required",
                db
            )));
        }
        if target.user.is_empty() {
            return Err(EtlError::Config(format!("targets.{}.user is required", db)));
        }
    }

    // Run config validation - only check values that are explicitly set
    if let Some(0) = config.run.workers {
        return Err(EtlError::Config("run.workers must be at least 1".into()));
    }
    if let Some(0) = config.run.batch_size {
        return Err(EtlError::Config("run.batch_size must be at least 1".into()));
    }
    if let Some(n) = config.run.max_retries {
        if n > 10 {
            return Err(EtlError::Config("run.max_retries must be 10 or fewer".into()));
        }
    }

    let prefix_ok = config
        .run
        .table_prefix
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if !prefix_ok {
        return Err(EtlError::Config(
            "run.table_prefix may only contain [a-z0-9_]".into(),
        ));
    }

    Ok(())
}
