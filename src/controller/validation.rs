//! Validation of Database specs before provisioning

use crate::controller::error::{Error, Result};
use crate::crd::{Database, DatabaseSpec};

/// Engines the operator knows how to provision
pub const SUPPORTED_ENGINES: &[&str] = &[
    "postgres",
    "mysql",
    "mariadb",
    "aurora-postgresql",
    "aurora-mysql",
];

/// Longest backup retention RDS accepts, in days
pub const MAX_BACKUP_RETENTION_DAYS: i64 = 35;

/// Validate the Database spec
pub fn validate_spec(database: &Database) -> Result<()> {
    let spec = &database.spec;
    validate_engine(spec)?;
    validate_required(spec)?;
    validate_storage(spec)?;
    validate_backup(spec)?;
    Ok(())
}

fn validate_engine(spec: &DatabaseSpec) -> Result<()> {
    if !SUPPORTED_ENGINES.contains(&spec.engine.as_str()) {
        return Err(Error::ValidationError(format!(
            "engine {:?} is not supported (expected one of: {})",
            spec.engine,
            SUPPORTED_ENGINES.join(", ")
        )));
    }
    Ok(())
}

fn validate_required(spec: &DatabaseSpec) -> Result<()> {
    let required = [
        ("class", &spec.class),
        ("dbName", &spec.db_name),
        ("username", &spec.username),
        ("password.name", &spec.password.name),
        ("password.key", &spec.password.key),
    ];

    for (field, value) in required {
        if value.trim().is_empty() {
            return Err(Error::ValidationError(format!("{field} must not be empty")));
        }
    }
    Ok(())
}

fn validate_storage(spec: &DatabaseSpec) -> Result<()> {
    if spec.size <= 0 {
        return Err(Error::ValidationError(format!(
            "size must be positive, got {}",
            spec.size
        )));
    }

    if spec.iops < 0 {
        return Err(Error::ValidationError(format!(
            "iops must not be negative, got {}",
            spec.iops
        )));
    }

    if spec.storage_type.as_deref() == Some("io1") && spec.iops == 0 {
        return Err(Error::ValidationError(
            "storageType io1 requires iops".to_string(),
        ));
    }

    Ok(())
}

fn validate_backup(spec: &DatabaseSpec) -> Result<()> {
    let days = spec.backup_retention_period;
    if !(0..=MAX_BACKUP_RETENTION_DAYS).contains(&days) {
        return Err(Error::ValidationError(format!(
            "backupRetentionPeriod {} is outside 0..={}",
            days, MAX_BACKUP_RETENTION_DAYS
        )));
    }
    Ok(())
}
