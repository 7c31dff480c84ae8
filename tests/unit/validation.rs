//! Unit tests for validation logic

use rds_operator::controller::Error;
use rds_operator::controller::validation::{
    MAX_BACKUP_RETENTION_DAYS, SUPPORTED_ENGINES, validate_spec,
};

use crate::common::*;

fn expect_invalid(db: &rds_operator::crd::Database, fragment: &str) {
    match validate_spec(db) {
        Err(Error::ValidationError(message)) => assert!(
            message.contains(fragment),
            "expected {fragment:?} in {message:?}"
        ),
        other => panic!("Expected validation error, got {other:?}"),
    }
}

#[test]
fn test_valid_spec() {
    assert!(validate_spec(&create_test_database("db1")).is_ok());
}

#[test]
fn test_every_supported_engine() {
    for engine in SUPPORTED_ENGINES {
        let db = DatabaseBuilder::new("db1", TEST_NAMESPACE)
            .with_engine(engine)
            .build();
        assert!(validate_spec(&db).is_ok(), "{engine} should be accepted");
    }
}

#[test]
fn test_unknown_engine() {
    let db = DatabaseBuilder::new("db1", TEST_NAMESPACE)
        .with_engine("oracle-ee")
        .build();
    expect_invalid(&db, "oracle-ee");
}

#[test]
fn test_required_fields() {
    let mut db = create_test_database("db1");
    db.spec.db_name = String::new();
    expect_invalid(&db, "dbName");

    let mut db = create_test_database("db1");
    db.spec.password.key = "  ".to_string();
    expect_invalid(&db, "password.key");

    let mut db = create_test_database("db1");
    db.spec.class = String::new();
    expect_invalid(&db, "class");
}

#[test]
fn test_size_must_be_positive() {
    let mut db = create_test_database("db1");
    db.spec.size = 0;
    expect_invalid(&db, "size");
}

#[test]
fn test_io1_requires_iops() {
    let db = DatabaseBuilder::new("db1", TEST_NAMESPACE)
        .with_storage("io1", 0)
        .build();
    expect_invalid(&db, "io1");

    let db = DatabaseBuilder::new("db1", TEST_NAMESPACE)
        .with_storage("io1", 3000)
        .build();
    assert!(validate_spec(&db).is_ok());
}

#[test]
fn test_negative_iops() {
    let db = DatabaseBuilder::new("db1", TEST_NAMESPACE)
        .with_storage("gp3", -1)
        .build();
    expect_invalid(&db, "iops");
}

#[test]
fn test_backup_retention_bounds() {
    let mut db = create_test_database("db1");
    db.spec.backup_retention_period = MAX_BACKUP_RETENTION_DAYS;
    assert!(validate_spec(&db).is_ok());

    db.spec.backup_retention_period = 0;
    assert!(validate_spec(&db).is_ok());

    db.spec.backup_retention_period = MAX_BACKUP_RETENTION_DAYS + 1;
    expect_invalid(&db, "backupRetentionPeriod");

    db.spec.backup_retention_period = -1;
    expect_invalid(&db, "backupRetentionPeriod");
}
