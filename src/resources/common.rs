//! Common utilities for Kubernetes resource generation
//!
//! Shared constants, labels and owner references used by every object the
//! operator publishes for a Database.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;

use crate::crd::{self, Database};

/// API version of the Database CRD as written in owner references
pub const API_VERSION: &str = "aws.pmacik.dev/v1alpha1";

/// Field manager name used for API writes
pub const FIELD_MANAGER: &str = "rds-operator";

/// Label carrying the owning Database's name
pub const DATABASE_LABEL: &str = "aws.pmacik.dev/database";

/// Label naming the backend that serves a Database
pub const BACKEND_LABEL: &str = "aws.pmacik.dev/backend";

/// Annotation recording which provider published an object
pub const ORIGIN_ANNOTATION: &str = "origin";

/// Generate an owner reference pointing at a Database
///
/// Objects carrying it are garbage collected by the cluster when the
/// Database is deleted.
pub fn owner_reference(database: &Database) -> OwnerReference {
    OwnerReference {
        api_version: API_VERSION.to_string(),
        kind: crd::KIND.to_string(),
        name: database.name_any(),
        uid: database.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Standard labels for objects belonging to a Database
pub fn standard_labels(database_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), database_name.to_string()),
        (
            "app.kubernetes.io/name".to_string(),
            database_name.to_string(),
        ),
        (
            "app.kubernetes.io/component".to_string(),
            "database".to_string(),
        ),
        (
            "app.kubernetes.io/managed-by".to_string(),
            FIELD_MANAGER.to_string(),
        ),
        (DATABASE_LABEL.to_string(), database_name.to_string()),
    ])
}

/// Add `owner` to `refs` unless a reference with the same uid is present
///
/// An object has at most one controller, so when another owner already
/// controls it the merged reference is demoted to a plain owner.
pub fn merge_owner_reference(refs: &mut Vec<OwnerReference>, mut owner: OwnerReference) {
    let foreign_controller = refs
        .iter()
        .any(|r| r.controller == Some(true) && !(r.uid == owner.uid && r.kind == owner.kind));
    if foreign_controller {
        owner.controller = Some(false);
    }

    match refs.iter_mut().find(|r| r.uid == owner.uid && r.kind == owner.kind) {
        Some(existing) => *existing = owner,
        None => refs.push(owner),
    }
}

/// Port name used for an engine family
pub fn port_name(engine: &str) -> &'static str {
    match engine {
        "postgres" | "aurora-postgresql" => "pgsql",
        "mysql" | "mariadb" | "aurora-mysql" | "aurora" => "mysql",
        _ => "db",
    }
}
