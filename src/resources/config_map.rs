//! Connection configuration record
//!
//! A ConfigMap named after the Database that exposes the connection
//! parameters consumers need to reach it.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::crd::Database;
use crate::provider::Endpoint;
use crate::resources::common::merge_owner_reference;

pub const HOST_KEY: &str = "host";
pub const PORT_KEY: &str = "port";
pub const DATABASE_KEY: &str = "database";
pub const USERNAME_KEY: &str = "username";

/// Name of the configuration record for a Database
pub fn connection_config_name(database: &Database) -> String {
    database.name_any()
}

/// Connection parameters published for a Database
pub fn connection_data(database: &Database, endpoint: &Endpoint) -> BTreeMap<String, String> {
    BTreeMap::from([
        (HOST_KEY.to_string(), endpoint.hostname.clone()),
        (PORT_KEY.to_string(), endpoint.port.to_string()),
        (DATABASE_KEY.to_string(), database.spec.db_name.clone()),
        (USERNAME_KEY.to_string(), database.spec.username.clone()),
    ])
}

/// Generate the configuration record
///
/// Labels and owner references are taken from the endpoint Service so the
/// ConfigMap follows the Service's ownership chain.
pub fn generate_connection_config(
    database: &Database,
    endpoint: &Endpoint,
    service: &Service,
) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(connection_config_name(database)),
            namespace: database.namespace(),
            labels: service.metadata.labels.clone(),
            owner_references: service.metadata.owner_references.clone(),
            ..Default::default()
        },
        data: Some(connection_data(database, endpoint)),
        ..Default::default()
    }
}

/// Update an existing configuration record in place
///
/// Data and labels are refreshed. Existing owner references are preserved
/// and the Service's owners are merged in when missing.
pub fn update_connection_config(
    existing: &ConfigMap,
    database: &Database,
    endpoint: &Endpoint,
    service: &Service,
) -> ConfigMap {
    let mut config_map = existing.clone();

    let data = config_map.data.get_or_insert_with(BTreeMap::new);
    data.extend(connection_data(database, endpoint));

    if let Some(service_labels) = &service.metadata.labels {
        config_map
            .metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .extend(service_labels.clone());
    }

    if let Some(service_owners) = &service.metadata.owner_references {
        let owners = config_map
            .metadata
            .owner_references
            .get_or_insert_with(Vec::new);
        for owner in service_owners {
            if !owners.iter().any(|o| o.uid == owner.uid) {
                merge_owner_reference(owners, owner.clone());
            }
        }
    }

    config_map
}
