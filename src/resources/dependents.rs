//! Dependent-resource reconciliation
//!
//! Keeps the endpoint Service and the connection ConfigMap of a Database in
//! their desired shape. Every call reads the live object first and then
//! creates or updates it; objects are never deleted and recreated so their
//! uid survives reconciliations.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::ResourceExt;
use tracing::{debug, info};

use crate::crd::Database;
use crate::provider::Endpoint;
use crate::resources::config_map::{
    connection_config_name, generate_connection_config, update_connection_config,
};
use crate::resources::service::{
    endpoint_service_name, generate_endpoint_service, update_endpoint_service,
};
use crate::store::{ObjectStore, StoreError, StoreResult};

/// What a create-or-update call did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    Updated,
    Unchanged,
}

/// Create-or-update of the objects owned by a Database
#[derive(Clone)]
pub struct DependentReconciler {
    services: Arc<dyn ObjectStore<Service>>,
    config_maps: Arc<dyn ObjectStore<ConfigMap>>,
}

fn namespace_of(database: &Database) -> StoreResult<String> {
    database
        .namespace()
        .ok_or(StoreError::MissingMetadata("namespace"))
}

impl DependentReconciler {
    pub fn new(
        services: Arc<dyn ObjectStore<Service>>,
        config_maps: Arc<dyn ObjectStore<ConfigMap>>,
    ) -> Self {
        Self {
            services,
            config_maps,
        }
    }

    /// Ensure the endpoint Service points at `endpoint`
    pub async fn ensure_endpoint_service(
        &self,
        database: &Database,
        endpoint: &Endpoint,
        origin: &str,
        extra_labels: &BTreeMap<String, String>,
    ) -> StoreResult<(Service, ApplyOutcome)> {
        let ns = namespace_of(database)?;
        let name = endpoint_service_name(database);

        if let Some(existing) = self.services.get(&ns, &name).await? {
            return self
                .update_service(&ns, &name, &existing, database, endpoint, origin, extra_labels)
                .await;
        }

        let desired = generate_endpoint_service(database, endpoint, origin, extra_labels);
        match self.services.create(&ns, &desired).await {
            Ok(created) => {
                info!(service = %name, namespace = %ns, endpoint = %endpoint, "Created endpoint service");
                Ok((created, ApplyOutcome::Created))
            }
            Err(e) if e.is_already_exists() => {
                // Lost a race with another writer; fall back to update
                let existing = self.services.get(&ns, &name).await?.ok_or(e)?;
                self.update_service(&ns, &name, &existing, database, endpoint, origin, extra_labels)
                    .await
            }
            Err(e) => Err(e),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn update_service(
        &self,
        ns: &str,
        name: &str,
        existing: &Service,
        database: &Database,
        endpoint: &Endpoint,
        origin: &str,
        extra_labels: &BTreeMap<String, String>,
    ) -> StoreResult<(Service, ApplyOutcome)> {
        let desired = update_endpoint_service(existing, database, endpoint, origin, extra_labels);
        if &desired == existing {
            debug!(service = %name, namespace = %ns, "Endpoint service unchanged");
            return Ok((desired, ApplyOutcome::Unchanged));
        }

        let updated = self.services.replace(ns, name, &desired).await?;
        info!(service = %name, namespace = %ns, endpoint = %endpoint, "Updated endpoint service");
        Ok((updated, ApplyOutcome::Updated))
    }

    /// Ensure the connection ConfigMap reflects `endpoint`
    ///
    /// `service` is the endpoint Service the ConfigMap inherits labels and
    /// owner references from.
    pub async fn ensure_connection_config(
        &self,
        database: &Database,
        endpoint: &Endpoint,
        service: &Service,
    ) -> StoreResult<(ConfigMap, ApplyOutcome)> {
        let ns = namespace_of(database)?;
        let name = connection_config_name(database);

        let existing = match self.config_maps.get(&ns, &name).await? {
            Some(existing) => existing,
            None => {
                let desired = generate_connection_config(database, endpoint, service);
                match self.config_maps.create(&ns, &desired).await {
                    Ok(created) => {
                        info!(config_map = %name, namespace = %ns, "Created connection config");
                        return Ok((created, ApplyOutcome::Created));
                    }
                    Err(e) if e.is_already_exists() => {
                        self.config_maps.get(&ns, &name).await?.ok_or(e)?
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        let desired = update_connection_config(&existing, database, endpoint, service);
        if desired == existing {
            debug!(config_map = %name, namespace = %ns, "Connection config unchanged");
            return Ok((desired, ApplyOutcome::Unchanged));
        }

        let updated = self.config_maps.replace(&ns, &name, &desired).await?;
        info!(config_map = %name, namespace = %ns, "Updated connection config");
        Ok((updated, ApplyOutcome::Updated))
    }

    /// Delete the endpoint Service, treating absence as success
    pub async fn delete_endpoint_service(&self, database: &Database) -> StoreResult<()> {
        let ns = namespace_of(database)?;
        let name = endpoint_service_name(database);

        match self.services.delete(&ns, &name).await {
            Ok(()) => {
                info!(service = %name, namespace = %ns, "Deleted endpoint service");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!(service = %name, namespace = %ns, "Endpoint service already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
