//! Provisioning backends
//!
//! A provider allocates the database behind a Database resource and
//! publishes its endpoint into the cluster. Exactly one provider is active
//! per process; it is chosen at startup by [`select_provider`].

pub mod local;
pub mod rds;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use kube::Client;
use thiserror::Error;
use tracing::info;

use crate::config::ProviderKind;
use crate::crd::Database;
use crate::resources::DependentReconciler;
use crate::store::{SecretReader, StoreError};

pub use local::LocalProvider;
pub use rds::RdsProvider;

/// Network location of a provisioned database
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub hostname: String,
    pub port: i32,
}

impl Endpoint {
    pub fn new(hostname: impl Into<String>, port: i32) -> Self {
        Self {
            hostname: hostname.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hostname, self.port)
    }
}

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("failed to allocate database {name}: {message}")]
    Allocation { name: String, message: String },

    #[error("failed to deallocate database {name}: {message}")]
    Deallocation { name: String, message: String },

    #[error("unable to read secret {name}: {source}")]
    Secret {
        name: String,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid provider configuration: {0}")]
    Configuration(String),

    #[error("database {name} was not available after {timeout:?}")]
    Timeout { name: String, timeout: Duration },
}

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Endpoint publication and credential access
#[async_trait]
pub trait ServiceProvider: Send + Sync {
    /// Short name recorded in the `origin` annotation and metrics
    fn name(&self) -> &'static str;

    /// Create or update the endpoint Service for `database`
    async fn create_service(&self, database: &Database, endpoint: &Endpoint)
    -> ProviderResult<Service>;

    /// Remove the endpoint Service; absence counts as success
    async fn delete_service(&self, database: &Database) -> ProviderResult<()>;

    /// Read one key of a Secret
    async fn get_secret(&self, namespace: &str, name: &str, key: &str) -> ProviderResult<String>;
}

/// A backend that can allocate and release databases
///
/// `create_database` must be idempotent per Database name: calling it for a
/// database that is already allocated returns the existing endpoint.
/// `delete_database` must succeed when the database is already gone.
#[async_trait]
pub trait DatabaseProvider: ServiceProvider {
    async fn create_database(&self, database: &Database) -> ProviderResult<Endpoint>;

    async fn delete_database(&self, database: &Database) -> ProviderResult<()>;
}

/// Shared [`ServiceProvider`] behaviour for the concrete providers
///
/// Publishes the endpoint Service through the [`DependentReconciler`] with
/// the provider's origin and labels, and reads secrets through a
/// [`SecretReader`].
#[derive(Clone)]
pub struct ServicePublisher {
    origin: &'static str,
    extra_labels: BTreeMap<String, String>,
    dependents: DependentReconciler,
    secrets: Arc<dyn SecretReader>,
}

impl ServicePublisher {
    pub fn new(
        origin: &'static str,
        dependents: DependentReconciler,
        secrets: Arc<dyn SecretReader>,
    ) -> Self {
        Self {
            origin,
            extra_labels: BTreeMap::new(),
            dependents,
            secrets,
        }
    }

    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.extra_labels = labels;
        self
    }

    pub fn origin(&self) -> &'static str {
        self.origin
    }

    pub async fn publish(&self, database: &Database, endpoint: &Endpoint) -> ProviderResult<Service> {
        let (service, _) = self
            .dependents
            .ensure_endpoint_service(database, endpoint, self.origin, &self.extra_labels)
            .await?;
        Ok(service)
    }

    pub async fn withdraw(&self, database: &Database) -> ProviderResult<()> {
        self.dependents.delete_endpoint_service(database).await?;
        Ok(())
    }

    pub async fn read_secret(&self, namespace: &str, name: &str, key: &str) -> ProviderResult<String> {
        self.secrets
            .read_secret_key(namespace, name, key)
            .await
            .map_err(|source| ProviderError::Secret {
                name: name.to_string(),
                source,
            })
    }
}

/// Settings for the provider chosen at startup
#[derive(Clone, Debug)]
pub struct ProviderSettings {
    pub kind: ProviderKind,
    pub aws_region: Option<String>,
    pub provision_timeout: Duration,
    pub poll_interval: Duration,
}

/// Build the single provider this process drives
pub async fn select_provider(
    settings: &ProviderSettings,
    client: Client,
    dependents: DependentReconciler,
    secrets: Arc<dyn SecretReader>,
) -> ProviderResult<Arc<dyn DatabaseProvider>> {
    let provider: Arc<dyn DatabaseProvider> = match settings.kind {
        ProviderKind::Aws => {
            let publisher = ServicePublisher::new(rds::ORIGIN, dependents, secrets);
            Arc::new(RdsProvider::from_env(settings, publisher).await?)
        }
        ProviderKind::Local => {
            let publisher = ServicePublisher::new(local::ORIGIN, dependents, secrets)
                .with_labels(local::endpoint_labels());
            Arc::new(LocalProvider::new(client, publisher))
        }
    };

    info!(provider = provider.name(), "Selected database provider");
    Ok(provider)
}
