//! AWS RDS provider
//!
//! Allocates one RDS instance per Database, identified by the Database's
//! name, and waits for it to become `available`.

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_rds::Client as RdsClient;
use aws_sdk_rds::error::DisplayErrorContext;
use aws_sdk_rds::types::{DbInstance, Tag};
use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::{
    DatabaseProvider, Endpoint, ProviderError, ProviderResult, ProviderSettings, ServiceProvider,
    ServicePublisher,
};
use crate::crd::Database;

pub const ORIGIN: &str = "rds";

/// Instance states after which an instance will never become available
const FAILED_STATES: &[&str] = &[
    "failed",
    "incompatible-network",
    "incompatible-parameters",
    "incompatible-restore",
    "storage-full",
    "deleting",
];

pub struct RdsProvider {
    client: RdsClient,
    publisher: ServicePublisher,
    provision_timeout: Duration,
    poll_interval: Duration,
}

impl RdsProvider {
    pub fn new(
        client: RdsClient,
        publisher: ServicePublisher,
        provision_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            client,
            publisher,
            provision_timeout,
            poll_interval,
        }
    }

    /// Build a provider from the default AWS credential chain
    pub async fn from_env(
        settings: &ProviderSettings,
        publisher: ServicePublisher,
    ) -> ProviderResult<Self> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &settings.aws_region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        let sdk_config = loader.load().await;

        if sdk_config.region().is_none() {
            return Err(ProviderError::Configuration(
                "no AWS region configured (set --aws-region or AWS_REGION)".to_string(),
            ));
        }
        info!(region = ?sdk_config.region(), "Configured AWS RDS client");

        Ok(Self::new(
            RdsClient::new(&sdk_config),
            publisher,
            settings.provision_timeout,
            settings.poll_interval,
        ))
    }

    async fn describe(&self, identifier: &str) -> ProviderResult<Option<DbInstance>> {
        match self
            .client
            .describe_db_instances()
            .db_instance_identifier(identifier)
            .send()
            .await
        {
            Ok(output) => Ok(output.db_instances().first().cloned()),
            Err(e)
                if e
                    .as_service_error()
                    .is_some_and(|se| se.is_db_instance_not_found_fault()) =>
            {
                Ok(None)
            }
            Err(e) => Err(ProviderError::Allocation {
                name: identifier.to_string(),
                message: DisplayErrorContext(&e).to_string(),
            }),
        }
    }

    async fn create_instance(&self, database: &Database, password: String) -> ProviderResult<()> {
        let identifier = database.name_any();
        let spec = &database.spec;

        let allocated_storage = to_i32("size", spec.size)?;
        let backup_retention = to_i32("backupRetentionPeriod", spec.backup_retention_period)?;

        let mut request = self
            .client
            .create_db_instance()
            .db_instance_identifier(&identifier)
            .db_name(&spec.db_name)
            .engine(&spec.engine)
            .db_instance_class(&spec.class)
            .allocated_storage(allocated_storage)
            .master_username(&spec.username)
            .master_user_password(password)
            .multi_az(spec.multi_az)
            .publicly_accessible(spec.publicly_accessible)
            .storage_encrypted(spec.storage_encrypted)
            .backup_retention_period(backup_retention)
            .deletion_protection(spec.delete_protection)
            .set_storage_type(spec.storage_type.clone())
            .tags(
                Tag::builder()
                    .key("kubernetes.io/namespace")
                    .value(database.namespace().unwrap_or_default())
                    .build(),
            )
            .tags(Tag::builder().key("kubernetes.io/name").value(&identifier).build());

        if spec.iops > 0 {
            request = request.iops(to_i32("iops", spec.iops)?);
        }

        match request.send().await {
            Ok(_) => {
                info!(instance = %identifier, engine = %spec.engine, class = %spec.class, "Requested RDS instance");
                Ok(())
            }
            Err(e)
                if e
                    .as_service_error()
                    .is_some_and(|se| se.is_db_instance_already_exists_fault()) =>
            {
                debug!(instance = %identifier, "RDS instance already exists");
                Ok(())
            }
            Err(e) => Err(ProviderError::Allocation {
                name: identifier,
                message: DisplayErrorContext(&e).to_string(),
            }),
        }
    }

    async fn wait_until_available(&self, identifier: &str) -> ProviderResult<Endpoint> {
        let deadline = Instant::now() + self.provision_timeout;

        loop {
            if let Some(instance) = self.describe(identifier).await? {
                let status = instance.db_instance_status().unwrap_or("unknown");
                if let Some(endpoint) = available_endpoint(&instance) {
                    return Ok(endpoint);
                }
                if FAILED_STATES.contains(&status) {
                    return Err(ProviderError::Allocation {
                        name: identifier.to_string(),
                        message: format!("instance entered state {status}"),
                    });
                }
                debug!(instance = %identifier, status = %status, "Waiting for RDS instance");
            } else {
                debug!(instance = %identifier, "RDS instance not visible yet");
            }

            if Instant::now() + self.poll_interval > deadline {
                return Err(ProviderError::Timeout {
                    name: identifier.to_string(),
                    timeout: self.provision_timeout,
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

fn to_i32(field: &str, value: i64) -> ProviderResult<i32> {
    i32::try_from(value)
        .map_err(|_| ProviderError::Configuration(format!("{field} value {value} is out of range")))
}

/// Endpoint of an instance that is ready to accept connections
pub(crate) fn available_endpoint(instance: &DbInstance) -> Option<Endpoint> {
    if instance.db_instance_status() != Some("available") {
        return None;
    }
    let endpoint = instance.endpoint()?;
    Some(Endpoint::new(endpoint.address()?, endpoint.port()?))
}

#[async_trait]
impl ServiceProvider for RdsProvider {
    fn name(&self) -> &'static str {
        self.publisher.origin()
    }

    async fn create_service(
        &self,
        database: &Database,
        endpoint: &Endpoint,
    ) -> ProviderResult<Service> {
        self.publisher.publish(database, endpoint).await
    }

    async fn delete_service(&self, database: &Database) -> ProviderResult<()> {
        self.publisher.withdraw(database).await
    }

    async fn get_secret(&self, namespace: &str, name: &str, key: &str) -> ProviderResult<String> {
        self.publisher.read_secret(namespace, name, key).await
    }
}

#[async_trait]
impl DatabaseProvider for RdsProvider {
    #[instrument(skip(self, database), fields(instance = %database.name_any()))]
    async fn create_database(&self, database: &Database) -> ProviderResult<Endpoint> {
        let identifier = database.name_any();

        match self.describe(&identifier).await? {
            Some(instance) => {
                if let Some(endpoint) = available_endpoint(&instance) {
                    info!(endpoint = %endpoint, "RDS instance already available");
                    return Ok(endpoint);
                }
                info!(
                    status = instance.db_instance_status().unwrap_or("unknown"),
                    "RDS instance exists, waiting for it"
                );
            }
            None => {
                let ns = database.namespace().unwrap_or_default();
                let password = self
                    .get_secret(&ns, &database.spec.password.name, &database.spec.password.key)
                    .await?;
                self.create_instance(database, password).await?;
            }
        }

        let endpoint = self.wait_until_available(&identifier).await?;
        info!(endpoint = %endpoint, "RDS instance available");
        Ok(endpoint)
    }

    #[instrument(skip(self, database), fields(instance = %database.name_any()))]
    async fn delete_database(&self, database: &Database) -> ProviderResult<()> {
        let identifier = database.name_any();

        match self
            .client
            .delete_db_instance()
            .db_instance_identifier(&identifier)
            .skip_final_snapshot(true)
            .send()
            .await
        {
            Ok(_) => {
                info!("Requested RDS instance deletion");
                Ok(())
            }
            Err(e)
                if e
                    .as_service_error()
                    .is_some_and(|se| se.is_db_instance_not_found_fault()) =>
            {
                warn!("RDS instance already deleted");
                Ok(())
            }
            Err(e) => Err(ProviderError::Deallocation {
                name: identifier,
                message: DisplayErrorContext(&e).to_string(),
            }),
        }
    }
}
