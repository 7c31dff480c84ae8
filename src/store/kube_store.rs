//! Store implementations backed by the Kubernetes API

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{DeleteParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::{DatabaseStore, ObjectStore, SecretReader, StoreError, StoreResult};
use crate::crd::Database;
use crate::resources::FIELD_MANAGER;

/// Stores talking to the API server through a shared [`Client`]
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn kind_of<K>() -> String
where
    K: Resource,
    <K as Resource>::DynamicType: Default,
{
    K::kind(&Default::default()).to_string()
}

#[async_trait]
impl<K> ObjectStore<K> for KubeStore
where
    K: Resource<Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
    <K as Resource>::DynamicType: Default,
{
    async fn get(&self, namespace: &str, name: &str) -> StoreResult<Option<K>> {
        self.namespaced::<K>(namespace)
            .get_opt(name)
            .await
            .map_err(|e| StoreError::from_kube(&kind_of::<K>(), name, e))
    }

    async fn create(&self, namespace: &str, object: &K) -> StoreResult<K> {
        let name = object.name_any();
        let created = self
            .namespaced::<K>(namespace)
            .create(&PostParams::default(), object)
            .await
            .map_err(|e| StoreError::from_kube(&kind_of::<K>(), &name, e))?;
        debug!(kind = %kind_of::<K>(), name = %name, namespace = %namespace, "Created object");
        Ok(created)
    }

    async fn replace(&self, namespace: &str, name: &str, object: &K) -> StoreResult<K> {
        let replaced = self
            .namespaced::<K>(namespace)
            .replace(name, &PostParams::default(), object)
            .await
            .map_err(|e| StoreError::from_kube(&kind_of::<K>(), name, e))?;
        debug!(kind = %kind_of::<K>(), name = %name, namespace = %namespace, "Replaced object");
        Ok(replaced)
    }

    async fn delete(&self, namespace: &str, name: &str) -> StoreResult<()> {
        self.namespaced::<K>(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| StoreError::from_kube(&kind_of::<K>(), name, e))?;
        debug!(kind = %kind_of::<K>(), name = %name, namespace = %namespace, "Deleted object");
        Ok(())
    }
}

#[async_trait]
impl DatabaseStore for KubeStore {
    async fn get(&self, namespace: &str, name: &str) -> StoreResult<Option<Database>> {
        self.namespaced::<Database>(namespace)
            .get_opt(name)
            .await
            .map_err(|e| StoreError::from_kube(crate::crd::KIND, name, e))
    }

    async fn replace_status(&self, database: &Database) -> StoreResult<Database> {
        let name = database
            .metadata
            .name
            .as_deref()
            .ok_or(StoreError::MissingMetadata("name"))?;
        let namespace = database
            .metadata
            .namespace
            .as_deref()
            .ok_or(StoreError::MissingMetadata("namespace"))?;
        let resource_version = database
            .metadata
            .resource_version
            .as_deref()
            .ok_or(StoreError::MissingMetadata("resourceVersion"))?;

        // The resourceVersion in the patch makes the API server reject the
        // write if the object changed after it was read.
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": resource_version },
            "status": database.status,
        });

        self.namespaced::<Database>(namespace)
            .patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
            .map_err(|e| StoreError::from_kube(crate::crd::KIND, name, e))
    }
}

#[async_trait]
impl SecretReader for KubeStore {
    async fn read_secret_key(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> StoreResult<String> {
        let secret: Secret = self
            .namespaced::<Secret>(namespace)
            .get(name)
            .await
            .map_err(|e| StoreError::from_kube("Secret", name, e))?;

        secret
            .data
            .as_ref()
            .and_then(|data| data.get(key))
            .map(|value| String::from_utf8_lossy(&value.0).into_owned())
            .ok_or_else(|| StoreError::MissingSecretKey {
                name: name.to_string(),
                key: key.to_string(),
            })
    }
}
