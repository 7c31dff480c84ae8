//! Boundaries to the cluster stores the operator consumes
//!
//! The reconciliation engine never talks to the API server directly. It goes
//! through these traits so the same engine runs against the real cluster
//! ([`KubeStore`]) or an in-memory stand-in.

mod kube_store;

pub use kube_store::KubeStore;

use async_trait::async_trait;
use thiserror::Error;

use crate::crd::Database;

/// Errors reported by the stores
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },

    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: String, name: String },

    #[error("{kind} {name} was modified concurrently")]
    Conflict { kind: String, name: String },

    #[error("object is missing metadata.{0}")]
    MissingMetadata(&'static str),

    #[error("key {key} not found in secret {name}")]
    MissingSecretKey { name: String, key: String },

    #[error("Kubernetes API error: {0}")]
    Kube(#[source] kube::Error),
}

impl StoreError {
    /// Classify a kube error for the object `kind/name`
    pub fn from_kube(kind: &str, name: &str, err: kube::Error) -> Self {
        let kind = kind.to_string();
        match &err {
            kube::Error::Api(api_err) if api_err.code == 404 => StoreError::NotFound {
                kind,
                name: name.to_string(),
            },
            kube::Error::Api(api_err) if api_err.code == 409 && api_err.reason == "AlreadyExists" => {
                StoreError::AlreadyExists {
                    kind,
                    name: name.to_string(),
                }
            }
            kube::Error::Api(api_err) if api_err.code == 409 => StoreError::Conflict {
                kind,
                name: name.to_string(),
            },
            _ => StoreError::Kube(err),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists { .. })
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Namespaced get/create/replace/delete over one object type
///
/// Implementations must reject `replace` with [`StoreError::Conflict`] when
/// the submitted `resourceVersion` is stale.
#[async_trait]
pub trait ObjectStore<K>: Send + Sync
where
    K: Send + Sync,
{
    /// Fetch an object, `None` when it does not exist
    async fn get(&self, namespace: &str, name: &str) -> StoreResult<Option<K>>;

    /// Create a new object
    async fn create(&self, namespace: &str, object: &K) -> StoreResult<K>;

    /// Replace an existing object
    async fn replace(&self, namespace: &str, name: &str, object: &K) -> StoreResult<K>;

    /// Delete an object
    async fn delete(&self, namespace: &str, name: &str) -> StoreResult<()>;
}

/// Access to Database resources
#[async_trait]
pub trait DatabaseStore: Send + Sync {
    /// Fetch a Database, `None` when it does not exist
    async fn get(&self, namespace: &str, name: &str) -> StoreResult<Option<Database>>;

    /// Write `database.status`, failing with [`StoreError::Conflict`] if the
    /// resource changed since `database` was read
    async fn replace_status(&self, database: &Database) -> StoreResult<Database>;
}

/// Read access to Secret values
#[async_trait]
pub trait SecretReader: Send + Sync {
    /// Read one key of one Secret as UTF-8 text
    async fn read_secret_key(&self, namespace: &str, name: &str, key: &str)
    -> StoreResult<String>;
}
