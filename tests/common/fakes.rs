//! In-memory stand-ins for the cluster stores and the provider
//!
//! The stores assign `uid` and `resourceVersion` like the API server and
//! reject stale status writes, which is enough to drive the engine end to
//! end without a cluster.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::error::ErrorResponse;
use kube::{Resource, ResourceExt};
use rds_operator::controller::{Context, Engine};
use rds_operator::crd::{Database, DatabaseSpec, DatabaseState};
use rds_operator::health::HealthState;
use rds_operator::provider::{
    DatabaseProvider, Endpoint, ProviderError, ProviderResult, ServiceProvider, ServicePublisher,
};
use rds_operator::resources::DependentReconciler;
use rds_operator::store::{
    DatabaseStore, ObjectStore, SecretReader, StoreError, StoreResult,
};

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn server_error(kind: &str, name: &str, message: &str) -> StoreError {
    StoreError::from_kube(
        kind,
        name,
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: message.to_string(),
            reason: "InternalError".to_string(),
            code: 500,
        }),
    )
}

/// Database store with optimistic concurrency on status writes
#[derive(Default)]
pub struct MemoryDatabases {
    objects: Mutex<BTreeMap<Key, Database>>,
    history: Mutex<Vec<(String, DatabaseState)>>,
    version: AtomicU64,
    pending_conflicts: AtomicUsize,
    status_writes: AtomicUsize,
}

impl MemoryDatabases {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    /// Store `database` as if a user had applied it
    pub fn insert(&self, mut database: Database) -> Database {
        database.metadata.resource_version = Some(self.next_version());
        let k = key(&database.namespace().unwrap_or_default(), &database.name_any());
        self.objects.lock().unwrap().insert(k, database.clone());
        database
    }

    pub fn remove(&self, namespace: &str, name: &str) -> Option<Database> {
        self.objects.lock().unwrap().remove(&key(namespace, name))
    }

    pub fn current(&self, namespace: &str, name: &str) -> Option<Database> {
        self.objects.lock().unwrap().get(&key(namespace, name)).cloned()
    }

    /// Edit the spec like `kubectl edit`, bumping generation
    pub fn edit(&self, namespace: &str, name: &str, change: impl FnOnce(&mut DatabaseSpec)) -> Database {
        let version = self.next_version();
        let mut objects = self.objects.lock().unwrap();
        let database = objects.get_mut(&key(namespace, name)).unwrap();
        change(&mut database.spec);
        database.metadata.generation = Some(database.metadata.generation.unwrap_or(0) + 1);
        database.metadata.resource_version = Some(version);
        database.clone()
    }

    /// States written for `name`, in order
    pub fn history(&self, name: &str) -> Vec<DatabaseState> {
        self.history
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, state)| *state)
            .collect()
    }

    /// Make the next `count` status writes lose a race with another writer
    pub fn inject_conflicts(&self, count: usize) {
        self.pending_conflicts.store(count, Ordering::SeqCst);
    }

    pub fn status_writes(&self) -> usize {
        self.status_writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DatabaseStore for MemoryDatabases {
    async fn get(&self, namespace: &str, name: &str) -> StoreResult<Option<Database>> {
        Ok(self.current(namespace, name))
    }

    async fn replace_status(&self, database: &Database) -> StoreResult<Database> {
        let name = database.name_any();
        let conflict = || StoreError::Conflict {
            kind: "Database".to_string(),
            name: name.clone(),
        };

        if self
            .pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            // Someone else wrote in between
            let version = self.next_version();
            if let Some(stored) = self
                .objects
                .lock()
                .unwrap()
                .get_mut(&key(&database.namespace().unwrap_or_default(), &name))
            {
                stored.metadata.resource_version = Some(version);
            }
            return Err(conflict());
        }

        let version = self.next_version();
        let mut objects = self.objects.lock().unwrap();
        let stored = objects
            .get_mut(&key(&database.namespace().unwrap_or_default(), &name))
            .ok_or_else(|| StoreError::NotFound {
                kind: "Database".to_string(),
                name: name.clone(),
            })?;

        if stored.metadata.resource_version != database.metadata.resource_version {
            return Err(conflict());
        }

        stored.status = database.status.clone();
        stored.metadata.resource_version = Some(version);
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        if let Some(state) = database.state() {
            self.history.lock().unwrap().push((name, state));
        }
        Ok(stored.clone())
    }
}

/// Namespaced object store for Services and ConfigMaps
pub struct MemoryObjects<K> {
    kind: &'static str,
    objects: Mutex<BTreeMap<Key, K>>,
    version: AtomicU64,
    writes: AtomicUsize,
    failing_writes: Mutex<Option<String>>,
    failing_deletes: Mutex<Option<String>>,
}

impl<K> MemoryObjects<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            objects: Mutex::new(BTreeMap::new()),
            version: AtomicU64::new(0),
            writes: AtomicUsize::new(0),
            failing_writes: Mutex::new(None),
            failing_deletes: Mutex::new(None),
        }
    }

    pub fn current(&self, namespace: &str, name: &str) -> Option<K> {
        self.objects.lock().unwrap().get(&key(namespace, name)).cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    /// Creates and replaces performed so far
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make every create and replace fail with `message`
    pub fn fail_writes(&self, message: &str) {
        *self.failing_writes.lock().unwrap() = Some(message.to_string());
    }

    fn write_failure(&self, name: &str) -> Option<StoreError> {
        self.failing_writes
            .lock()
            .unwrap()
            .as_deref()
            .map(|message| server_error(self.kind, name, message))
    }

    /// Make every delete fail with `message`
    pub fn fail_deletes(&self, message: &str) {
        *self.failing_deletes.lock().unwrap() = Some(message.to_string());
    }

    fn stamp(&self, object: &mut K) {
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let name = object.name_any();
        let meta = object.meta_mut();
        if meta.uid.is_none() {
            meta.uid = Some(format!("{}-{name}-{version}", self.kind.to_lowercase()));
        }
        meta.resource_version = Some(version.to_string());
    }
}

#[async_trait]
impl<K> ObjectStore<K> for MemoryObjects<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> StoreResult<Option<K>> {
        Ok(self.current(namespace, name))
    }

    async fn create(&self, namespace: &str, object: &K) -> StoreResult<K> {
        let name = object.name_any();
        if let Some(err) = self.write_failure(&name) {
            return Err(err);
        }
        let mut objects = self.objects.lock().unwrap();
        if objects.contains_key(&key(namespace, &name)) {
            return Err(StoreError::AlreadyExists {
                kind: self.kind.to_string(),
                name,
            });
        }

        let mut created = object.clone();
        created.meta_mut().namespace = Some(namespace.to_string());
        self.stamp(&mut created);
        objects.insert(key(namespace, &name), created.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(created)
    }

    async fn replace(&self, namespace: &str, name: &str, object: &K) -> StoreResult<K> {
        if let Some(err) = self.write_failure(name) {
            return Err(err);
        }
        let mut objects = self.objects.lock().unwrap();
        let Some(stored) = objects.get(&key(namespace, name)) else {
            return Err(StoreError::NotFound {
                kind: self.kind.to_string(),
                name: name.to_string(),
            });
        };
        if object.meta().resource_version.is_some()
            && object.meta().resource_version != stored.meta().resource_version
        {
            return Err(StoreError::Conflict {
                kind: self.kind.to_string(),
                name: name.to_string(),
            });
        }

        let mut replaced = object.clone();
        replaced.meta_mut().uid = stored.meta().uid.clone();
        self.stamp(&mut replaced);
        objects.insert(key(namespace, name), replaced.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(replaced)
    }

    async fn delete(&self, namespace: &str, name: &str) -> StoreResult<()> {
        if let Some(message) = self.failing_deletes.lock().unwrap().clone() {
            return Err(server_error(self.kind, name, &message));
        }
        match self.objects.lock().unwrap().remove(&key(namespace, name)) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound {
                kind: self.kind.to_string(),
                name: name.to_string(),
            }),
        }
    }
}

/// Secret values keyed by namespace, name and key
#[derive(Default)]
pub struct MemorySecrets {
    values: Mutex<HashMap<(String, String, String), String>>,
}

impl MemorySecrets {
    pub fn with_secret(self, namespace: &str, name: &str, key: &str, value: &str) -> Self {
        self.values.lock().unwrap().insert(
            (namespace.to_string(), name.to_string(), key.to_string()),
            value.to_string(),
        );
        self
    }
}

#[async_trait]
impl SecretReader for MemorySecrets {
    async fn read_secret_key(&self, namespace: &str, name: &str, key: &str) -> StoreResult<String> {
        self.values
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::MissingSecretKey {
                name: name.to_string(),
                key: key.to_string(),
            })
    }
}

/// Provider that allocates instantly and records every call
pub struct FakeProvider {
    publisher: ServicePublisher,
    calls: Mutex<Vec<String>>,
    allocation_failures: Mutex<HashMap<String, String>>,
    deallocation_failure: Mutex<Option<String>>,
}

pub const FAKE_ORIGIN: &str = "fake";
pub const FAKE_PORT: i32 = 5432;

/// Hostname the fake provider hands out for `name`
pub fn fake_hostname(name: &str) -> String {
    format!("{name}.fake.example.com")
}

impl FakeProvider {
    pub fn new(publisher: ServicePublisher) -> Self {
        Self {
            publisher,
            calls: Mutex::new(Vec::new()),
            allocation_failures: Mutex::new(HashMap::new()),
            deallocation_failure: Mutex::new(None),
        }
    }

    /// Fail allocation of `name` with `message` until cleared
    pub fn fail_allocation(&self, name: &str, message: &str) {
        self.allocation_failures
            .lock()
            .unwrap()
            .insert(name.to_string(), message.to_string());
    }

    pub fn clear_failures(&self) {
        self.allocation_failures.lock().unwrap().clear();
        *self.deallocation_failure.lock().unwrap() = None;
    }

    pub fn fail_deallocation(&self, message: &str) {
        *self.deallocation_failure.lock().unwrap() = Some(message.to_string());
    }

    /// Calls made so far, as `operation:name`
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, operation: &str) -> usize {
        let prefix = format!("{operation}:");
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(&prefix))
            .count()
    }

    fn record(&self, operation: &str, database: &Database) {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{operation}:{}", database.name_any()));
    }
}

#[async_trait]
impl ServiceProvider for FakeProvider {
    fn name(&self) -> &'static str {
        FAKE_ORIGIN
    }

    async fn create_service(&self, database: &Database, endpoint: &Endpoint) -> ProviderResult<Service> {
        self.record("create_service", database);
        self.publisher.publish(database, endpoint).await
    }

    async fn delete_service(&self, database: &Database) -> ProviderResult<()> {
        self.record("delete_service", database);
        self.publisher.withdraw(database).await
    }

    async fn get_secret(&self, namespace: &str, name: &str, key: &str) -> ProviderResult<String> {
        self.publisher.read_secret(namespace, name, key).await
    }
}

#[async_trait]
impl DatabaseProvider for FakeProvider {
    async fn create_database(&self, database: &Database) -> ProviderResult<Endpoint> {
        self.record("create_database", database);
        let name = database.name_any();
        if let Some(message) = self.allocation_failures.lock().unwrap().get(&name) {
            return Err(ProviderError::Allocation {
                name,
                message: message.clone(),
            });
        }
        Ok(Endpoint::new(fake_hostname(&name), FAKE_PORT))
    }

    async fn delete_database(&self, database: &Database) -> ProviderResult<()> {
        self.record("delete_database", database);
        if let Some(message) = self.deallocation_failure.lock().unwrap().clone() {
            return Err(ProviderError::Deallocation {
                name: database.name_any(),
                message,
            });
        }
        Ok(())
    }
}

/// An engine wired to in-memory collaborators
pub struct Harness {
    pub databases: Arc<MemoryDatabases>,
    pub services: Arc<MemoryObjects<Service>>,
    pub config_maps: Arc<MemoryObjects<ConfigMap>>,
    pub provider: Arc<FakeProvider>,
    pub dependents: DependentReconciler,
    pub health: Arc<HealthState>,
    pub engine: Engine,
}

impl Harness {
    pub fn new() -> Self {
        let databases = Arc::new(MemoryDatabases::new());
        let services = Arc::new(MemoryObjects::<Service>::new("Service"));
        let config_maps = Arc::new(MemoryObjects::<ConfigMap>::new("ConfigMap"));
        let secrets = Arc::new(MemorySecrets::default().with_secret(
            super::TEST_NAMESPACE,
            "db-credentials",
            "password",
            "s3cret",
        ));

        let dependents = DependentReconciler::new(services.clone(), config_maps.clone());
        let publisher = ServicePublisher::new(FAKE_ORIGIN, dependents.clone(), secrets);
        let provider = Arc::new(FakeProvider::new(publisher));
        let health = Arc::new(HealthState::new());

        let ctx = Arc::new(Context::new(
            databases.clone(),
            provider.clone(),
            dependents.clone(),
            Some(health.clone()),
        ));

        Self {
            databases,
            services,
            config_maps,
            provider,
            dependents,
            health,
            engine: Engine::new(ctx),
        }
    }

    /// Store `database` and return it as stored
    pub fn apply(&self, database: Database) -> Database {
        self.databases.insert(database)
    }
}
