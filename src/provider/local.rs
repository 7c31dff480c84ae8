//! In-cluster provider
//!
//! Runs the requested engine as a single-replica StatefulSet fronted by a
//! ClusterIP Service named `<db>-backend`. Useful for development clusters
//! without cloud access.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec, Probe, SecretKeySelector, Service,
    ServicePort, ServiceSpec, TCPSocketAction, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{DeleteParams, Patch, PatchParams};
use kube::core::ObjectMeta;
use kube::{Api, Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, instrument, warn};

use super::{
    DatabaseProvider, Endpoint, ProviderError, ProviderResult, ServiceProvider, ServicePublisher,
};
use crate::crd::Database;
use crate::resources::{BACKEND_LABEL, FIELD_MANAGER, owner_reference, standard_labels};

pub const ORIGIN: &str = "local";

const DATA_VOLUME: &str = "data";

/// Container image and wiring for one engine family
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineProfile {
    pub image: &'static str,
    pub port: i32,
    pub data_path: &'static str,
    user_var: &'static str,
    password_vars: &'static [&'static str],
    database_var: &'static str,
}

const POSTGRES: EngineProfile = EngineProfile {
    image: "postgres:16",
    port: 5432,
    data_path: "/var/lib/postgresql/data",
    user_var: "POSTGRES_USER",
    password_vars: &["POSTGRES_PASSWORD"],
    database_var: "POSTGRES_DB",
};

const MYSQL: EngineProfile = EngineProfile {
    image: "mysql:8.0",
    port: 3306,
    data_path: "/var/lib/mysql",
    user_var: "MYSQL_USER",
    password_vars: &["MYSQL_PASSWORD", "MYSQL_ROOT_PASSWORD"],
    database_var: "MYSQL_DATABASE",
};

const MARIADB: EngineProfile = EngineProfile {
    image: "mariadb:11",
    ..MYSQL
};

/// Resolve the profile for an engine name
pub fn engine_profile(engine: &str) -> ProviderResult<EngineProfile> {
    match engine {
        "postgres" | "aurora-postgresql" => Ok(POSTGRES),
        "mysql" | "aurora-mysql" => Ok(MYSQL),
        "mariadb" => Ok(MARIADB),
        other => Err(ProviderError::Configuration(format!(
            "engine {other} is not supported by the local provider"
        ))),
    }
}

/// Labels added to the endpoint Service of locally served Databases
pub fn endpoint_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(BACKEND_LABEL.to_string(), ORIGIN.to_string())])
}

/// Name shared by the backend StatefulSet and Service
pub fn backend_name(database: &Database) -> String {
    format!("{}-backend", database.name_any())
}

fn backend_labels(database: &Database) -> BTreeMap<String, String> {
    let mut labels = standard_labels(&database.name_any());
    labels.insert(
        "app.kubernetes.io/component".to_string(),
        "database-backend".to_string(),
    );
    labels
}

fn selector_labels(database: &Database) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), backend_name(database)),
        (
            "app.kubernetes.io/component".to_string(),
            "database-backend".to_string(),
        ),
    ])
}

fn tcp_probe(port: i32, initial_delay: i32) -> Probe {
    Probe {
        tcp_socket: Some(TCPSocketAction {
            port: IntOrString::Int(port),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(10),
        timeout_seconds: Some(5),
        ..Default::default()
    }
}

/// Generate the backend StatefulSet for a Database
pub fn generate_backend_statefulset(database: &Database) -> ProviderResult<StatefulSet> {
    let profile = engine_profile(&database.spec.engine)?;
    let name = backend_name(database);
    let spec = &database.spec;

    let password_ref = |var: &str| EnvVar {
        name: var.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: spec.password.name.clone(),
                key: spec.password.key.clone(),
                optional: Some(false),
            }),
            ..Default::default()
        }),
        ..Default::default()
    };

    let mut env = vec![
        EnvVar {
            name: profile.user_var.to_string(),
            value: Some(spec.username.clone()),
            ..Default::default()
        },
        EnvVar {
            name: profile.database_var.to_string(),
            value: Some(spec.db_name.clone()),
            ..Default::default()
        },
    ];
    env.extend(profile.password_vars.iter().map(|var| password_ref(*var)));
    if profile == POSTGRES {
        // initdb refuses a mount point containing lost+found
        env.push(EnvVar {
            name: "PGDATA".to_string(),
            value: Some(format!("{}/pgdata", profile.data_path)),
            ..Default::default()
        });
    }

    let container = Container {
        name: "database".to_string(),
        image: Some(profile.image.to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        ports: Some(vec![ContainerPort {
            container_port: profile.port,
            name: Some("db".to_string()),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        env: Some(env),
        volume_mounts: Some(vec![VolumeMount {
            name: DATA_VOLUME.to_string(),
            mount_path: profile.data_path.to_string(),
            ..Default::default()
        }]),
        readiness_probe: Some(tcp_probe(profile.port, 5)),
        liveness_probe: Some(tcp_probe(profile.port, 30)),
        ..Default::default()
    };

    let pvc_template = PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(DATA_VOLUME.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(format!("{}Gi", spec.size)),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };

    let mut pod_labels = backend_labels(database);
    pod_labels.extend(selector_labels(database));

    Ok(StatefulSet {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: database.namespace(),
            labels: Some(pod_labels.clone()),
            owner_references: Some(vec![owner_reference(database)]),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            service_name: Some(name),
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector_labels(database)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    termination_grace_period_seconds: Some(30),
                    ..Default::default()
                }),
            },
            volume_claim_templates: Some(vec![pvc_template]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Generate the ClusterIP Service in front of the backend
pub fn generate_backend_service(database: &Database) -> ProviderResult<Service> {
    let profile = engine_profile(&database.spec.engine)?;

    Ok(Service {
        metadata: ObjectMeta {
            name: Some(backend_name(database)),
            namespace: database.namespace(),
            labels: Some(backend_labels(database)),
            owner_references: Some(vec![owner_reference(database)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(selector_labels(database)),
            ports: Some(vec![ServicePort {
                name: Some("db".to_string()),
                port: profile.port,
                target_port: Some(IntOrString::Int(profile.port)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// In-cluster DNS endpoint of the backend
pub fn backend_endpoint(database: &Database) -> ProviderResult<Endpoint> {
    let profile = engine_profile(&database.spec.engine)?;
    let ns = database.namespace().unwrap_or_else(|| "default".to_string());
    Ok(Endpoint::new(
        format!("{}.{}.svc.cluster.local", backend_name(database), ns),
        profile.port,
    ))
}

pub struct LocalProvider {
    client: Client,
    publisher: ServicePublisher,
}

impl LocalProvider {
    pub fn new(client: Client, publisher: ServicePublisher) -> Self {
        Self { client, publisher }
    }

    async fn apply<T>(&self, database: &Database, resource: &T) -> ProviderResult<()>
    where
        T: Resource<Scope = NamespaceResourceScope>
            + Serialize
            + DeserializeOwned
            + Clone
            + std::fmt::Debug,
        <T as Resource>::DynamicType: Default,
    {
        let ns = database.namespace().unwrap_or_default();
        let api: Api<T> = Api::namespaced(self.client.clone(), &ns);
        let name = resource.name_any();

        api.patch(&name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(resource))
            .await
            .map_err(|e| ProviderError::Allocation {
                name: database.name_any(),
                message: e.to_string(),
            })?;
        debug!(resource = %name, "Applied backend resource");
        Ok(())
    }

    /// Delete one backend object; returns the failure text if any
    async fn remove<T>(&self, ns: &str, name: &str) -> Option<String>
    where
        T: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + std::fmt::Debug,
        <T as Resource>::DynamicType: Default,
    {
        let api: Api<T> = Api::namespaced(self.client.clone(), ns);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                debug!(resource = %name, "Deleted backend resource");
                None
            }
            Err(kube::Error::Api(api_err)) if api_err.code == 404 => None,
            Err(e) => {
                warn!(resource = %name, error = %e, "Failed to delete backend resource");
                Some(format!("{name}: {e}"))
            }
        }
    }
}

#[async_trait]
impl ServiceProvider for LocalProvider {
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
impl DatabaseProvider for LocalProvider {
    #[instrument(skip(self, database), fields(database = %database.name_any()))]
    async fn create_database(&self, database: &Database) -> ProviderResult<Endpoint> {
        // Fail early when the credential is unreadable instead of leaving a
        // pod stuck in CreateContainerConfigError
        let ns = database.namespace().unwrap_or_default();
        self.get_secret(&ns, &database.spec.password.name, &database.spec.password.key)
            .await?;

        let statefulset = generate_backend_statefulset(database)?;
        let service = generate_backend_service(database)?;
        self.apply(database, &statefulset).await?;
        self.apply(database, &service).await?;

        let endpoint = backend_endpoint(database)?;
        info!(endpoint = %endpoint, "Local database backend applied");
        Ok(endpoint)
    }

    #[instrument(skip(self, database), fields(database = %database.name_any()))]
    async fn delete_database(&self, database: &Database) -> ProviderResult<()> {
        let ns = database.namespace().unwrap_or_default();
        let name = backend_name(database);
        let pvc_name = format!("{DATA_VOLUME}-{name}-0");

        let failures: Vec<String> = [
            self.remove::<StatefulSet>(&ns, &name).await,
            self.remove::<Service>(&ns, &name).await,
            self.remove::<PersistentVolumeClaim>(&ns, &pvc_name).await,
        ]
        .into_iter()
        .flatten()
        .collect();

        if failures.is_empty() {
            info!("Local database backend removed");
            Ok(())
        } else {
            Err(ProviderError::Deallocation {
                name: database.name_any(),
                message: failures.join("; "),
            })
        }
    }
}
