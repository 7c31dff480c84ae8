//! Endpoint Service generation
//!
//! A Database is published inside the cluster as an `ExternalName` Service
//! named after the Database. Clients resolve `<name>.<namespace>.svc` and are
//! redirected to the provider's hostname.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::crd::Database;
use crate::provider::Endpoint;
use crate::resources::common::{
    ORIGIN_ANNOTATION, merge_owner_reference, owner_reference, port_name, standard_labels,
};

/// Name of the endpoint Service for a Database
pub fn endpoint_service_name(database: &Database) -> String {
    database.name_any()
}

/// Build the ports exposed by the endpoint Service
fn endpoint_ports(database: &Database, endpoint: &Endpoint) -> Vec<ServicePort> {
    vec![ServicePort {
        name: Some(port_name(&database.spec.engine).to_string()),
        port: endpoint.port,
        target_port: Some(IntOrString::Int(endpoint.port)),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }]
}

/// Generate a fresh endpoint Service for a Database
pub fn generate_endpoint_service(
    database: &Database,
    endpoint: &Endpoint,
    origin: &str,
    extra_labels: &BTreeMap<String, String>,
) -> Service {
    let name = endpoint_service_name(database);
    let mut labels = standard_labels(&database.name_any());
    labels.extend(extra_labels.clone());

    Service {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: database.namespace(),
            labels: Some(labels),
            annotations: Some(BTreeMap::from([(
                ORIGIN_ANNOTATION.to_string(),
                origin.to_string(),
            )])),
            owner_references: Some(vec![owner_reference(database)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ExternalName".to_string()),
            external_name: Some(endpoint.hostname.clone()),
            ports: Some(endpoint_ports(database, endpoint)),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Overwrite the mutable fields of an existing endpoint Service
///
/// Ports, target hostname, labels and the origin annotation are reset to the
/// desired values and the Database owner reference is re-asserted. Other
/// metadata (uid, resourceVersion, foreign labels) is kept so the object
/// keeps its identity.
pub fn update_endpoint_service(
    existing: &Service,
    database: &Database,
    endpoint: &Endpoint,
    origin: &str,
    extra_labels: &BTreeMap<String, String>,
) -> Service {
    let desired = generate_endpoint_service(database, endpoint, origin, extra_labels);
    let mut service = existing.clone();

    let labels = service.metadata.labels.get_or_insert_with(BTreeMap::new);
    labels.extend(desired.metadata.labels.unwrap_or_default());

    let annotations = service.metadata.annotations.get_or_insert_with(BTreeMap::new);
    annotations.extend(desired.metadata.annotations.unwrap_or_default());

    let owners = service.metadata.owner_references.get_or_insert_with(Vec::new);
    merge_owner_reference(owners, owner_reference(database));

    let spec = service.spec.get_or_insert_with(ServiceSpec::default);
    if spec.type_.as_deref() != Some("ExternalName") {
        // The API server rejects an ExternalName Service that keeps ClusterIP fields
        spec.cluster_ip = None;
        spec.cluster_ips = None;
        spec.ip_families = None;
        spec.ip_family_policy = None;
        spec.internal_traffic_policy = None;
        spec.session_affinity = None;
        spec.session_affinity_config = None;
        spec.external_traffic_policy = None;
        spec.health_check_node_port = None;
        spec.load_balancer_class = None;
        spec.allocate_load_balancer_node_ports = None;
    }
    spec.type_ = Some("ExternalName".to_string());
    spec.external_name = Some(endpoint.hostname.clone());
    spec.ports = Some(endpoint_ports(database, endpoint));
    spec.selector = None;

    service
}
