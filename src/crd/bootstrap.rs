//! One-time registration of the Database CRD with the cluster

use std::time::Duration;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::PostParams;
use kube::runtime::wait::{await_condition, conditions};
use kube::{Api, Client, CustomResourceExt};
use thiserror::Error;
use tracing::info;

use crate::crd::Database;

/// How long to wait for a freshly created CRD to become established
pub const CRD_ESTABLISH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum CrdError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("CRD {0} was not established within {1:?}")]
    EstablishmentTimeout(String, Duration),

    #[error("Wait error: {0}")]
    WaitError(#[from] kube::runtime::wait::Error),
}

/// Full name of the Database CRD, e.g. `databases.aws.pmacik.dev`
pub fn crd_name() -> String {
    format!("{}.{}", super::PLURAL, super::GROUP)
}

/// Create the Database CRD if it is not registered yet.
///
/// An existing CRD is left untouched. After a fresh create this waits for
/// the API server to report the CRD as established.
pub async fn ensure_crd(client: Client) -> Result<(), CrdError> {
    let crds: Api<CustomResourceDefinition> = Api::all(client);
    let name = crd_name();

    info!(crd = %name, "Ensuring CRD is registered");

    match crds.create(&PostParams::default(), &Database::crd()).await {
        Ok(_) => info!(crd = %name, "CRD created, waiting for it to be established"),
        Err(kube::Error::Api(api_err)) if api_err.code == 409 => {
            info!(crd = %name, "CRD already registered");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    }

    let establish = await_condition(crds, &name, conditions::is_crd_established());
    tokio::time::timeout(CRD_ESTABLISH_TIMEOUT, establish)
        .await
        .map_err(|_| CrdError::EstablishmentTimeout(name.clone(), CRD_ESTABLISH_TIMEOUT))??;

    info!(crd = %name, "CRD established");
    Ok(())
}
