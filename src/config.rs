//! Operator configuration from command-line flags and environment

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use kube::config::{InferConfigError, KubeConfigOptions, Kubeconfig, KubeconfigError};
use kube::{Client, Config};
use thiserror::Error;
use tracing::{debug, info};

use crate::provider::ProviderSettings;

/// Backend that provisions the databases
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ProviderKind {
    /// Amazon RDS
    Aws,
    /// A StatefulSet inside the cluster
    Local,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "rds-operator", version, about = "Provision managed databases from Database resources")]
pub struct Args {
    /// Database provider driven by this process
    #[arg(long, env = "RDS_OPERATOR_PROVIDER", value_enum, default_value_t = ProviderKind::Aws)]
    pub provider: ProviderKind,

    /// Kubeconfig used when not running inside a cluster
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Only watch this namespace (cluster-wide when unset)
    #[arg(long, env = "WATCH_NAMESPACE")]
    pub namespace: Option<String>,

    /// Seconds between full resyncs of all known Databases
    #[arg(long, default_value_t = 120)]
    pub resync_interval: u64,

    /// Parallel workers; 1 handles every notification in order
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..))]
    pub workers: u16,

    /// Listen address of the health and metrics server
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub health_addr: SocketAddr,

    /// AWS region for the aws provider
    #[arg(long, env = "AWS_REGION")]
    pub aws_region: Option<String>,

    /// Seconds to wait for an RDS instance to become available
    #[arg(long, default_value_t = 1800)]
    pub provision_timeout: u64,

    /// Seconds between RDS status polls
    #[arg(long, default_value_t = 30)]
    pub poll_interval: u64,

    /// Do not register the Database CRD on startup
    #[arg(long)]
    pub skip_crd_install: bool,

    /// Log as JSON lines
    #[arg(long)]
    pub log_json: bool,
}

impl Args {
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval.max(1))
    }

    pub fn workers(&self) -> usize {
        usize::from(self.workers)
    }

    pub fn provider_settings(&self) -> ProviderSettings {
        ProviderSettings {
            kind: self.provider,
            aws_region: self.aws_region.clone(),
            provision_timeout: Duration::from_secs(self.provision_timeout),
            poll_interval: Duration::from_secs(self.poll_interval.max(1)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load kubeconfig {path}: {source}")]
    Kubeconfig {
        path: PathBuf,
        #[source]
        source: KubeconfigError,
    },

    #[error("failed to infer cluster configuration: {0}")]
    Infer(#[from] InferConfigError),

    #[error("failed to create Kubernetes client: {0}")]
    Client(#[from] kube::Error),
}

/// Resolve the cluster connection once at startup
///
/// In-cluster configuration wins; otherwise the given kubeconfig file, and
/// without one the usual inference.
pub async fn connect(kubeconfig: Option<&PathBuf>) -> Result<Client, ConfigError> {
    let config = match Config::incluster() {
        Ok(config) => {
            info!("Using in-cluster configuration");
            config
        }
        Err(e) => {
            debug!(error = %e, "In-cluster configuration unavailable");
            match kubeconfig {
                Some(path) => {
                    info!(path = %path.display(), "Using kubeconfig");
                    let loaded = Kubeconfig::read_from(path).map_err(|source| {
                        ConfigError::Kubeconfig {
                            path: path.clone(),
                            source,
                        }
                    })?;
                    Config::from_custom_kubeconfig(loaded, &KubeConfigOptions::default())
                        .await
                        .map_err(|source| ConfigError::Kubeconfig {
                            path: path.clone(),
                            source,
                        })?
                }
                None => Config::infer().await?,
            }
        }
    };

    Ok(Client::try_from(config)?)
}
