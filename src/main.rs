use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

use rds_operator::config::{Args, connect};
use rds_operator::controller::Context;
use rds_operator::crd::ensure_crd;
use rds_operator::health::{HealthState, run_health_server};
use rds_operator::provider::select_provider;
use rds_operator::resources::DependentReconciler;
use rds_operator::run_controller;
use rds_operator::store::KubeStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Install the TLS crypto provider before any TLS operations
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        return Err("Failed to install rustls crypto provider and no provider is available".into());
    }

    // Initialize logging
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("rds_operator=info".parse()?)
        .add_directive("kube=info".parse()?);
    if args.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!(provider = ?args.provider, "Starting rds-operator");

    let client = connect(args.kubeconfig.as_ref()).await?;
    info!("Connected to Kubernetes cluster");

    if args.skip_crd_install {
        info!("Skipping CRD registration");
    } else {
        ensure_crd(client.clone()).await?;
    }

    let store = Arc::new(KubeStore::new(client.clone()));
    let dependents = DependentReconciler::new(store.clone(), store.clone());
    let provider = select_provider(
        &args.provider_settings(),
        client.clone(),
        dependents.clone(),
        store.clone(),
    )
    .await?;

    let health_state = Arc::new(HealthState::new());
    let ctx = Arc::new(Context::new(
        store,
        provider,
        dependents,
        Some(health_state.clone()),
    ));

    // Probes answer before the watch starts
    let health_handle = {
        let health_state = health_state.clone();
        let addr = args.health_addr;
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_state, addr).await {
                error!("Health server error: {}", e);
            }
        })
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let controller_handle = {
        let client = client.clone();
        let namespace = args.namespace.clone();
        let resync_interval = args.resync_interval();
        let workers = args.workers();
        tokio::spawn(async move {
            run_controller(
                client,
                ctx,
                namespace.as_deref(),
                resync_interval,
                workers,
                shutdown_rx,
            )
            .await;
        })
    };

    tokio::select! {
        result = health_handle => {
            if let Err(e) = result {
                error!("Health server task panicked: {}", e);
            }
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, finishing in-flight work...");
            health_state.set_ready(false).await;
        }
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = controller_handle.await {
        error!("Controller task panicked: {}", e);
    }

    info!("Operator stopped");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
