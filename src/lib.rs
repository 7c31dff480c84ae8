pub mod config;
pub mod controller;
pub mod crd;
pub mod health;
pub mod provider;
pub mod resources;
pub mod store;

pub use controller::{Context, Engine, Error, Notification, Result, WorkQueue};
pub use crd::{Database, DatabaseSpec, DatabaseState, DatabaseStatus};
pub use health::{HealthState, Metrics};

use std::sync::Arc;
use std::time::Duration;

use kube::{Api, Client};
use tokio::sync::watch;

/// Helper to create a namespaced or cluster-wide API based on scope.
fn scoped_api(client: Client, namespace: Option<&str>) -> Api<Database> {
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Run the Database controller until `shutdown` flips to true.
///
/// When `namespace` is `Some(ns)`, only watches resources in that namespace.
/// With one worker every notification is handled in order before the next
/// is read; with more, notifications are sharded per Database.
pub async fn run_controller(
    client: Client,
    ctx: Arc<Context>,
    namespace: Option<&str>,
    resync_interval: Duration,
    workers: usize,
    shutdown: watch::Receiver<bool>,
) {
    let scope_msg = namespace.unwrap_or("cluster-wide");
    tracing::info!(
        workers,
        "Starting controller for Database resources (scope: {})",
        scope_msg
    );

    let health_state = ctx.health_state.clone();
    let engine = Engine::new(ctx);
    let queue = Arc::new(WorkQueue::new(workers, move |notification| {
        let engine = engine.clone();
        async move { engine.handle(notification).await }
    }));

    let databases = scoped_api(client, namespace);
    controller::run_watch(
        databases,
        resync_interval,
        queue.clone(),
        health_state.clone(),
        shutdown,
    )
    .await;

    if let Some(ref state) = health_state {
        state.set_ready(false).await;
    }

    match Arc::try_unwrap(queue) {
        Ok(queue) => queue.shutdown().await,
        Err(_) => tracing::warn!("Work queue still shared, not waiting for workers"),
    }

    tracing::info!("Controller stopped");
}
