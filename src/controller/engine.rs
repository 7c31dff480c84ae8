//! Reconciliation engine for Database resources
//!
//! Consumes [`Notification`]s and drives each Database through the
//! provisioning state machine: allocate through the provider, publish the
//! endpoint Service, publish the connection ConfigMap, record completion.
//! Each step's state is persisted before its side effect runs. Deletion is
//! a separate best-effort path that does not look at status.

use std::sync::Arc;
use std::time::Instant;

use kube::ResourceExt;
use tracing::{debug, error, info, instrument, warn};

use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::controller::state_machine::{
    DatabaseEvent, DatabaseStateMachine, TransitionContext, TransitionResult, progress_rank,
};
use crate::controller::status::{Completion, StatusUpdate};
use crate::controller::validation::validate_spec;
use crate::controller::watch::Notification;
use crate::crd::{Database, DatabaseState};
use crate::provider::ProviderResult;
use crate::resources::config_map::connection_config_name;

/// How a notification reached the engine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// First sighting, initial list or relist
    Added,
    /// Change to a known Database or periodic resync
    Updated,
}

/// What to do with a delivered Database
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Persist this entry event and provision
    Start(DatabaseEvent),
    /// Leave the Database alone
    Skip(&'static str),
}

/// Decide how to react to a live Database
///
/// - no state: provision
/// - `Completed`: never provision again
/// - `Failed`: retry only after the spec was edited
/// - in progress and newly listed: a previous run died, resume it
/// - in progress and updated: our own status writes echoing back
pub fn decide(machine: &DatabaseStateMachine, delivery: Delivery, database: &Database) -> Decision {
    match database.state() {
        None => Decision::Start(DatabaseEvent::Observed),
        Some(DatabaseState::Completed) => Decision::Skip("already completed"),
        Some(DatabaseState::Failed) => {
            let ctx = TransitionContext::new(
                database.metadata.generation,
                database.status.as_ref().and_then(|s| s.observed_generation),
            );
            match machine.transition(Some(DatabaseState::Failed), DatabaseEvent::Retry, &ctx) {
                TransitionResult::Success { .. } => Decision::Start(DatabaseEvent::Retry),
                _ => Decision::Skip("failed and unchanged since"),
            }
        }
        Some(_) => match delivery {
            Delivery::Added => Decision::Start(DatabaseEvent::Resume),
            Delivery::Updated => Decision::Skip("provisioning in progress"),
        },
    }
}

/// Result of handling one create/update notification
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Skipped(&'static str),
    Completed,
    /// Status was set to `Failed` with this message
    Failed(String),
}

/// Result of the best-effort teardown of a deleted Database
#[derive(Debug)]
pub struct DeletionReport {
    pub database: ProviderResult<()>,
    pub service: ProviderResult<()>,
}

impl DeletionReport {
    pub fn is_clean(&self) -> bool {
        self.database.is_ok() && self.service.is_ok()
    }
}

/// Drives Database resources through provisioning
#[derive(Clone)]
pub struct Engine {
    ctx: Arc<Context>,
}

impl Engine {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Handle one notification to completion
    ///
    /// Errors are logged and reflected in metrics; they never escape.
    pub async fn handle(&self, notification: Notification) {
        let start = Instant::now();
        let kind = notification.kind();
        let (database, delivery) = match notification {
            Notification::Added(db) => (db, Some(Delivery::Added)),
            Notification::Updated(db) => (db, Some(Delivery::Updated)),
            Notification::Deleted(db) => (db, None),
        };
        let ns = database.namespace().unwrap_or_default();
        let name = database.name_any();
        debug!(namespace = %ns, name = %name, notification = kind, "Handling notification");

        let failed = match delivery {
            Some(delivery) => match self.handle_create(&database, delivery).await {
                Ok(ReconcileOutcome::Failed(_)) => true,
                Ok(_) => false,
                Err(e) => {
                    error!(namespace = %ns, name = %name, error = %e, "Reconciliation error");
                    true
                }
            },
            None => !self.handle_delete(&database).await.is_clean(),
        };

        if let Some(health) = &self.ctx.health_state {
            health
                .metrics
                .record_reconcile(&ns, &name, start.elapsed().as_secs_f64());
            if failed {
                health.metrics.record_error(&ns, &name);
            } else {
                health.touch_reconcile();
            }
        }
    }

    /// Create path: provision a Database if the delivery guard allows it
    #[instrument(skip(self, database), fields(name = %database.name_any(), namespace = database.namespace().unwrap_or_default()))]
    pub async fn handle_create(
        &self,
        database: &Database,
        delivery: Delivery,
    ) -> Result<ReconcileOutcome> {
        // Decide on the live object, not the possibly stale payload
        let Some(live) = self.ctx.status.fetch(database).await? else {
            debug!("Database no longer exists");
            return Ok(ReconcileOutcome::Skipped("deleted"));
        };
        self.track(&live);

        let event = match decide(self.ctx.status.machine(), delivery, &live) {
            Decision::Start(event) => event,
            Decision::Skip(reason) => {
                debug!(state = ?live.state(), reason, "Skipping");
                return Ok(ReconcileOutcome::Skipped(reason));
            }
        };

        info!(event = %event, state = ?live.state(), "Starting provisioning");
        let entered = self
            .ctx
            .status
            .transition(&live, event, StatusUpdate::default())
            .await?;
        self.track(&entered);

        match self.provision(entered).await {
            Ok(completed) => {
                self.track(&completed);
                info!("Database provisioned");
                Ok(ReconcileOutcome::Completed)
            }
            Err((current, e)) => {
                let message = e.to_string();
                error!(state = ?current.state(), error = %message, "Provisioning failed");
                self.fail(&current, &message).await;
                Ok(ReconcileOutcome::Failed(message))
            }
        }
    }

    /// Run the provisioning steps, returning the last written Database on
    /// failure so the caller can record it
    async fn provision(&self, database: Database) -> Result<Database, (Database, Error)> {
        let provider = self.ctx.provider.as_ref();

        if let Err(e) = validate_spec(&database) {
            return Err((database, e));
        }

        let result = provider.create_database(&database).await;
        self.observe_provider("create_database", result.is_ok());
        let endpoint = match result {
            Ok(endpoint) => endpoint,
            Err(e) => return Err((database, e.into())),
        };
        info!(endpoint = %endpoint, "Database allocated");
        let database = self
            .advance(database, DatabaseEvent::DatabaseAllocated, StatusUpdate::default())
            .await?;

        let result = provider.create_service(&database, &endpoint).await;
        self.observe_provider("create_service", result.is_ok());
        let service = match result {
            Ok(service) => service,
            Err(e) => return Err((database, e.into())),
        };
        let database = self
            .advance(database, DatabaseEvent::ServicePublished, StatusUpdate::default())
            .await?;

        if let Err(e) = self
            .ctx
            .dependents
            .ensure_connection_config(&database, &endpoint, &service)
            .await
        {
            return Err((database, e.into()));
        }

        let completion = Completion {
            connection_config: connection_config_name(&database),
            credentials: database.spec.password.name.clone(),
        };
        self.advance(
            database,
            DatabaseEvent::ConfigPublished,
            StatusUpdate::completed(completion),
        )
        .await
    }

    /// Persist a forward step unless the Database is already past it
    async fn advance(
        &self,
        database: Database,
        event: DatabaseEvent,
        update: StatusUpdate,
    ) -> Result<Database, (Database, Error)> {
        let target = self.ctx.status.machine().target(event);
        if let Some(target) = target
            && progress_rank(Some(target)) <= progress_rank(database.state())
        {
            debug!(state = ?database.state(), event = %event, "Step already recorded");
            return Ok(database);
        }

        match self.ctx.status.transition(&database, event, update).await {
            Ok(written) => {
                self.track(&written);
                Ok(written)
            }
            Err(e) => Err((database, e)),
        }
    }

    /// Record a failure; errors here are only logged
    async fn fail(&self, database: &Database, message: &str) {
        match self
            .ctx
            .status
            .transition(database, DatabaseEvent::StepFailed, StatusUpdate::message(message))
            .await
        {
            Ok(written) => self.track(&written),
            Err(e) if e.is_not_found() => debug!("Database deleted before failure was recorded"),
            Err(e) => warn!(error = %e, "Failed to record failure status"),
        }
    }

    /// Delete path: release the database and remove the endpoint Service
    ///
    /// Both steps always run; a failure of one does not stop the other.
    /// The connection ConfigMap is left to owner-reference garbage collection.
    #[instrument(skip(self, database), fields(name = %database.name_any(), namespace = database.namespace().unwrap_or_default()))]
    pub async fn handle_delete(&self, database: &Database) -> DeletionReport {
        let provider = self.ctx.provider.as_ref();
        info!("Tearing down deleted Database");

        let released = provider.delete_database(database).await;
        self.observe_provider("delete_database", released.is_ok());
        match &released {
            Ok(()) => info!("Database released"),
            Err(e) => error!(error = %e, "Failed to release database"),
        }

        let removed = provider.delete_service(database).await;
        self.observe_provider("delete_service", removed.is_ok());
        match &removed {
            Ok(()) => info!("Endpoint service removed"),
            Err(e) => error!(error = %e, "Failed to remove endpoint service"),
        }

        if let Some(health) = &self.ctx.health_state {
            health.metrics.set_database_state(
                &database.namespace().unwrap_or_default(),
                &database.name_any(),
                None,
            );
        }

        DeletionReport {
            database: released,
            service: removed,
        }
    }

    fn observe_provider(&self, operation: &str, success: bool) {
        if let Some(health) = &self.ctx.health_state {
            health.metrics.record_provider_operation(
                self.ctx.provider.name(),
                operation,
                success,
            );
        }
    }

    fn track(&self, database: &Database) {
        if let Some(health) = &self.ctx.health_state {
            health.metrics.set_database_state(
                &database.namespace().unwrap_or_default(),
                &database.name_any(),
                database.state(),
            );
        }
    }
}
