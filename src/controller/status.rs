//! Status management for Database resources
//!
//! Every write re-reads the live Database, validates the move against the
//! [`DatabaseStateMachine`], replaces only the status block and submits it
//! with the read `resourceVersion`. A conflicting concurrent write causes a
//! fresh read and another attempt.

use std::sync::Arc;

use kube::ResourceExt;
use tracing::{debug, warn};

use crate::controller::error::{Error, Result};
use crate::controller::state_machine::{
    DatabaseEvent, DatabaseStateMachine, TransitionContext, TransitionResult,
};
use crate::crd::{Database, DatabaseState, DatabaseStatus};
use crate::store::{DatabaseStore, StoreError};

/// Attempts before a conflicting status write is given up
pub const MAX_CONFLICT_RETRIES: usize = 3;

/// Details recorded when provisioning completes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Completion {
    /// Name of the connection ConfigMap
    pub connection_config: String,
    /// Name of the Secret holding the password
    pub credentials: String,
}

/// Extra data carried by a status write
#[derive(Clone, Debug, Default)]
pub struct StatusUpdate {
    /// Overrides the transition's default message
    pub message: Option<String>,
    pub completion: Option<Completion>,
}

impl StatusUpdate {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            completion: None,
        }
    }

    pub fn completed(completion: Completion) -> Self {
        Self {
            message: None,
            completion: Some(completion),
        }
    }
}

/// Build the next status for `database` after moving to `to`
pub fn next_status(
    database: &Database,
    to: DatabaseState,
    description: &str,
    update: &StatusUpdate,
) -> DatabaseStatus {
    let mut status = database.status.clone().unwrap_or_default();

    status.state = Some(to);
    status.message = update
        .message
        .clone()
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| description.to_string());

    if to.is_terminal() {
        status.observed_generation = database.metadata.generation;
    }

    if let Some(completion) = &update.completion {
        status.db_connection_config = completion.connection_config.clone();
        status.db_credentials = completion.credentials.clone();
    }

    status
}

/// Persists state transitions of Database resources
#[derive(Clone)]
pub struct StatusManager {
    store: Arc<dyn DatabaseStore>,
    machine: Arc<DatabaseStateMachine>,
}

impl StatusManager {
    pub fn new(store: Arc<dyn DatabaseStore>) -> Self {
        Self {
            store,
            machine: Arc::new(DatabaseStateMachine::new()),
        }
    }

    pub fn machine(&self) -> &DatabaseStateMachine {
        &self.machine
    }

    /// Fetch the live Database, `None` when it was deleted
    pub async fn fetch(&self, database: &Database) -> Result<Option<Database>> {
        let ns = database
            .namespace()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
        Ok(self.store.get(&ns, &database.name_any()).await?)
    }

    /// Apply `event` to the live Database and persist the resulting status
    ///
    /// Returns the Database as written.
    pub async fn transition(
        &self,
        database: &Database,
        event: DatabaseEvent,
        update: StatusUpdate,
    ) -> Result<Database> {
        let name = database.name_any();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let mut live = self.fetch(database).await?.ok_or_else(|| StoreError::NotFound {
                kind: crate::crd::KIND.to_string(),
                name: name.clone(),
            })?;

            let current = live.state();
            let ctx = TransitionContext::new(
                live.metadata.generation,
                live.status.as_ref().and_then(|s| s.observed_generation),
            );

            let (to, description) = match self.machine.transition(current, event, &ctx) {
                TransitionResult::Success {
                    to, description, ..
                } => (to, description),
                TransitionResult::GuardFailed { reason, .. } => {
                    debug!(database = %name, event = %event, reason = %reason, "Transition guard failed");
                    return Err(Error::invalid_transition(current, event));
                }
                TransitionResult::InvalidTransition { .. } => {
                    return Err(Error::invalid_transition(current, event));
                }
            };

            live.status = Some(next_status(&live, to, description, &update));

            match self.store.replace_status(&live).await {
                Ok(written) => {
                    debug!(database = %name, from = ?current, to = %to, "Status updated");
                    return Ok(written);
                }
                Err(StoreError::Conflict { .. }) if attempt < MAX_CONFLICT_RETRIES => {
                    warn!(database = %name, attempt, "Status write conflicted, re-reading");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
