//! Notification stream over Database resources
//!
//! The raw watcher reports applies, deletes and periodic relists. This
//! module folds them into informer-style notifications: `Added` for the
//! first sighting of a key and for every relisted object, `Updated` for
//! later changes and periodic resyncs, `Deleted` for deletions including
//! keys that disappeared while the watch was re-listing.

use std::collections::HashMap;
use std::fmt;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, ResourceExt};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::controller::queue::WorkQueue;
use crate::crd::Database;
use crate::health::HealthState;

/// Namespace-qualified identity of a Database
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn from_database(database: &Database) -> Self {
        Self::new(database.namespace().unwrap_or_default(), database.name_any())
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// One delivered change to a Database
#[derive(Clone, Debug, PartialEq)]
pub enum Notification {
    Added(Database),
    Updated(Database),
    Deleted(Database),
}

impl Notification {
    pub fn database(&self) -> &Database {
        match self {
            Notification::Added(db) | Notification::Updated(db) | Notification::Deleted(db) => db,
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::from_database(self.database())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Notification::Added(_) => "Added",
            Notification::Updated(_) => "Updated",
            Notification::Deleted(_) => "Deleted",
        }
    }
}

/// Folds watcher events into [`Notification`]s
#[derive(Default)]
pub struct WatchAdapter {
    known: HashMap<ObjectKey, Database>,
    relisting: Option<HashMap<ObjectKey, Database>>,
    synced: bool,
}

impl WatchAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of Databases currently known
    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    /// Whether the initial list has been fully delivered
    pub fn has_synced(&self) -> bool {
        self.synced
    }

    /// Translate one watcher event
    pub fn apply(&mut self, event: watcher::Event<Database>) -> Vec<Notification> {
        match event {
            watcher::Event::Apply(db) => {
                let key = ObjectKey::from_database(&db);
                let seen = self.known.insert(key, db.clone()).is_some();
                if seen {
                    vec![Notification::Updated(db)]
                } else {
                    vec![Notification::Added(db)]
                }
            }
            watcher::Event::Delete(db) => {
                self.known.remove(&ObjectKey::from_database(&db));
                vec![Notification::Deleted(db)]
            }
            watcher::Event::Init => {
                self.relisting = Some(HashMap::new());
                vec![]
            }
            watcher::Event::InitApply(db) => {
                let key = ObjectKey::from_database(&db);
                self.relisting
                    .get_or_insert_with(HashMap::new)
                    .insert(key, db.clone());
                vec![Notification::Added(db)]
            }
            watcher::Event::InitDone => {
                let listed = self.relisting.take().unwrap_or_default();
                let mut vanished: Vec<_> = self
                    .known
                    .drain()
                    .filter(|(key, _)| !listed.contains_key(key))
                    .collect();
                vanished.sort_by(|a, b| a.0.cmp(&b.0));
                self.known = listed;
                self.synced = true;
                vanished
                    .into_iter()
                    .map(|(_, db)| Notification::Deleted(db))
                    .collect()
            }
        }
    }

    /// `Updated` for every known Database, in key order
    pub fn resync(&self) -> Vec<Notification> {
        let mut keys: Vec<_> = self.known.keys().collect();
        keys.sort();
        keys.into_iter()
            .filter_map(|key| self.known.get(key))
            .map(|db| Notification::Updated(db.clone()))
            .collect()
    }
}

/// Watch Databases and feed notifications into `queue` until `shutdown`
/// flips to true
///
/// `health` is marked ready once the initial list has been dispatched.
/// The handler of the notification being dispatched when shutdown is
/// signalled runs to completion; nothing after it is dispatched.
pub async fn run_watch(
    api: Api<Database>,
    resync_interval: Duration,
    queue: Arc<WorkQueue<Notification>>,
    health: Option<Arc<HealthState>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let stream = watcher(api, watcher::Config::default()).default_backoff();
    let mut stream = pin!(stream);
    let mut adapter = WatchAdapter::new();
    let mut ready = false;

    let mut resync = tokio::time::interval(resync_interval);
    resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; the initial list covers it
    resync.tick().await;

    loop {
        let batch = tokio::select! {
            _ = shutdown.changed() => break,
            _ = resync.tick() => {
                debug!(count = adapter.len(), "Periodic resync");
                adapter.resync()
            }
            event = stream.next() => match event {
                Some(Ok(event)) => adapter.apply(event),
                Some(Err(e)) => {
                    warn!(error = %e, "Watch error, retrying with backoff");
                    continue;
                }
                None => {
                    error!("Watch stream ended unexpectedly");
                    break;
                }
            },
        };

        for notification in batch {
            if *shutdown.borrow() {
                break;
            }
            queue.dispatch(&notification.key(), notification).await;
        }

        if *shutdown.borrow() {
            break;
        }

        if !ready && adapter.has_synced() {
            ready = true;
            info!(count = adapter.len(), "Initial Database list delivered");
            if let Some(health) = &health {
                health.set_ready(true).await;
            }
        }
    }

    info!("Stopped watching Database resources");
}
