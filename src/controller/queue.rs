//! Dispatch of notifications to handlers
//!
//! With a single worker every item is handled inline, in arrival order,
//! before the next one is accepted. With more workers items are sharded by
//! key hash onto bounded channels, each drained by one task: items for the
//! same key keep their order, items for different keys may run in parallel.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Items buffered per shard before `dispatch` waits
pub const SHARD_CAPACITY: usize = 64;

type Handler<T> = Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;

enum Mode<T> {
    Inline(Handler<T>),
    Sharded {
        senders: Vec<mpsc::Sender<T>>,
        workers: Vec<JoinHandle<()>>,
        stop: watch::Sender<bool>,
    },
}

pub struct WorkQueue<T> {
    mode: Mode<T>,
}

impl<T: Send + 'static> WorkQueue<T> {
    /// Create a queue running `handler` on `workers` workers
    ///
    /// Must be called inside a Tokio runtime when `workers > 1`.
    pub fn new<F, Fut>(workers: usize, handler: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: Handler<T> = Arc::new(move |item| handler(item).boxed());

        if workers <= 1 {
            return Self {
                mode: Mode::Inline(handler),
            };
        }

        let (stop, _) = watch::channel(false);
        let mut senders = Vec::with_capacity(workers);
        let mut tasks = Vec::with_capacity(workers);

        for shard in 0..workers {
            let (tx, rx) = mpsc::channel(SHARD_CAPACITY);
            senders.push(tx);
            tasks.push(tokio::spawn(drain(shard, rx, handler.clone(), stop.subscribe())));
        }

        Self {
            mode: Mode::Sharded {
                senders,
                workers: tasks,
                stop,
            },
        }
    }

    /// Number of parallel workers
    pub fn workers(&self) -> usize {
        match &self.mode {
            Mode::Inline(_) => 1,
            Mode::Sharded { senders, .. } => senders.len(),
        }
    }

    /// Hand `item` to the worker owning `key`
    ///
    /// Inline mode returns once the handler finished. Sharded mode returns
    /// once the item is queued, waiting while the shard is full.
    pub async fn dispatch<K: Hash + ?Sized>(&self, key: &K, item: T) {
        match &self.mode {
            Mode::Inline(handler) => handler(item).await,
            Mode::Sharded { senders, .. } => {
                let shard = shard_for(key, senders.len());
                if let Some(sender) = senders.get(shard)
                    && sender.send(item).await.is_err()
                {
                    error!(shard, "Worker stopped, dropping notification");
                }
            }
        }
    }

    /// Stop accepting work and wait for the workers
    ///
    /// Each worker finishes the item it is handling; queued items that have
    /// not started are dropped.
    pub async fn shutdown(self) {
        if let Mode::Sharded {
            senders,
            workers,
            stop,
        } = self.mode
        {
            let _ = stop.send(true);
            drop(senders);
            for worker in workers {
                if let Err(e) = worker.await {
                    error!(error = %e, "Worker task failed");
                }
            }
        }
    }
}

async fn drain<T>(
    shard: usize,
    mut rx: mpsc::Receiver<T>,
    handler: Handler<T>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let item = tokio::select! {
            biased;
            _ = stop.changed() => break,
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };
        handler(item).await;
        if *stop.borrow() {
            break;
        }
    }
    debug!(shard, "Worker stopped");
}

/// Shard index for `key` among `shards` shards
pub fn shard_for<K: Hash + ?Sized>(key: &K, shards: usize) -> usize {
    if shards <= 1 {
        return 0;
    }
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}
