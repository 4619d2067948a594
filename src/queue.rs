//! Queue-backed (actor) store.
//!
//! The value is owned by one worker task and never leaves it. Operations are
//! sent over a single-consumer channel and applied one at a time in arrival
//! order. Closing the store (or dropping the last handle) closes the channel;
//! the worker finishes everything already queued and then exits.
//!
//! Requires a tokio runtime at construction.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{Result, SerialError};
use crate::store::{Pending, SerialStore, Slot, StoreConfig};
use crate::watch::{WatchSender, WatchStream};

type Command<T> = Box<dyn FnOnce(&mut Slot<T>) + Send>;

/// Store whose serialization point is a queue drained by an owning worker.
///
/// Cheap to clone; clones talk to the same worker.
pub struct QueueStore<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    name: String,
    sender: RwLock<Option<mpsc::UnboundedSender<Command<T>>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    version: Arc<AtomicU64>,
    watcher: WatchSender<T>,
}

impl<T> Clone for QueueStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> QueueStore<T> {
    /// Spawn a worker owning `initial`.
    pub fn new(initial: T) -> Self {
        Self::with_config(initial, StoreConfig::default())
    }

    /// Spawn a worker owning `initial` with explicit configuration.
    pub fn with_config(initial: T, config: StoreConfig) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let watcher = WatchSender::new(config.watch_capacity);
        let version = Arc::new(AtomicU64::new(0));
        let slot = Slot::new(initial, Arc::clone(&version), watcher.clone());

        let worker = tokio::spawn(run_worker(config.name.clone(), slot, receiver));
        debug!(store = %config.name, "queue store worker started");

        Self {
            inner: Arc::new(Inner {
                name: config.name,
                sender: RwLock::new(Some(sender)),
                worker: Mutex::new(Some(worker)),
                version,
                watcher,
            }),
        }
    }

    /// Close the store and wait until every queued operation has run.
    pub async fn shutdown(&self) -> Result<()> {
        self.close();
        let worker = self.inner.worker.lock().take();
        if let Some(worker) = worker {
            worker.await.map_err(|e| {
                SerialError::Abandoned(format!(
                    "worker for {} ended abnormally: {e}",
                    self.inner.name
                ))
            })?;
        }
        Ok(())
    }

    fn submit(&self, command: Command<T>) -> Result<()> {
        let sender = self.inner.sender.read();
        let closed = || SerialError::StoreClosed(self.inner.name.clone());
        sender
            .as_ref()
            .ok_or_else(closed)?
            .send(command)
            .map_err(|_| closed())
    }
}

async fn run_worker<T: Clone + Send + 'static>(
    name: String,
    mut slot: Slot<T>,
    mut receiver: mpsc::UnboundedReceiver<Command<T>>,
) {
    while let Some(command) = receiver.recv().await {
        command(&mut slot);
    }
    debug!(store = %name, version = slot.version(), "queue store worker drained and stopped");
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> SerialStore<T> for QueueStore<T> {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn try_mutate_detached<F, E>(&self, f: F) -> Result<Pending<T>>
    where
        F: FnOnce(&T) -> std::result::Result<T, E> + Send + 'static,
        E: Display + Send + 'static,
    {
        let (tx, pending) = Pending::channel();
        self.submit(Box::new(move |slot: &mut Slot<T>| {
            let _ = tx.send(slot.apply(f));
        }))?;
        Ok(pending)
    }

    fn read_with_detached<R, F>(&self, f: F) -> Result<Pending<R>>
    where
        F: FnOnce(&T) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, pending) = Pending::channel();
        self.submit(Box::new(move |slot: &mut Slot<T>| {
            let _ = tx.send(slot.inspect(f));
        }))?;
        Ok(pending)
    }

    fn version(&self) -> u64 {
        self.inner.version.load(Ordering::Acquire)
    }

    fn watch(&self) -> WatchStream<T> {
        self.inner.watcher.subscribe()
    }

    fn close(&self) {
        if self.inner.sender.write().take().is_some() {
            debug!(store = %self.inner.name, "queue store closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.inner.sender.read().is_none()
    }
}
