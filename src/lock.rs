//! Lock-backed store.
//!
//! The serialization point is a FIFO backlog of jobs guarded by a mutex over
//! the value. Submitting pushes onto the backlog and then tries to become the
//! drainer; whoever holds the value lock runs every queued job in order. No
//! runtime is required, and submitting never blocks on another caller's
//! critical section.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::error::{Result, SerialError};
use crate::store::{Pending, SerialStore, Slot, StoreConfig};
use crate::watch::{WatchSender, WatchStream};

type Job<T> = Box<dyn FnOnce(&mut Slot<T>) + Send>;

/// Store whose serialization point is a mutex plus an ordered backlog.
///
/// Cheap to clone; clones share the same value.
pub struct LockStore<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    name: String,
    slot: Mutex<Slot<T>>,
    backlog: Mutex<VecDeque<Job<T>>>,
    version: Arc<AtomicU64>,
    closed: AtomicBool,
    watcher: WatchSender<T>,
}

impl<T> Clone for LockStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> LockStore<T> {
    /// Create a store holding `initial`.
    pub fn new(initial: T) -> Self {
        Self::with_config(initial, StoreConfig::default())
    }

    /// Create a store holding `initial` with explicit configuration.
    pub fn with_config(initial: T, config: StoreConfig) -> Self {
        let watcher = WatchSender::new(config.watch_capacity);
        let version = Arc::new(AtomicU64::new(0));
        Self {
            inner: Arc::new(Inner {
                name: config.name,
                slot: Mutex::new(Slot::new(initial, Arc::clone(&version), watcher.clone())),
                backlog: Mutex::new(VecDeque::new()),
                version,
                closed: AtomicBool::new(false),
                watcher,
            }),
        }
    }

    /// Apply `f` and wait for the result on the current thread.
    ///
    /// For callers outside an async context. Blocks while another caller
    /// holds the value lock.
    pub fn mutate_blocking<F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&T) -> T + Send + 'static,
    {
        let pending = self.mutate_detached(f)?;
        self.wait_blocking(pending)
    }

    /// Snapshot of the current value, waiting on the current thread.
    pub fn read_blocking(&self) -> Result<T> {
        let pending = self.read_with_detached(|value: &T| value.clone())?;
        self.wait_blocking(pending)
    }

    fn submit(&self, job: Job<T>) -> Result<()> {
        if self.is_closed() {
            return Err(SerialError::StoreClosed(self.inner.name.clone()));
        }
        self.inner.backlog.lock().push_back(job);
        if let Some(slot) = self.inner.slot.try_lock() {
            self.drain(slot);
        }
        Ok(())
    }

    fn drain<'a>(&'a self, mut slot: parking_lot::MutexGuard<'a, Slot<T>>) {
        loop {
            // Pop under the backlog lock, run without it.
            while let Some(job) = self.pop() {
                job(&mut slot);
            }
            drop(slot);

            // A submitter may have pushed after our last pop but failed
            // try_lock while we still held the slot.
            if self.inner.backlog.lock().is_empty() {
                return;
            }
            slot = match self.inner.slot.try_lock() {
                Some(slot) => slot,
                None => return,
            };
        }
    }

    fn pop(&self) -> Option<Job<T>> {
        self.inner.backlog.lock().pop_front()
    }

    fn wait_blocking<R>(&self, mut pending: Pending<R>) -> Result<R> {
        loop {
            if let Some(result) = pending.try_take() {
                return result;
            }
            // Whoever holds the lock drains our job; taking it ourselves
            // guarantees it has run once we get it.
            let slot = self.inner.slot.lock();
            self.drain(slot);
        }
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> SerialStore<T> for LockStore<T> {
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
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            debug!(store = %self.inner.name, "lock store closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn test_mutate_and_read() {
        let store = LockStore::new(0i64);

        let value = store.mutate(|v| v + 5).await.unwrap();
        assert_eq!(value, 5);
        assert_eq!(store.read().await.unwrap(), 5);
        assert_eq!(store.version(), 1);
    }

    #[tokio::test]
    async fn test_try_mutate_failure_leaves_value() {
        let store = LockStore::new(10i64);

        let result = store
            .try_mutate(|v| if *v < 100 { Err("below minimum") } else { Ok(v - 100) })
            .await;

        assert!(matches!(result, Err(SerialError::OperationFailed(_))));
        assert_eq!(store.read().await.unwrap(), 10);
        assert_eq!(store.version(), 0);
    }

    #[tokio::test]
    async fn test_detached_mutations_keep_submission_order() {
        let store = LockStore::new(Vec::<u32>::new());

        let receipts: Vec<_> = (0..50)
            .map(|i| {
                store
                    .mutate_detached(move |v| {
                        let mut next = v.clone();
                        next.push(i);
                        next
                    })
                    .unwrap()
            })
            .collect();
        for receipt in receipts {
            receipt.await.unwrap();
        }

        assert_eq!(store.read().await.unwrap(), (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_blocking_api_without_runtime() {
        let store = LockStore::new(String::from("a"));
        store.mutate_blocking(|s| format!("{s}b")).unwrap();
        assert_eq!(store.read_blocking().unwrap(), "ab");
    }

    #[test]
    fn test_blocking_threads_no_lost_updates() {
        let store = LockStore::new(0u64);
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        store.mutate_blocking(|v| v + 1).unwrap();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(store.read_blocking().unwrap(), 4000);
    }

    #[tokio::test]
    async fn test_closed_store_rejects() {
        let store = LockStore::with_config(1u8, StoreConfig::named("settings"));
        store.close();
        assert!(store.is_closed());

        let err = store.mutate(|v| v + 1).await.unwrap_err();
        assert!(matches!(err, SerialError::StoreClosed(ref n) if n == "settings"));
    }

    #[tokio::test]
    async fn test_watch_sees_commits_not_failures() {
        let store = LockStore::new(0i32);
        let mut changes = store.watch();

        store.mutate(|v| v + 1).await.unwrap();
        let _ = store.try_mutate(|_| Err::<i32, _>("nope")).await;
        store.mutate(|v| v + 1).await.unwrap();

        let first = changes.next().await.unwrap();
        let second = changes.next().await.unwrap();
        assert_eq!((first.version, first.value), (1, 1));
        assert_eq!((second.version, second.value), (2, 2));
    }

    #[tokio::test]
    async fn test_panicking_reader_does_not_poison() {
        let store = LockStore::new(3u8);
        let err = store
            .read_with(|_| -> u8 { panic!("reader exploded") })
            .await
            .unwrap_err();
        assert!(matches!(err, SerialError::Panicked(_)));
        assert_eq!(store.mutate(|v| v * 2).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_close_runs_already_queued_jobs() {
        let store = LockStore::new(0u32);

        // Hold the value lock so submissions stay in the backlog.
        let slot = store.inner.slot.lock();
        let receipts: Vec<_> = (0..3)
            .map(|_| store.mutate_detached(|v| v + 1).unwrap())
            .collect();
        store.close();
        assert!(matches!(
            store.mutate_detached(|v| v + 1),
            Err(SerialError::StoreClosed(_))
        ));
        store.drain(slot);

        let mut values = Vec::new();
        for receipt in receipts {
            values.push(receipt.await.unwrap());
        }
        assert_eq!(values, vec![1, 2, 3]);
        assert_eq!(store.version(), 3);
    }

    #[derive(Debug)]
    struct Brittle {
        n: u32,
        explode: bool,
    }

    impl Clone for Brittle {
        fn clone(&self) -> Self {
            if self.explode {
                panic!("clone exploded");
            }
            Self {
                n: self.n,
                explode: false,
            }
        }
    }

    #[tokio::test]
    async fn test_panicking_clone_does_not_strand_backlog() {
        let store = LockStore::new(Brittle {
            n: 1,
            explode: false,
        });

        let slot = store.inner.slot.lock();
        let bad = store
            .mutate_detached(|v| Brittle {
                n: v.n + 1,
                explode: true,
            })
            .unwrap();
        let good = store
            .mutate_detached(|v| Brittle {
                n: v.n + 10,
                explode: false,
            })
            .unwrap();
        store.drain(slot);

        assert!(matches!(bad.await, Err(SerialError::Panicked(ref m)) if m == "clone exploded"));
        assert_eq!(good.await.unwrap().n, 11);
        assert_eq!(store.version(), 1);
    }
}
