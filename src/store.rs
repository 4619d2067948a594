//! SerialStore trait - the serialized access contract for all store backends.
//!
//! A store owns exactly one value. Every read and mutation enters a single
//! serialization point and is applied in the order it entered:
//! - reads observe a fully committed value, never a write in progress
//! - a mutation is a read-modify-write that no other operation interleaves
//! - a failed or panicking mutation leaves the value untouched
//!
//! The value itself is never exposed by reference outside a closure that runs
//! inside the serialization point.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::fmt::Display;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

use crate::error::{panic_message, Result, SerialError};
use crate::watch::{Change, WatchSender, WatchStream};

/// Default broadcast capacity for change notifications.
pub const DEFAULT_WATCH_CAPACITY: usize = 1024;

/// Construction-time configuration shared by all backends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Name used in log output and `StoreClosed` errors.
    pub name: String,
    /// How many unconsumed changes a watcher may lag behind before skipping.
    pub watch_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            name: "store".to_string(),
            watch_capacity: DEFAULT_WATCH_CAPACITY,
        }
    }
}

impl StoreConfig {
    /// Config with the given store name and default capacities.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Receipt for an operation that has entered the serialization point.
///
/// Awaiting it yields the operation's result. Dropping it does not cancel
/// the operation; it still runs in its turn.
#[must_use = "dropping a Pending discards the operation's result"]
pub struct Pending<R> {
    rx: oneshot::Receiver<Result<R>>,
}

impl<R> Pending<R> {
    pub(crate) fn channel() -> (oneshot::Sender<Result<R>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }
}

impl<R> Future for Pending<R> {
    type Output = Result<R>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(dropped_operation())))
    }
}

impl<R> Pending<R> {
    /// Take the result if it is already available, without waiting.
    pub(crate) fn try_take(&mut self) -> Option<Result<R>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(dropped_operation())),
        }
    }
}

fn dropped_operation() -> SerialError {
    SerialError::Abandoned("store dropped the operation before running it".to_string())
}

/// The value owned by a store plus its commit counter.
///
/// Only ever touched from inside a backend's serialization point.
pub(crate) struct Slot<T> {
    value: T,
    version: Arc<AtomicU64>,
    watcher: WatchSender<T>,
}

impl<T: Clone + Send + 'static> Slot<T> {
    /// `version` is shared with the owning backend so it can be read
    /// without entering the serialization point.
    pub(crate) fn new(value: T, version: Arc<AtomicU64>, watcher: WatchSender<T>) -> Self {
        Self {
            value,
            version,
            watcher,
        }
    }

    pub(crate) fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Run a mutation; commit and publish only if it produced a new value.
    pub(crate) fn apply<F, E>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&T) -> std::result::Result<T, E>,
        E: Display,
    {
        // Clones included: a panicking `Clone` is reported like a panicking `f`.
        let attempt = catch_unwind(AssertUnwindSafe(|| {
            f(&self.value).map(|next| {
                let published = next.clone();
                let returned = next.clone();
                (next, published, returned)
            })
        }));
        match attempt {
            Ok(Ok((next, published, returned))) => {
                self.value = next;
                let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
                self.watcher.send(Change {
                    version,
                    value: published,
                });
                Ok(returned)
            }
            Ok(Err(e)) => Err(SerialError::OperationFailed(e.to_string())),
            Err(panic) => Err(SerialError::Panicked(panic_message(&*panic))),
        }
    }

    /// Run a read-only closure against the committed value.
    pub(crate) fn inspect<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&T) -> R,
    {
        catch_unwind(AssertUnwindSafe(|| f(&self.value)))
            .map_err(|panic| SerialError::Panicked(panic_message(&*panic)))
    }
}

/// The serialized access contract.
///
/// Backends differ only in what the serialization point is (a mutex with a
/// FIFO backlog, or a single-consumer queue owned by a worker task). Code
/// should depend on this trait, not on a specific backend.
#[async_trait]
pub trait SerialStore<T>: Send + Sync
where
    T: Clone + Send + Sync + 'static,
{
    /// Name from the store's [`StoreConfig`].
    fn name(&self) -> &str;

    /// Enqueue a fallible mutation without waiting for it to run.
    ///
    /// If `f` returns an error the value is left unchanged and the receipt
    /// resolves to `OperationFailed`.
    fn try_mutate_detached<F, E>(&self, f: F) -> Result<Pending<T>>
    where
        F: FnOnce(&T) -> std::result::Result<T, E> + Send + 'static,
        E: Display + Send + 'static;

    /// Enqueue a read-only closure without waiting for it to run.
    fn read_with_detached<R, F>(&self, f: F) -> Result<Pending<R>>
    where
        F: FnOnce(&T) -> R + Send + 'static,
        R: Send + 'static;

    /// Number of mutations committed so far.
    fn version(&self) -> u64;

    /// Subscribe to committed changes.
    fn watch(&self) -> WatchStream<T>;

    /// Stop accepting operations. Operations already enqueued still run.
    fn close(&self);

    /// Whether [`close`](Self::close) has been called.
    fn is_closed(&self) -> bool;

    /// Enqueue an infallible mutation without waiting for it to run.
    fn mutate_detached<F>(&self, f: F) -> Result<Pending<T>>
    where
        F: FnOnce(&T) -> T + Send + 'static,
    {
        self.try_mutate_detached(move |value| Ok::<T, Infallible>(f(value)))
    }

    /// Apply `f` to the current value, install and return the result.
    async fn mutate<F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&T) -> T + Send + 'static,
    {
        self.mutate_detached(f)?.await
    }

    /// Like [`mutate`](Self::mutate), but `f` may reject the update.
    async fn try_mutate<F, E>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&T) -> std::result::Result<T, E> + Send + 'static,
        E: Display + Send + 'static,
    {
        self.try_mutate_detached(f)?.await
    }

    /// Run `f` against the committed value inside the serialization point.
    async fn read_with<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&T) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.read_with_detached(f)?.await
    }

    /// Snapshot of the current value.
    async fn read(&self) -> Result<T> {
        self.read_with(|value: &T| value.clone()).await
    }

    /// Snapshot rendered as JSON, for presentation collaborators.
    async fn read_json(&self) -> Result<serde_json::Value>
    where
        T: Serialize,
    {
        self.read_with(|value: &T| serde_json::to_value(value))
            .await?
            .map_err(Into::into)
    }
}
