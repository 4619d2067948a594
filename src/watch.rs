//! Change notifications for reactive consumers of a store.
//!
//! Every committed mutation is published as a [`Change`] carrying the new
//! version and a snapshot of the new value, in commit order.

use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::Stream;
use tracing::trace;

/// A committed change to a store's value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change<T> {
    /// Store version after the change (first mutation is version 1).
    pub version: u64,
    /// Snapshot of the value after the change.
    pub value: T,
}

/// A stream of committed changes.
///
/// Subscribers only see changes committed after they subscribed. A watcher
/// that falls more than the channel capacity behind skips the changes it
/// missed and continues with the oldest one still retained.
pub struct WatchStream<T> {
    inner: BroadcastStream<Change<T>>,
    skipped: u64,
}

impl<T: Clone + Send + 'static> WatchStream<T> {
    fn new(receiver: broadcast::Receiver<Change<T>>) -> Self {
        Self {
            inner: BroadcastStream::new(receiver),
            skipped: 0,
        }
    }

    /// Number of changes this watcher missed by lagging.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

impl<T: Clone + Send + 'static> Stream for WatchStream<T> {
    type Item = Change<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(change))) => return Poll::Ready(Some(change)),
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(n)))) => {
                    trace!(missed = n, "watcher lagged");
                    self.skipped += n;
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Handle for publishing changes to subscribers.
pub(crate) struct WatchSender<T> {
    sender: broadcast::Sender<Change<T>>,
}

impl<T> Clone for WatchSender<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> WatchSender<T> {
    /// Create a new sender with the given channel capacity.
    pub(crate) fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish a change to all subscribers.
    pub(crate) fn send(&self, change: Change<T>) {
        // No subscribers is fine.
        if self.receiver_count() > 0 {
            let _ = self.sender.send(change);
        }
    }

    pub(crate) fn subscribe(&self) -> WatchStream<T> {
        WatchStream::new(self.sender.subscribe())
    }

    pub(crate) fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
