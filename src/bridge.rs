//! Bridges from callback-style collaborators to sequential async code.
//!
//! - [`from_callback`]: a single-shot callback becomes one awaited value.
//!   The first `resolve`/`reject` wins; later calls are protocol violations
//!   that are logged and reported back to the caller, never applied.
//! - [`from_push_source`]: a source that pushes values over time becomes a
//!   [`BridgedSequence`] the consumer pulls from. Values are delivered in
//!   push order; after a terminal signal nothing more is delivered.
//!
//! Failure in a push source is drain-then-error: values buffered before
//! `fail` are still delivered, then the error, then the end.
//!
//! With the default [`Buffering::Unbounded`] policy a producer that outpaces
//! its consumer grows the buffer without limit. Pick a bounded policy for
//! sources that cannot be trusted to slow down.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use tokio::sync::oneshot;
use tokio_stream::Stream;
use tracing::{debug, trace, warn};

use crate::cancel::CancelToken;
use crate::error::{Result, SerialError};

// ---------------------------------------------------------------------------
// Single-shot
// ---------------------------------------------------------------------------

/// Await the single result a callback-style API delivers.
///
/// `register` is invoked once, on first poll, with a [`Resolver`] it must
/// hand to the collaborator. If every resolver clone is dropped without
/// resolving, the result is `Err(Abandoned)`.
pub async fn from_callback<T, F>(register: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(Resolver<T>),
{
    let (tx, rx) = oneshot::channel();
    register(Resolver {
        slot: Arc::new(ResolverSlot {
            sender: Mutex::new(Some(tx)),
        }),
    });
    rx.await.unwrap_or_else(|_| {
        Err(SerialError::Abandoned(
            "resolver dropped without resolving".to_string(),
        ))
    })
}

/// Completion side of [`from_callback`].
///
/// Cheap to clone so success and failure callbacks can each hold one; the
/// exactly-once rule spans all clones.
pub struct Resolver<T> {
    slot: Arc<ResolverSlot<T>>,
}

struct ResolverSlot<T> {
    sender: Mutex<Option<oneshot::Sender<Result<T>>>>,
}

impl<T> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> Resolver<T> {
    /// Deliver the value.
    pub fn resolve(&self, value: T) -> Result<()> {
        self.settle(Ok(value), "resolve")
    }

    /// Deliver a failure.
    pub fn reject(&self, error: impl Into<SerialError>) -> Result<()> {
        self.settle(Err(error.into()), "reject")
    }

    /// Whether `resolve` or `reject` has already been called.
    pub fn is_settled(&self) -> bool {
        self.slot.sender.lock().is_none()
    }

    fn settle(&self, result: Result<T>, call: &str) -> Result<()> {
        let sender = self.slot.sender.lock().take();
        match sender {
            Some(sender) => {
                if sender.send(result).is_err() {
                    debug!(call, "awaiting side went away before the result arrived");
                }
                Ok(())
            }
            None => {
                warn!(call, "resolver used after it was already settled");
                Err(SerialError::BridgeProtocolViolation(format!(
                    "{call} called on an already settled resolver"
                )))
            }
        }
    }
}

impl<T> Drop for ResolverSlot<T> {
    fn drop(&mut self) {
        if self.sender.get_mut().is_some() {
            warn!("resolver dropped without resolving");
        }
    }
}

// ---------------------------------------------------------------------------
// Multi-shot
// ---------------------------------------------------------------------------

/// What to keep when values arrive faster than they are pulled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Buffering {
    /// Keep everything.
    #[default]
    Unbounded,
    /// Keep at most n values, evicting the oldest.
    Newest(usize),
    /// Keep at most n values, discarding new arrivals.
    Oldest(usize),
}

/// Options for [`from_push_source_with`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeOptions {
    /// Cancel the source's token when the consumer cancels or drops the
    /// sequence. Off by default: consumer cancellation alone leaves the
    /// source running.
    pub cancel_source_on_consumer_cancel: bool,
    /// Buffering policy for values not yet pulled.
    pub buffering: Buffering,
}

impl BridgeOptions {
    /// Options with consumer cancellation linked to the source.
    pub fn linked() -> Self {
        Self {
            cancel_source_on_consumer_cancel: true,
            ..Self::default()
        }
    }
}

enum Terminal {
    Finished,
    /// Holds the error until it has been delivered once.
    Failed(Option<SerialError>),
}

struct Channel<T> {
    buffer: VecDeque<T>,
    terminal: Option<Terminal>,
    waker: Option<Waker>,
    consumer_gone: bool,
}

struct Shared<T> {
    channel: Mutex<Channel<T>>,
    source: CancelToken,
    options: BridgeOptions,
    emitters: AtomicUsize,
}

impl<T> Shared<T> {
    fn terminate(&self, terminal: Terminal, call: &str) -> Result<()> {
        let mut channel = self.channel.lock();
        if channel.terminal.is_some() {
            drop(channel);
            warn!(call, "push source signalled after its terminal signal");
            return Err(SerialError::BridgeProtocolViolation(format!(
                "{call} called after the sequence was already terminated"
            )));
        }
        channel.terminal = Some(terminal);
        let waker = channel.waker.take();
        drop(channel);
        if let Some(waker) = waker {
            waker.wake();
        }
        Ok(())
    }
}

/// Turn a push-based source into a pull-based sequence with default options.
pub fn from_push_source<T, F>(register: F) -> BridgedSequence<T>
where
    F: FnOnce(Emitter<T>),
{
    from_push_source_with(BridgeOptions::default(), register)
}

/// Turn a push-based source into a pull-based sequence.
///
/// `register` is invoked immediately with an [`Emitter`]; it typically hands
/// the emitter to callbacks and returns.
pub fn from_push_source_with<T, F>(options: BridgeOptions, register: F) -> BridgedSequence<T>
where
    F: FnOnce(Emitter<T>),
{
    let shared = Arc::new(Shared {
        channel: Mutex::new(Channel {
            buffer: VecDeque::new(),
            terminal: None,
            waker: None,
            consumer_gone: false,
        }),
        source: CancelToken::new(),
        options,
        emitters: AtomicUsize::new(1),
    });
    register(Emitter {
        shared: Arc::clone(&shared),
    });
    BridgedSequence {
        shared,
        done: false,
    }
}

/// Producer side of a [`BridgedSequence`].
///
/// Cheap to clone. Dropping every clone without `finish`/`fail` ends the
/// sequence with `Abandoned`.
pub struct Emitter<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        self.shared.emitters.fetch_add(1, Ordering::AcqRel);
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Emitter<T> {
    /// Push a value.
    ///
    /// After the consumer has gone the value is discarded and `Ok` is
    /// returned; use [`is_consumer_gone`](Self::is_consumer_gone) or the
    /// linked cancellation token to stop producing.
    pub fn emit(&self, value: T) -> Result<()> {
        let mut channel = self.shared.channel.lock();
        if channel.terminal.is_some() {
            drop(channel);
            warn!("push source emitted after its terminal signal");
            return Err(SerialError::BridgeProtocolViolation(
                "emit called after the sequence was already terminated".to_string(),
            ));
        }
        if channel.consumer_gone {
            trace!("consumer gone, value discarded");
            return Ok(());
        }

        match self.shared.options.buffering {
            Buffering::Unbounded => channel.buffer.push_back(value),
            Buffering::Newest(limit) => {
                if limit > 0 {
                    if channel.buffer.len() >= limit {
                        channel.buffer.pop_front();
                        trace!(limit, "buffer full, evicted oldest value");
                    }
                    channel.buffer.push_back(value);
                }
            }
            Buffering::Oldest(limit) => {
                if channel.buffer.len() < limit {
                    channel.buffer.push_back(value);
                } else {
                    trace!(limit, "buffer full, discarded new value");
                }
            }
        }

        let waker = channel.waker.take();
        drop(channel);
        if let Some(waker) = waker {
            waker.wake();
        }
        Ok(())
    }

    /// End the sequence cleanly after the buffered values.
    pub fn finish(&self) -> Result<()> {
        self.shared.terminate(Terminal::Finished, "finish")
    }

    /// End the sequence with `error` after the buffered values.
    pub fn fail(&self, error: impl Into<SerialError>) -> Result<()> {
        self.shared
            .terminate(Terminal::Failed(Some(error.into())), "fail")
    }

    /// `finish` for `None`, `fail` for `Some(error)`.
    pub fn finish_with(&self, error: Option<SerialError>) -> Result<()> {
        match error {
            None => self.finish(),
            Some(error) => self.fail(error),
        }
    }

    /// Whether the consumer has cancelled or dropped the sequence.
    pub fn is_consumer_gone(&self) -> bool {
        self.shared.channel.lock().consumer_gone
    }

    /// Whether the source has been asked to stop.
    ///
    /// Only ever true when the sequence was created with
    /// `cancel_source_on_consumer_cancel`.
    pub fn is_cancelled(&self) -> bool {
        self.shared.source.is_cancelled()
    }

    /// Wait until the source is asked to stop.
    pub async fn cancelled(&self) {
        self.shared.source.cancelled().await
    }

    /// The source's cancellation token.
    pub fn token(&self) -> &CancelToken {
        &self.shared.source
    }
}

impl<T> Drop for Emitter<T> {
    fn drop(&mut self) {
        if self.shared.emitters.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        let mut channel = self.shared.channel.lock();
        if channel.terminal.is_none() {
            warn!("every emitter dropped without finishing the sequence");
            channel.terminal = Some(Terminal::Failed(Some(SerialError::Abandoned(
                "push source dropped without finishing".to_string(),
            ))));
            let waker = channel.waker.take();
            drop(channel);
            if let Some(waker) = waker {
                waker.wake();
            }
        }
    }
}

/// Pull side of a push source: a stream of `Result<T>` items.
///
/// Yields every value in push order, then ends (`None`) after `finish`, or
/// yields one `Err` and then ends after `fail`.
pub struct BridgedSequence<T> {
    shared: Arc<Shared<T>>,
    done: bool,
}

impl<T> BridgedSequence<T> {
    /// Stop consuming: buffered values are discarded and the sequence ends.
    ///
    /// The source keeps running unless the sequence was created with
    /// `cancel_source_on_consumer_cancel`.
    pub fn cancel(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        self.release();
    }

    /// Values pushed but not yet pulled.
    pub fn buffered(&self) -> usize {
        self.shared.channel.lock().buffer.len()
    }

    /// Whether the sequence has delivered its terminal item or was cancelled.
    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn options(&self) -> BridgeOptions {
        self.shared.options
    }

    fn release(&self) {
        {
            let mut channel = self.shared.channel.lock();
            channel.consumer_gone = true;
            channel.buffer.clear();
            channel.waker = None;
        }
        if self.shared.options.cancel_source_on_consumer_cancel {
            debug!("consumer cancelled, cancelling linked push source");
            self.shared.source.cancel();
        } else {
            debug!("consumer cancelled, push source left running");
        }
    }
}

impl<T> Stream for BridgedSequence<T> {
    type Item = Result<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        let mut guard = self.shared.channel.lock();
        let channel = &mut *guard;
        if let Some(value) = channel.buffer.pop_front() {
            return Poll::Ready(Some(Ok(value)));
        }
        let item = match channel.terminal.as_mut() {
            None => {
                channel.waker = Some(cx.waker().clone());
                return Poll::Pending;
            }
            Some(Terminal::Finished) => None,
            Some(Terminal::Failed(error)) => error.take().map(Err),
        };
        drop(guard);
        self.done = true;
        Poll::Ready(item)
    }
}

impl<T> Drop for BridgedSequence<T> {
    fn drop(&mut self) {
        if !self.done {
            self.release();
        }
    }
}
