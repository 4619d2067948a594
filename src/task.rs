//! Cancellable task handles.
//!
//! A [`TaskHandle`] represents one unit of asynchronous work:
//!
//! ```text
//! Pending -(start)-> Running -(body returns Ok)--------> Completed
//!                    Running -(cancellation observed)--> Cancelled
//!                    Running -(body returns Err/panics)-> Failed
//! Pending -(cancel, then start)-----------------------> Cancelled (body never runs)
//! ```
//!
//! Cancellation is cooperative: the body receives a [`TaskContext`] and must
//! check it at its suspension points. A body that never yields cannot be
//! interrupted.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::error::{panic_message, Result, SerialError};

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    /// Created, body not started.
    Pending,
    /// Body is running.
    Running,
    /// Body returned a value.
    Completed,
    /// Cancellation was observed.
    Cancelled,
    /// Body returned an error or panicked.
    Failed,
}

impl TaskState {
    /// Whether the state is final.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Cancelled | TaskState::Failed
        )
    }
}

/// Terminal result of a task, memoized once reached.
#[derive(Debug, Clone)]
pub enum Outcome<T> {
    /// The body returned this value.
    Completed(T),
    /// Cancellation was observed before the body finished.
    Cancelled,
    /// The body failed; every awaiter shares the same error.
    Failed(Arc<SerialError>),
}

impl<T> Outcome<T> {
    /// The terminal state this outcome corresponds to.
    pub fn state(&self) -> TaskState {
        match self {
            Outcome::Completed(_) => TaskState::Completed,
            Outcome::Cancelled => TaskState::Cancelled,
            Outcome::Failed(_) => TaskState::Failed,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }

    /// Convert into a `Result`, mapping cancellation to `SerialError::Cancelled`.
    pub fn into_result(self) -> Result<T> {
        match self {
            Outcome::Completed(value) => Ok(value),
            Outcome::Cancelled => Err(SerialError::Cancelled),
            Outcome::Failed(err) => Err(SerialError::TaskFailed(err.to_string())),
        }
    }
}

/// What to do with the task when an outcome wait times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OnTimeout {
    /// Stop waiting; the task keeps running.
    #[default]
    KeepRunning,
    /// Cancel the task, then wait for it to unwind.
    Cancel,
}

/// View of cancellation handed to a task body.
#[derive(Debug, Clone)]
pub struct TaskContext {
    token: CancelToken,
}

impl TaskContext {
    pub(crate) fn new(token: CancelToken) -> Self {
        Self { token }
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// `Err(Cancelled)` once cancellation has been requested.
    pub fn checkpoint(&self) -> Result<()> {
        if self.token.is_cancelled() {
            Err(SerialError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep, waking early with `Err(Cancelled)` if cancelled.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        self.run(tokio::time::sleep(duration)).await
    }

    /// Await a sub-operation as a cancellable suspension point.
    ///
    /// Checks before starting, abandons `fut` if cancellation arrives while
    /// it is pending, and checks again after it completes.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output> {
        self.checkpoint()?;
        let output = tokio::select! {
            biased;
            _ = self.token.cancelled() => return Err(SerialError::Cancelled),
            output = fut => output,
        };
        self.checkpoint()?;
        Ok(output)
    }

    /// The underlying token, for wiring into other cancellable APIs.
    pub fn token(&self) -> &CancelToken {
        &self.token
    }
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;
type Work<T> = Box<dyn FnOnce(TaskContext) -> BoxFuture<T> + Send>;

struct Shared<T> {
    name: Option<String>,
    state: Mutex<TaskState>,
    work: Mutex<Option<Work<T>>>,
    token: CancelToken,
    outcome: watch::Sender<Option<Outcome<T>>>,
}

impl<T> Shared<T> {
    /// Record the terminal outcome. Only the first call has any effect.
    fn finish(&self, outcome: Outcome<T>) {
        let state = outcome.state();
        let mut pending = Some(outcome);
        // Hold the state lock across publication so awaiters never see a
        // terminal outcome next to a non-terminal state.
        let mut current = self.state.lock();
        let published = self.outcome.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = pending.take();
                true
            } else {
                false
            }
        });
        if published {
            *current = state;
            drop(current);
            debug!(task = self.label(), ?state, "task finished");
        }
    }

    fn label(&self) -> &str {
        self.name.as_deref().unwrap_or("<unnamed>")
    }
}

/// Handle to one unit of cancellable work.
///
/// Cheap to clone; every clone observes the same state and outcome. Dropping
/// handles never cancels the work; call [`cancel`](Self::cancel) on teardown.
pub struct TaskHandle<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("name", &self.shared.name)
            .field("state", &*self.shared.state.lock())
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> TaskHandle<T> {
    /// Create a handle in the `Pending` state without running anything.
    pub fn pending<F, Fut>(work: F) -> Self
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self::build(None, CancelToken::new(), work)
    }

    /// Create and immediately start a task.
    pub fn spawn<F, Fut>(work: F) -> Self
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let handle = Self::pending(work);
        handle.start();
        handle
    }

    /// Create a named `Pending` task; the name shows up in logs.
    pub fn named<F, Fut>(name: impl Into<String>, work: F) -> Self
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self::build(Some(name.into()), CancelToken::new(), work)
    }

    /// Create a `Pending` task whose cancellation is driven by `token`.
    pub(crate) fn build<F, Fut>(name: Option<String>, token: CancelToken, work: F) -> Self
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let work: Work<T> = Box::new(move |ctx| Box::pin(work(ctx)));
        let (outcome, _) = watch::channel(None);
        Self {
            shared: Arc::new(Shared {
                name,
                state: Mutex::new(TaskState::Pending),
                work: Mutex::new(Some(work)),
                token,
                outcome,
            }),
        }
    }

    /// Start the body on the tokio runtime.
    ///
    /// Returns `false` if the task was already started. If cancellation was
    /// requested while pending, the task resolves `Cancelled` and the body is
    /// never invoked. Must be called from within a tokio runtime.
    pub fn start(&self) -> bool {
        let work = match self.shared.work.lock().take() {
            Some(work) => work,
            None => return false,
        };

        if self.shared.token.is_cancelled() {
            debug!(task = self.shared.label(), "cancelled before start");
            self.shared.finish(Outcome::Cancelled);
            return true;
        }

        *self.shared.state.lock() = TaskState::Running;
        debug!(task = self.shared.label(), "task started");

        let ctx = TaskContext::new(self.shared.token.clone());
        let shared = Arc::clone(&self.shared);
        let body = tokio::spawn(async move {
            // Checked on first poll, so cancel() right after start() still wins.
            match ctx.checkpoint() {
                Ok(()) => work(ctx).await,
                Err(err) => Err(err),
            }
        });

        tokio::spawn(async move {
            let outcome = match body.await {
                Ok(Ok(value)) => Outcome::Completed(value),
                Ok(Err(err)) if err.is_cancellation() => Outcome::Cancelled,
                Ok(Err(err)) => Outcome::Failed(Arc::new(err)),
                Err(join) if join.is_panic() => {
                    let message = panic_message(&*join.into_panic());
                    warn!(task = shared.label(), %message, "task body panicked");
                    Outcome::Failed(Arc::new(SerialError::Panicked(message)))
                }
                Err(join) => Outcome::Failed(Arc::new(SerialError::Abandoned(join.to_string()))),
            };
            shared.finish(outcome);
        });
        true
    }

    /// Request cooperative cancellation. Idempotent.
    pub fn cancel(&self) {
        if !self.shared.token.is_cancelled() {
            debug!(task = self.shared.label(), "cancellation requested");
        }
        self.shared.token.cancel();
    }

    /// Whether cancellation has been requested (not necessarily observed).
    pub fn is_cancel_requested(&self) -> bool {
        self.shared.token.is_cancelled()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TaskState {
        *self.shared.state.lock()
    }

    /// Task name, if any.
    pub fn name(&self) -> Option<&str> {
        self.shared.name.as_deref()
    }

    /// The outcome if the task already reached a terminal state.
    pub fn try_outcome(&self) -> Option<Outcome<T>> {
        self.shared.outcome.borrow().clone()
    }

    /// Wait for the terminal outcome.
    ///
    /// Any number of callers may wait; all get the same outcome. Waiting on
    /// a task that is never started waits forever.
    pub async fn outcome(&self) -> Outcome<T> {
        let mut rx = self.shared.outcome.subscribe();
        // The sender lives in `shared`, which we hold, so this cannot fail.
        let resolved = rx.wait_for(Option::is_some).await;
        match resolved {
            Ok(outcome) => outcome.clone().unwrap_or(Outcome::Cancelled),
            Err(_) => Outcome::Failed(Arc::new(SerialError::Abandoned(
                "task outcome channel closed".to_string(),
            ))),
        }
    }

    /// Wait for the outcome for at most `timeout`.
    ///
    /// With [`OnTimeout::KeepRunning`] a timeout returns `Err(Timeout)` and
    /// leaves the task alone. With [`OnTimeout::Cancel`] the task is cancelled
    /// and its (usually `Cancelled`) outcome is returned once it unwinds.
    pub async fn outcome_timeout(
        &self,
        timeout: Duration,
        on_timeout: OnTimeout,
    ) -> Result<Outcome<T>> {
        match tokio::time::timeout(timeout, self.outcome()).await {
            Ok(outcome) => Ok(outcome),
            Err(_) => match on_timeout {
                OnTimeout::KeepRunning => Err(SerialError::Timeout(timeout)),
                OnTimeout::Cancel => {
                    self.cancel();
                    if self.state() == TaskState::Pending {
                        self.start();
                    }
                    Ok(self.outcome().await)
                }
            },
        }
    }
}
