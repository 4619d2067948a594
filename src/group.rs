//! Task groups: a set of task handles awaited together.
//!
//! Member outcomes are reported in submission order. With fail-fast enabled
//! the first member failure cancels every other member, whether or not the
//! group is being joined; siblings that are already running unwind at their
//! next checkpoint, they are not preempted.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::error::{Result, SerialError};
use crate::task::{Outcome, TaskContext, TaskHandle};

/// How a group reacts to member failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupPolicy {
    /// Cancel the remaining members as soon as one fails.
    pub fail_fast: bool,
}

impl GroupPolicy {
    pub fn fail_fast() -> Self {
        Self { fail_fast: true }
    }
}

/// Result of joining a group.
#[derive(Debug, Clone)]
pub struct GroupReport<T> {
    /// Member outcomes, in submission order.
    pub members: Vec<Outcome<T>>,
    /// Member indices in the order they reached a terminal state.
    pub completion_order: Vec<usize>,
    /// First failure by completion time, if any.
    pub first_failure: Option<Arc<SerialError>>,
}

impl<T: Clone> GroupReport<T> {
    /// Collective outcome.
    ///
    /// `Failed` if any member failed, otherwise `Cancelled` if any member was
    /// cancelled, otherwise `Completed` with every value in submission order.
    pub fn outcome(&self) -> Outcome<Vec<T>> {
        if let Some(err) = &self.first_failure {
            return Outcome::Failed(Arc::clone(err));
        }
        let mut values = Vec::with_capacity(self.members.len());
        for member in &self.members {
            match member {
                Outcome::Completed(value) => values.push(value.clone()),
                _ => return Outcome::Cancelled,
            }
        }
        Outcome::Completed(values)
    }

    /// Values of the members that completed, skipping the rest.
    pub fn completed(&self) -> Vec<T> {
        self.members
            .iter()
            .filter_map(|member| match member {
                Outcome::Completed(value) => Some(value.clone()),
                _ => None,
            })
            .collect()
    }

    /// Collective outcome as a `Result`.
    pub fn into_result(self) -> Result<Vec<T>> {
        self.outcome().into_result()
    }
}

/// A collection of tasks that can be awaited and cancelled together.
///
/// Cheap to clone; clones share the same members. Every member runs under a
/// child of the group's cancellation token, so cancelling the group reaches
/// members whether or not anyone is joining. Dropping the last clone cancels
/// the members that are still running.
pub struct TaskGroup<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    members: Mutex<Vec<TaskHandle<T>>>,
    policy: GroupPolicy,
    token: CancelToken,
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        if !self.token.is_cancelled() {
            debug!(members = self.members.get_mut().len(), "group dropped, cancelling members");
            self.token.cancel();
        }
    }
}

impl<T> Clone for TaskGroup<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Default for TaskGroup<T> {
    fn default() -> Self {
        Self::new(GroupPolicy::default())
    }
}

impl<T: Clone + Send + Sync + 'static> TaskGroup<T> {
    pub fn new(policy: GroupPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                members: Mutex::new(Vec::new()),
                policy,
                token: CancelToken::new(),
            }),
        }
    }

    /// Start `work` as a new member and return its handle.
    ///
    /// Members added to a cancelled group resolve `Cancelled` without running.
    /// Must be called from within a tokio runtime.
    pub fn spawn<F, Fut>(&self, work: F) -> TaskHandle<T>
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let mut members = self.inner.members.lock();
        let index = members.len();
        let name = format!("group-member-{index}");
        let handle = TaskHandle::build(Some(name), self.inner.token.child(), work);
        handle.start();
        if self.inner.policy.fail_fast {
            self.cancel_on_failure(index, handle.clone());
        }
        members.push(handle.clone());
        handle
    }

    fn cancel_on_failure(&self, index: usize, member: TaskHandle<T>) {
        let group = self.inner.token.clone();
        tokio::spawn(async move {
            if member.outcome().await.is_failed() && !group.is_cancelled() {
                debug!(member = index, "member failed, cancelling group");
                group.cancel();
            }
        });
    }

    /// Cancel every member, including ones spawned later. Idempotent.
    pub fn cancel(&self) {
        if !self.inner.token.is_cancelled() {
            debug!(members = self.len(), "group cancelled");
        }
        self.inner.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    pub fn len(&self) -> usize {
        self.inner.members.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn policy(&self) -> GroupPolicy {
        self.inner.policy
    }

    /// Wait for every member spawned so far to reach a terminal state.
    ///
    /// Dropping the returned future stops waiting but leaves the members
    /// alone; cancel the group (or drop it) to stop them.
    pub async fn join(&self) -> GroupReport<T> {
        let snapshot: Vec<TaskHandle<T>> = self.inner.members.lock().clone();

        let mut waiting = JoinSet::new();
        for (index, member) in snapshot.iter().enumerate() {
            let member = member.clone();
            waiting.spawn(async move { (index, member.outcome().await) });
        }

        let mut members: Vec<Option<Outcome<T>>> = vec![None; snapshot.len()];
        let mut completion_order = Vec::with_capacity(snapshot.len());
        let mut first_failure = None;

        while let Some(joined) = waiting.join_next().await {
            let (index, outcome) = match joined {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(error = %err, "group waiter ended abnormally");
                    continue;
                }
            };
            if let Outcome::Failed(err) = &outcome {
                if first_failure.is_none() {
                    first_failure = Some(Arc::clone(err));
                }
            }
            completion_order.push(index);
            members[index] = Some(outcome);
        }

        let members = members
            .into_iter()
            .map(|member| {
                member.unwrap_or_else(|| {
                    Outcome::Failed(Arc::new(SerialError::Abandoned(
                        "group member outcome lost".to_string(),
                    )))
                })
            })
            .collect();

        GroupReport {
            members,
            completion_order,
            first_failure,
        }
    }
}
