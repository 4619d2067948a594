//! # univrs-serial
//!
//! Serialized access to shared mutable state for the Univrs ecosystem,
//! together with the two pieces that usually travel with it: cancellable
//! units of work and adapters from callback-style APIs to `async`.
//!
//! - **Serialized stores**: one owner of a value, many concurrent readers and
//!   writers, every operation applied in submission order through a single
//!   serialization point
//! - **Task handles**: cooperative cancellation, memoized outcomes, groups
//!   with optional fail-fast
//! - **Callback bridges**: exactly-once single results and ordered,
//!   buffered multi-value sequences
//!
//! ## Backends
//!
//! - [`QueueStore`]: the value lives inside a worker task fed by a queue (actor style)
//! - [`LockStore`]: a mutex plus an ordered backlog; works without a runtime
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use univrs_serial::{QueueStore, SerialStore};
//!
//! #[tokio::main]
//! async fn main() -> univrs_serial::Result<()> {
//!     let store = QueueStore::new(Vec::<String>::new());
//!
//!     store
//!         .mutate(|items| {
//!             let mut next = items.clone();
//!             next.push("Apple".to_string());
//!             next
//!         })
//!         .await?;
//!
//!     println!("{:?} at version {}", store.read().await?, store.version());
//!     Ok(())
//! }
//! ```
//!
//! ## Cancellable work
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use univrs_serial::TaskHandle;
//!
//! #[tokio::main]
//! async fn main() {
//!     let task = TaskHandle::spawn(|ctx| async move {
//!         for _ in 0..10 {
//!             ctx.sleep(Duration::from_secs(1)).await?;
//!         }
//!         Ok("done")
//!     });
//!
//!     // The view went away.
//!     task.cancel();
//!     assert!(task.outcome().await.is_cancelled());
//! }
//! ```
//!
//! ## Bridging callbacks
//!
//! ```rust,no_run
//! use tokio_stream::StreamExt;
//! use univrs_serial::{from_callback, from_push_source};
//!
//! #[tokio::main]
//! async fn main() -> univrs_serial::Result<()> {
//!     let image = from_callback(|resolver| {
//!         std::thread::spawn(move || {
//!             let _ = resolver.resolve("heart.fill");
//!         });
//!     })
//!     .await?;
//!     println!("{image}");
//!
//!     let mut numbers = from_push_source(|emitter| {
//!         for i in 1..=3 {
//!             let _ = emitter.emit(i);
//!         }
//!         let _ = emitter.finish();
//!     });
//!     while let Some(n) = numbers.next().await {
//!         println!("{}", n?);
//!     }
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod cancel;
pub mod error;
pub mod group;
pub mod lock;
pub mod queue;
pub mod store;
pub mod task;
pub mod watch;

// Re-export main types
pub use bridge::{
    from_callback, from_push_source, from_push_source_with, BridgeOptions, BridgedSequence,
    Buffering, Emitter, Resolver,
};
pub use cancel::CancelToken;
pub use error::{Result, SerialError};
pub use group::{GroupPolicy, GroupReport, TaskGroup};
pub use lock::LockStore;
pub use queue::QueueStore;
pub use store::{Pending, SerialStore, StoreConfig, DEFAULT_WATCH_CAPACITY};
pub use task::{OnTimeout, Outcome, TaskContext, TaskHandle, TaskState};
pub use watch::{Change, WatchStream};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::bridge::{from_callback, from_push_source, BridgeOptions, BridgedSequence};
    pub use crate::error::{Result, SerialError};
    pub use crate::group::{GroupPolicy, TaskGroup};
    pub use crate::lock::LockStore;
    pub use crate::queue::QueueStore;
    pub use crate::store::SerialStore;
    pub use crate::task::{Outcome, TaskContext, TaskHandle};
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tokio_stream::StreamExt;

    async fn hammer<S: SerialStore<u64> + Clone + 'static>(store: S) -> u64 {
        let callers: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    let mut ok = 0u64;
                    for _ in 0..1000 {
                        if store.mutate(|v| v + 1).await.is_ok() {
                            ok += 1;
                        }
                    }
                    ok
                })
            })
            .collect();

        let mut successes = 0;
        for caller in callers {
            successes += caller.await.unwrap();
        }
        assert_eq!(store.read().await.unwrap(), successes);
        successes
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_no_lost_updates_queue_store() {
        assert_eq!(hammer(QueueStore::new(0u64)).await, 8000);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_no_lost_updates_lock_store() {
        assert_eq!(hammer(LockStore::new(0u64)).await, 8000);
    }

    #[tokio::test]
    async fn test_failed_mutation_is_not_applied() {
        let store = QueueStore::new(41i32);
        let before = store.read().await.unwrap();

        let result = store
            .try_mutate(|v| {
                let _partial = v + 1;
                Err::<i32, _>("validation failed")
            })
            .await;

        assert!(matches!(result, Err(SerialError::OperationFailed(_))));
        assert_eq!(store.read().await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_cancel_before_first_suspension_point() {
        let side_effect = Arc::new(AtomicBool::new(false));
        let task = {
            let side_effect = Arc::clone(&side_effect);
            TaskHandle::spawn(move |ctx| async move {
                ctx.checkpoint()?;
                side_effect.store(true, Ordering::SeqCst);
                Ok(())
            })
        };
        task.cancel();

        assert!(task.outcome().await.is_cancelled());
        assert!(!side_effect.load(Ordering::SeqCst));
        assert_eq!(task.state(), TaskState::Cancelled);
    }

    #[tokio::test]
    async fn test_sequence_buffers_until_pulled() {
        let mut seq = from_push_source(|emitter| {
            for i in [1, 2, 3] {
                emitter.emit(i).unwrap();
            }
            emitter.finish_with(None).unwrap();
        });

        let mut seen = Vec::new();
        while let Some(item) = seq.next().await {
            seen.push(item.unwrap());
        }
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_sequence_drains_then_errors() {
        let seq = from_push_source(|emitter| {
            emitter.emit(1).unwrap();
            emitter.emit(2).unwrap();
            emitter
                .finish_with(Some(SerialError::upstream("SomeError")))
                .unwrap();
        });

        let items: Vec<Result<i32>> = seq.collect().await;
        assert_eq!(items.len(), 3);
        assert_eq!(*items[0].as_ref().unwrap(), 1);
        assert_eq!(*items[1].as_ref().unwrap(), 2);
        assert!(matches!(items[2], Err(SerialError::Upstream(_))));
    }

    #[tokio::test]
    async fn test_single_shot_resolve_twice() {
        let value = from_callback(|resolver| {
            let twin = resolver.clone();
            std::thread::spawn(move || {
                let _ = resolver.resolve(5);
            })
            .join()
            .unwrap();
            assert!(twin.resolve(5).is_err());
        })
        .await
        .unwrap();
        assert_eq!(value, 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_group_fail_fast() {
        let group: TaskGroup<u32> = TaskGroup::new(GroupPolicy::fail_fast());
        let mut sleepers = Vec::new();
        for i in 0..5u32 {
            let handle = group.spawn(move |ctx| async move {
                if i == 2 {
                    ctx.sleep(Duration::from_millis(100)).await?;
                    return Err(SerialError::upstream("image download failed"));
                }
                ctx.sleep(Duration::from_secs(10)).await?;
                Ok(i)
            });
            if i != 2 {
                sleepers.push(handle);
            }
        }

        let started = Instant::now();
        let report = group.join().await;
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_millis(90), "resolved too early: {elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "fail-fast too slow: {elapsed:?}");
        assert!(report.outcome().is_failed());
        assert!(report.members[2].is_failed());
        assert_eq!(report.completion_order[0], 2);
        for sleeper in sleepers {
            assert_eq!(sleeper.state(), TaskState::Cancelled);
        }
    }

    #[tokio::test]
    async fn test_presentation_teardown_cancels_watcher_task() {
        let store = QueueStore::new(0u32);
        let latest = LockStore::new(0u32);

        let mut changes = store.watch();
        let view = {
            let latest = latest.clone();
            TaskHandle::spawn(move |ctx| async move {
                while let Some(change) = ctx.run(changes.next()).await? {
                    latest.mutate(move |_| change.value).await?;
                }
                Ok(())
            })
        };

        store.mutate(|v| v + 7).await.unwrap();
        for _ in 0..100 {
            if latest.read().await.unwrap() == 7 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(latest.read().await.unwrap(), 7);

        view.cancel();
        assert!(view.outcome().await.is_cancelled());
    }

    #[test]
    fn test_types_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}

        assert_send_sync::<QueueStore<String>>();
        assert_send_sync::<LockStore<String>>();
        assert_send_sync::<TaskHandle<String>>();
        assert_send_sync::<Emitter<String>>();
        assert_send_sync::<Resolver<String>>();
        assert_send_sync::<BridgedSequence<String>>();
    }
}
