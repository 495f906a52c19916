//! Provides a single-flight queue for asynchronous units of work which drops stale requests.
//!
//! A [DropQueue] executes at most one unit of work at a time. While one is running, at most one
//! successor is kept around - enqueueing another unit while both slots are occupied replaces
//! the queued successor, so intermediate requests are silently dropped ("frame dropping"). Once
//! the running unit completes, the queued successor (if any) starts immediately and its slot is
//! cleared beforehand, so a unit enqueued *during* the successor's execution queues behind it
//! according to the very same rule.
//!
//! This is the concurrency based sibling of the [throttle](crate::throttle): instead of a
//! minimum interval, "in flight" here means an asynchronous unit is actually executing, which
//! eliminates overlap entirely. The classic use case is pushing expensive recomputations from a
//! rapidly changing input - only the latest state matters, so anything which became stale while
//! the previous computation ran can be skipped.
//!
//! Each unit runs in its own tokio task. A unit which fails or panics is contained there - the
//! queue logs the failure and still promotes the queued successor, so a misbehaving unit can
//! never wedge the queue.
//!
//! # Example
//! ```no_run
//! # use callisto::drop_queue::DropQueue;
//! #[tokio::main]
//! async fn main() {
//!     let queue = DropQueue::new();
//!
//!     // Runs immediately...
//!     queue.enqueue(async { /* recompute something expensive... */ });
//!
//!     // ...these two arrive while the first unit is still running: the second replaces the
//!     // first and only it will run once the current unit has completed.
//!     queue.enqueue(async { /* already stale by the time it would run... */ });
//!     queue.enqueue(async { /* ...therefore only this one runs. */ });
//! }
//! ```
use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::FutureExt;

/// Shared state of a [DropQueue].
struct QueueState {
    /// Determines if a unit of work is currently executing.
    running: bool,

    /// The one queued successor. Replaced in place by newer requests.
    queued: Option<BoxFuture<'static, ()>>,
}

/// Executes asynchronous units of work strictly one after another, keeping at most one
/// successor and dropping everything in between.
///
/// See the [module docs](crate::drop_queue) for the exact policy.
///
/// A queue is cheap to clone - clones share their state, so producers in different tasks can
/// feed the same queue.
#[derive(Clone)]
pub struct DropQueue {
    state: Arc<Mutex<QueueState>>,
}

impl DropQueue {
    /// Creates a new, idle queue.
    pub fn new() -> Self {
        DropQueue {
            state: Arc::new(Mutex::new(QueueState {
                running: false,
                queued: None,
            })),
        }
    }

    /// Submits a unit of work.
    ///
    /// If the queue is idle, the unit starts executing immediately (on a spawned task).
    /// Otherwise it is stored as the successor, replacing - and thereby dropping - any unit
    /// which was queued before. A dropped unit is never executed.
    ///
    /// Must be called within a tokio runtime.
    pub fn enqueue<F>(&self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut state = self.state.lock().unwrap();

        if state.running {
            // Latest wins - whatever was queued before is dropped unexecuted.
            state.queued = Some(work.boxed());
            return;
        }

        state.running = true;
        drop(state);

        let shared = Arc::clone(&self.state);
        crate::spawn!(async move {
            let mut current: BoxFuture<'static, ()> = work.boxed();

            loop {
                // Each unit runs in its own task so that a panic is contained and the
                // successor still gets promoted.
                if let Err(error) = tokio::spawn(current).await {
                    log::error!("A unit of work submitted to a drop queue failed: {}", error);
                }

                let mut state = shared.lock().unwrap();
                match state.queued.take() {
                    // The slot is cleared before the successor starts, so units enqueued
                    // during its execution queue behind it.
                    Some(next) => current = next,
                    None => {
                        state.running = false;
                        return;
                    }
                }
            }
        });
    }

    /// Determines if neither a unit is executing nor one is queued.
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock().unwrap();
        !state.running && state.queued.is_none()
    }
}

impl Default for DropQueue {
    fn default() -> Self {
        DropQueue::new()
    }
}
