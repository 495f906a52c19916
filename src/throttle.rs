//! Provides time based single-flight schedulers which coalesce bursts of requests.
//!
//! A [Throttle] guarantees a minimum interval between actual invocations. It operates on the
//! trailing edge: a request never runs at the moment it arrives but is scheduled to run once
//! the interval permits. While a timer is armed, each further request simply replaces the task
//! which will run when the timer fires - older requests are dropped, the latest one wins. At
//! any instant there is at most one armed timer and at most one pending task per instance.
//!
//! Two first-call policies are available:
//! * [Throttle::new] defers even the very first request by a full interval.
//! * [Throttle::immediate] runs the very first request synchronously on the caller and behaves
//!   identically afterwards.
//!
//! A [Debounce] follows a different policy: instead of enforcing an interval, it waits for a
//! quiet period. Every request restarts the full delay, so the task only runs once no further
//! request has arrived for the configured duration. The typical example is persisting state
//! while a user drags a UI element - the state updates with every pixel of movement, but the
//! expensive write happens once, shortly after the movement stops.
//!
//! Tasks are plain `FnOnce() + Send` closures, therefore a different callback can be supplied
//! on every call. Failures or panics inside a task are the task's own concern - the scheduler
//! clears its bookkeeping before the task runs, so a misbehaving task can never wedge the
//! scheduler.
//!
//! All timers run on tokio, hence both schedulers must be used within a runtime.
//!
//! # Example
//! ```no_run
//! # use callisto::throttle::Throttle;
//! # use std::time::Duration;
//! #[tokio::main]
//! async fn main() {
//!     let throttle = Throttle::new(Duration::from_millis(100));
//!
//!     // A burst of requests...
//!     throttle.invoke(|| println!("first"));
//!     throttle.invoke(|| println!("second"));
//!     throttle.invoke(|| println!("third"));
//!
//!     // ...yields a single invocation ("third") once the interval has passed.
//!     tokio::time::sleep(Duration::from_millis(150)).await;
//! }
//! ```
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

/// The unit of work managed by the schedulers in this module.
type Task = Box<dyn FnOnce() + Send + 'static>;

/// Shared state of a [Throttle].
struct ThrottleState {
    /// Determines if a timer is currently armed.
    scheduled: bool,

    /// The task to run when the armed timer fires. Replaced in place by newer requests.
    pending: Option<Task>,

    /// The point in time of the most recent actual invocation.
    last_invoke: Option<Instant>,
}

/// Invokes at most one task per interval, always preferring the latest requested one.
///
/// See the [module docs](crate::throttle) for the exact coalescing policy.
///
/// A throttle is cheap to clone - clones share their state, so a cloned instance can be handed
/// to another task while both feed the same scheduler.
#[derive(Clone)]
pub struct Throttle {
    interval: Duration,
    immediate_first: bool,
    state: Arc<Mutex<ThrottleState>>,
}

impl Throttle {
    /// Creates a throttle which enforces the given minimum interval between invocations.
    ///
    /// The very first request is deferred by a full interval as well - this instance never
    /// invokes synchronously.
    pub fn new(interval: Duration) -> Self {
        Throttle {
            interval,
            immediate_first: false,
            state: Arc::new(Mutex::new(ThrottleState {
                scheduled: false,
                pending: None,
                last_invoke: None,
            })),
        }
    }

    /// Creates a throttle which runs the very first request synchronously on the caller.
    ///
    /// All subsequent requests follow the same trailing edge policy as [Throttle::new]. This is
    /// the right choice when the first reaction should be instant (e.g. reflecting an initial
    /// state) while later updates may lag behind by up to one interval.
    pub fn immediate(interval: Duration) -> Self {
        Throttle {
            immediate_first: true,
            ..Throttle::new(interval)
        }
    }

    /// Requests an invocation of the given task.
    ///
    /// If a timer is already armed, the task replaces the previously pending one and will run
    /// when that timer fires - the timer keeps its remaining delay. Otherwise a timer is armed
    /// for the remaining portion of the interval (or a full interval if it has already
    /// elapsed).
    ///
    /// Either way, each call results in at most one eventual invocation and a tight burst of
    /// calls results in exactly one invocation carrying the last task of the burst.
    pub fn invoke<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.state.lock().unwrap();

        // A timer is already armed - just swap the task, the timer keeps its deadline.
        if state.scheduled {
            state.pending = Some(Box::new(task));
            return;
        }

        // The very first request ever on an immediate-first instance runs right away.
        if state.last_invoke.is_none() && self.immediate_first {
            state.last_invoke = Some(Instant::now());
            drop(state);
            task();
            return;
        }

        let delay = match state.last_invoke.map(|last_invoke| last_invoke.elapsed()) {
            Some(elapsed) if elapsed < self.interval => self.interval - elapsed,
            _ => self.interval,
        };

        state.scheduled = true;
        state.pending = Some(Box::new(task));
        drop(state);

        // The deadline is fixed here and never recomputed, even if further requests arrive
        // while the timer is running.
        let deadline = Instant::now() + delay;
        let state = Arc::clone(&self.state);
        crate::spawn!(async move {
            tokio::time::sleep_until(deadline).await;

            let task = {
                let mut state = state.lock().unwrap();
                state.scheduled = false;
                state.last_invoke = Some(Instant::now());
                state.pending.take()
            };

            if let Some(task) = task {
                task();
            }
        });
    }
}

/// Shared state of a [Debounce].
struct DebounceState {
    /// Incremented on every request so that timers armed by older requests become no-ops.
    generation: u64,

    /// The task to run once the quiet period has passed.
    pending: Option<Task>,
}

/// Runs a task once a quiet period has passed since the most recent request.
///
/// Every request replaces the pending task and restarts the full delay. See the
/// [module docs](crate::throttle) for when to prefer this over a [Throttle].
///
/// Like a throttle, a debounce is cheap to clone and clones share their state.
#[derive(Clone)]
pub struct Debounce {
    delay: Duration,
    state: Arc<Mutex<DebounceState>>,
}

impl Debounce {
    /// Creates a debounce with the given quiet period.
    pub fn new(delay: Duration) -> Self {
        Debounce {
            delay,
            state: Arc::new(Mutex::new(DebounceState {
                generation: 0,
                pending: None,
            })),
        }
    }

    /// Requests an invocation of the given task once no further request has arrived for the
    /// configured delay.
    pub fn invoke<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.state.lock().unwrap();
        state.generation += 1;
        state.pending = Some(Box::new(task));

        let generation = state.generation;
        drop(state);

        let deadline = Instant::now() + self.delay;
        let state = Arc::clone(&self.state);
        crate::spawn!(async move {
            tokio::time::sleep_until(deadline).await;

            let task = {
                let mut state = state.lock().unwrap();
                // Only the timer belonging to the most recent request may run the task...
                if state.generation == generation {
                    state.pending.take()
                } else {
                    None
                }
            };

            if let Some(task) = task {
                task();
            }
        });
    }
}
