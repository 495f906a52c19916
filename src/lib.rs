//! Callisto provides reference counted sharing of expensive resources along with single-flight
//! call coalescing for applications built on [tokio](https://tokio.rs/).
//!
//! # Introduction
//! Many systems keep resources around which are expensive to create and expensive to keep
//! (connections, decoded assets, large lookup structures). Often several independent parts of an
//! application need the same resource at the same time and neither of them knows whether it is
//! the last user. The [shared cache](crate::cache) solves exactly this problem: it hands out a
//! single shared instance per cache key and destroys it precisely when the last reference is
//! released - nothing is ever evicted behind the caller's back.
//!
//! The second family of problems this library addresses are "bursty" callers: UI events, file
//! watchers or metrics sources which fire way more often than the expensive reaction they
//! trigger should run. The [throttle](crate::throttle) and [drop queue](crate::drop_queue)
//! modules coalesce such bursts into at most one in-flight unit of work plus at most one pending
//! successor - whatever arrives in between is replaced by the latest request and silently
//! dropped.
//!
//! # Features
//! * **Reference counted shared cache** - lazily creates a resource per string key, shares it
//!   across all acquirers and runs an optional destroy hook once the last reference is released.
//!   Also provides RAII style scoped acquisition and a re-bindable [CacheBinding](crate::cache::CacheBinding)
//!   for dependency driven setups. See [crate::cache].
//! * **Trailing edge throttle** - guarantees a minimum interval between invocations while always
//!   executing the latest requested task. Available with a deferred or an immediate first
//!   invocation policy. See [crate::throttle].
//! * **Debounce** - runs a task once a quiet period has passed since the most recent request.
//!   See [crate::throttle].
//! * **Drop queue** - executes asynchronous units of work strictly one after another while
//!   keeping at most one successor around ("frame dropping"). See [crate::drop_queue].
//! * **100% Async/Await** - all scheduling builds upon [tokio](https://tokio.rs/) timers and
//!   tasks. The cache itself is synchronous and can also be used outside of a runtime.
//!
//! # Example
//! ```
//! # use callisto::cache::SharedCache;
//! # use std::sync::Arc;
//! let cache = SharedCache::builder(
//!     |name: &String| Ok(format!("an expensive resource for {}", name)),
//!     |name: &String| name.clone(),
//! )
//! .label("resources")
//! .build();
//!
//! // The first acquisition creates the resource, every further one shares it...
//! let first = cache.acquire(&"lookup-table".to_owned()).unwrap();
//! let second = cache.acquire(&"lookup-table".to_owned()).unwrap();
//! assert!(Arc::ptr_eq(&first, &second));
//!
//! // ...and the last release destroys it.
//! cache.release("lookup-table");
//! cache.release("lookup-table");
//! assert!(cache.is_empty());
//! ```
#![deny(
    warnings,
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_results
)]
use simplelog::{format_description, ConfigBuilder, LevelFilter, SimpleLogger};
use std::sync::Once;

pub mod cache;
pub mod drop_queue;
pub mod throttle;

/// Initializes the logging system.
///
/// This sets up **simplelog** to log to stdout which is all that is needed when running inside
/// a container or behind a supervisor which captures stdout anyway.
pub fn init_logging() {
    static INIT_LOGGING: Once = Once::new();

    // We need to do this as otherwise the tests might crash as the logging system
    // is initialized several times...
    INIT_LOGGING.call_once(|| {
        if let Err(error) = SimpleLogger::init(
            LevelFilter::Debug,
            ConfigBuilder::new()
                .set_time_format_custom(format_description!(
                    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]"
                ))
                .set_thread_level(LevelFilter::Trace)
                .set_target_level(LevelFilter::Error)
                .set_location_level(LevelFilter::Trace)
                .build(),
        ) {
            panic!("Failed to initialize logging system: {}", error);
        }
    });
}

/// Provides a simple macro to execute an async lambda within `tokio::spawn`.
///
/// Note that this also applies std::mem::drop on the returned closure to make
/// clippy happy.
///
/// # Example
/// ```rust
/// # #[macro_use] extern crate callisto;
/// # #[tokio::main]
/// # async fn main() {
/// spawn!(async move {
///     // perform some async stuff here...
/// });
/// # }
/// ```
#[macro_export]
macro_rules! spawn {
    ($e:expr) => {{
        std::mem::drop(tokio::spawn($e));
    }};
}
