//! Provides a reference counted cache for resources shared across independent users.
//!
//! In contrast to an LRU cache or a TTL based cache, the lifetime of an entry is governed purely
//! by explicit reference counting: the first [acquire](SharedCache::acquire) for a key creates
//! the resource via a caller supplied factory, every further acquire for the same key hands out
//! the very same instance and bumps the reference count. Each [release](SharedCache::release)
//! decrements the count and the moment it reaches zero, the entry is removed and an optional
//! destroy hook runs. There is no eviction and no expiry - a caller which forgets to release
//! keeps the resource alive forever. This is a documented caller responsibility, not something
//! the cache tries to engineer around.
//!
//! Next to the raw `acquire`/`release` pair, the module offers two safer disciplines:
//! * [SharedCache::acquire_scoped] / [SharedCache::with_item] tie the release to scope exit so
//!   that it also happens on early returns and panics.
//! * [CacheBinding] keeps exactly one acquisition alive and re-binds it whenever the derived
//!   cache key changes. This is meant for dependency driven setups which may run their
//!   setup/teardown cycle twice in a row - the binding keys strictly off the cache key, so a
//!   repeated setup with unchanged inputs is a no-op.
mod binding;
mod shared_cache;

pub use binding::CacheBinding;
pub use shared_cache::{CacheHandle, SharedCache, SharedCacheBuilder};
