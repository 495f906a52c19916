use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Creates a resource from the given arguments.
type Factory<A, T> = dyn Fn(&A) -> anyhow::Result<T> + Send + Sync;

/// Derives the cache key from the given arguments.
type KeyFn<A> = dyn Fn(&A) -> String + Send + Sync;

/// Runs cleanup logic after the last reference to a resource has been released.
type DestroyHook<T> = dyn Fn(&T, &str) -> anyhow::Result<()> + Send + Sync;

/// A live cache entry. As long as it is present in the map, its reference count is at least one.
struct Entry<T> {
    reference_count: usize,
    value: Arc<T>,
}

/// Keeps track of the observable cache events.
///
/// Being able to distinguish "created" from "acquired existing" (and "destroyed" from
/// "released") matters when debugging reference counting bugs, therefore we count each event
/// separately in addition to logging it.
#[derive(Default)]
struct Stats {
    created: AtomicUsize,
    reacquired: AtomicUsize,
    released: AtomicUsize,
    destroyed: AtomicUsize,
    unknown_releases: AtomicUsize,
}

/// Provides a reference counted cache of shared resources.
///
/// A cache is built via [SharedCache::builder] by supplying a factory which creates a resource
/// and a function which derives the cache key from the creation arguments. In many cases the
/// key function simply returns one of the arguments unchanged, but it can also be a more
/// complex computation.
///
/// The cache hands out `Arc<T>` clones of a single shared instance per key. It never evicts on
/// its own - lifetime is governed purely by matching [acquire](SharedCache::acquire) and
/// [release](SharedCache::release) calls.
///
/// Note that the factory and the key function are invoked while the internal map is locked so
/// that no two concurrent acquisitions can race on creating the same entry. As a consequence,
/// neither of them may call back into the same cache.
///
/// # Example
/// ```
/// # use callisto::cache::SharedCache;
/// # use std::sync::Arc;
/// let cache = SharedCache::builder(
///     |name: &String| Ok(format!("resource for {}", name)),
///     |name: &String| name.clone(),
/// )
/// .label("example")
/// .build();
///
/// // The first acquire creates the resource...
/// let first = cache.acquire(&"a".to_owned()).unwrap();
/// // ...all subsequent ones for the same key share it.
/// let second = cache.acquire(&"a".to_owned()).unwrap();
/// assert!(Arc::ptr_eq(&first, &second));
/// assert_eq!(cache.reference_count("a"), Some(2));
///
/// cache.release("a");
/// cache.release("a");
/// assert!(cache.is_empty());
/// ```
pub struct SharedCache<A, T> {
    label: String,
    create_item: Box<Factory<A, T>>,
    cache_key: Box<KeyFn<A>>,
    on_destroy: Option<Box<DestroyHook<T>>>,
    entries: Mutex<HashMap<String, Entry<T>>>,
    stats: Stats,
}

/// Configures and creates a [SharedCache].
///
/// Obtained via [SharedCache::builder].
pub struct SharedCacheBuilder<A, T> {
    label: String,
    create_item: Box<Factory<A, T>>,
    cache_key: Box<KeyFn<A>>,
    on_destroy: Option<Box<DestroyHook<T>>>,
}

impl<A, T> SharedCacheBuilder<A, T> {
    /// Specifies a label which is used to prefix all log lines emitted by the cache.
    pub fn label(mut self, label: &str) -> Self {
        self.label = format!("shared-cache/{}", label);
        self
    }

    /// Installs a hook which runs any needed cleanup logic after the last reference to an item
    /// has been released and it has been removed from the cache.
    ///
    /// If the hook reports an error, the error is logged and swallowed - a release never fails.
    pub fn on_destroy<D>(mut self, hook: D) -> Self
    where
        D: Fn(&T, &str) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_destroy = Some(Box::new(hook));
        self
    }

    /// Builds the cache.
    ///
    /// Each call creates a fresh, fully isolated instance - there is no process wide state.
    pub fn build(self) -> Arc<SharedCache<A, T>> {
        Arc::new(SharedCache {
            label: self.label,
            create_item: self.create_item,
            cache_key: self.cache_key,
            on_destroy: self.on_destroy,
            entries: Mutex::new(HashMap::new()),
            stats: Stats::default(),
        })
    }
}

impl<A, T> SharedCache<A, T> {
    /// Starts building a cache around the given factory and key derivation function.
    ///
    /// See [SharedCacheBuilder] for the optional settings and [SharedCache] for a complete
    /// example.
    pub fn builder<C, K>(create_item: C, cache_key: K) -> SharedCacheBuilder<A, T>
    where
        C: Fn(&A) -> anyhow::Result<T> + Send + Sync + 'static,
        K: Fn(&A) -> String + Send + Sync + 'static,
    {
        SharedCacheBuilder {
            label: "shared-cache".to_owned(),
            create_item: Box::new(create_item),
            cache_key: Box::new(cache_key),
            on_destroy: None,
        }
    }

    /// Returns the cache key which would be used for the given arguments.
    pub fn key_of(&self, args: &A) -> String {
        (self.cache_key)(args)
    }

    /// Acquires the resource for the key derived from the given arguments.
    ///
    /// If an entry is already present, its reference count is incremented and the shared
    /// instance is returned - the factory is not invoked. Otherwise the factory creates the
    /// resource and an entry with a reference count of one is inserted.
    ///
    /// Every successful acquisition must eventually be paired with exactly one
    /// [release](SharedCache::release) for the same key, otherwise the resource is kept alive
    /// forever. Consider [acquire_scoped](SharedCache::acquire_scoped) or
    /// [with_item](SharedCache::with_item) which take care of this automatically.
    ///
    /// # Errors
    /// Fails if the factory fails. In this case nothing is committed to the cache, so a later
    /// acquisition for the same key will invoke the factory again.
    pub fn acquire(&self, args: &A) -> anyhow::Result<Arc<T>> {
        let key = (self.cache_key)(args);
        let mut entries = self.entries.lock().unwrap();

        if let Some(entry) = entries.get_mut(&key) {
            entry.reference_count += 1;
            let _ = self.stats.reacquired.fetch_add(1, Ordering::Relaxed);
            log::info!(
                "[{}] acquired existing item: {} ({} refs)",
                self.label,
                key,
                entry.reference_count
            );
            Ok(entry.value.clone())
        } else {
            let value = Arc::new((self.create_item)(args)?);
            let _ = entries.insert(
                key.clone(),
                Entry {
                    reference_count: 1,
                    value: value.clone(),
                },
            );
            let _ = self.stats.created.fetch_add(1, Ordering::Relaxed);
            log::info!("[{}] created item: {}", self.label, key);
            Ok(value)
        }
    }

    /// Releases one reference to the entry stored for the given key.
    ///
    /// Once the reference count reaches zero, the entry is removed and the destroy hook (if
    /// any) is invoked with the resource and its key.
    ///
    /// Releasing a key which is not present in the cache indicates an imbalanced
    /// acquire/release pair somewhere in the calling code. As the cache does not track who owns
    /// which reference, it cannot tell which caller erred - it logs a warning and performs no
    /// other state change.
    pub fn release(&self, key: &str) {
        let mut entries = self.entries.lock().unwrap();

        let removed_entry = match entries.get_mut(key) {
            Some(entry) => {
                entry.reference_count -= 1;
                let _ = self.stats.released.fetch_add(1, Ordering::Relaxed);
                log::info!(
                    "[{}] released item: {} ({} refs remaining)",
                    self.label,
                    key,
                    entry.reference_count
                );

                if entry.reference_count == 0 {
                    entries.remove(key)
                } else {
                    None
                }
            }
            None => {
                let _ = self.stats.unknown_releases.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "[{}] Attempted to release non-existent cache item: {}",
                    self.label,
                    key
                );
                None
            }
        };

        // Run the destroy hook without holding the map lock so that it may acquire or release
        // other entries of this very cache.
        drop(entries);
        if let Some(entry) = removed_entry {
            self.destroy(key, entry.value);
        }
    }

    /// Removes the entry and runs the destroy hook. The entry has already left the map here.
    fn destroy(&self, key: &str, value: Arc<T>) {
        if let Some(hook) = &self.on_destroy {
            if let Err(error) = hook(&value, key) {
                log::error!(
                    "[{}] The destroy hook for item {} failed: {:#}",
                    self.label,
                    key,
                    error
                );
            }
        }

        let _ = self.stats.destroyed.fetch_add(1, Ordering::Relaxed);
        log::info!("[{}] destroyed item: {}", self.label, key);
    }

    /// Acquires the resource for the given arguments and wraps it into a guard which releases
    /// it when dropped.
    ///
    /// This guarantees that the release happens on every exit path of the surrounding scope -
    /// normal completion, early returns and panics alike.
    ///
    /// # Errors
    /// Fails if the factory fails, just like [acquire](SharedCache::acquire).
    ///
    /// # Example
    /// ```
    /// # use callisto::cache::SharedCache;
    /// let cache = SharedCache::builder(
    ///     |name: &String| Ok(name.len()),
    ///     |name: &String| name.clone(),
    /// )
    /// .build();
    ///
    /// {
    ///     let item = cache.acquire_scoped(&"hello".to_owned()).unwrap();
    ///     assert_eq!(*item, 5);
    /// } // <- released here
    ///
    /// assert!(cache.is_empty());
    /// ```
    pub fn acquire_scoped(&self, args: &A) -> anyhow::Result<CacheHandle<'_, A, T>> {
        let value = self.acquire(args)?;
        Ok(CacheHandle {
            cache: self,
            key: (self.cache_key)(args),
            value,
        })
    }

    /// Acquires the resource for the given arguments, runs the given callback on it and
    /// releases it again, no matter how the callback exits.
    ///
    /// # Errors
    /// Fails if the factory fails. Errors produced by the callback itself are its own business -
    /// have it return a `Result` as its output value if needed.
    pub fn with_item<R>(&self, args: &A, callback: impl FnOnce(&T) -> R) -> anyhow::Result<R> {
        let item = self.acquire_scoped(args)?;
        Ok(callback(&item))
    }

    /// Returns the number of distinct entries currently present in the cache.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Determines if the cache is completely empty.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    /// Returns the current reference count for the given key or **None** if no entry is
    /// present.
    pub fn reference_count(&self, key: &str) -> Option<usize> {
        self.entries
            .lock()
            .unwrap()
            .get(key)
            .map(|entry| entry.reference_count)
    }

    /// Returns the total number of entries created by the factory so far.
    pub fn created(&self) -> usize {
        self.stats.created.load(Ordering::Relaxed)
    }

    /// Returns the total number of acquisitions which found an existing entry.
    pub fn reacquired(&self) -> usize {
        self.stats.reacquired.load(Ordering::Relaxed)
    }

    /// Returns the total number of successful releases.
    pub fn released(&self) -> usize {
        self.stats.released.load(Ordering::Relaxed)
    }

    /// Returns the total number of entries which have been destroyed after their last reference
    /// was released.
    pub fn destroyed(&self) -> usize {
        self.stats.destroyed.load(Ordering::Relaxed)
    }

    /// Returns the total number of release calls which did not match any entry.
    ///
    /// A non-zero value indicates an imbalanced acquire/release pair somewhere in the calling
    /// code.
    pub fn unknown_releases(&self) -> usize {
        self.stats.unknown_releases.load(Ordering::Relaxed)
    }
}

/// A scoped acquisition of a cache entry.
///
/// Obtained via [SharedCache::acquire_scoped]. Dereferences to the cached resource and releases
/// the acquired reference when dropped.
pub struct CacheHandle<'a, A, T> {
    cache: &'a SharedCache<A, T>,
    key: String,
    value: Arc<T>,
}

impl<A, T> CacheHandle<'_, A, T> {
    /// Returns the cache key this handle refers to.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns a clone of the shared instance.
    ///
    /// Note that such a clone outlives the handle and therefore also the acquired reference.
    /// The cache may destroy the entry while clones are still around - they keep the underlying
    /// allocation alive, but a destroy hook might already have torn the resource down.
    pub fn value(&self) -> Arc<T> {
        self.value.clone()
    }
}

impl<A, T> Deref for CacheHandle<'_, A, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value.as_ref()
    }
}

impl<A, T> Drop for CacheHandle<'_, A, T> {
    fn drop(&mut self) {
        self.cache.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::SharedCache;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Creates a cache for string keys which records the order of factory and destroy hook
    /// invocations in the given event list.
    fn recording_cache(events: Arc<Mutex<Vec<String>>>) -> Arc<SharedCache<String, String>> {
        let create_events = events.clone();
        SharedCache::builder(
            move |name: &String| {
                create_events.lock().unwrap().push(format!("create {}", name));
                Ok(format!("resource-{}", name))
            },
            |name: &String| name.clone(),
        )
        .label("test")
        .on_destroy(move |_, key| {
            events.lock().unwrap().push(format!("destroy {}", key));
            Ok(())
        })
        .build()
    }

    #[test]
    fn item_is_created_once_and_shared() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let cache = recording_cache(events.clone());

        let first = cache.acquire(&"a".to_owned()).unwrap();
        let second = cache.acquire(&"a".to_owned()).unwrap();
        let third = cache.acquire(&"a".to_owned()).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first, &third));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.reference_count("a"), Some(3));
        assert_eq!(cache.created(), 1);
        assert_eq!(cache.reacquired(), 2);
        assert_eq!(events.lock().unwrap().as_slice(), ["create a"]);
    }

    #[test]
    fn matching_releases_destroy_exactly_once() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let cache = recording_cache(events.clone());

        let _ = cache.acquire(&"a".to_owned()).unwrap();
        let _ = cache.acquire(&"a".to_owned()).unwrap();
        let _ = cache.acquire(&"a".to_owned()).unwrap();

        // As long as releases are outstanding, nothing is destroyed...
        cache.release("a");
        cache.release("a");
        assert_eq!(cache.destroyed(), 0);
        assert_eq!(cache.reference_count("a"), Some(1));

        // ...the final release removes the entry and runs the hook.
        cache.release("a");
        assert_eq!(cache.destroyed(), 1);
        assert_eq!(cache.len(), 0);
        assert_eq!(
            events.lock().unwrap().as_slice(),
            ["create a", "destroy a"]
        );
    }

    #[test]
    fn entry_is_recreated_after_a_zero_crossing() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let cache = recording_cache(events.clone());

        let _ = cache.acquire(&"a".to_owned()).unwrap();
        cache.release("a");
        let _ = cache.acquire(&"a".to_owned()).unwrap();
        cache.release("a");

        assert_eq!(cache.created(), 2);
        assert_eq!(cache.destroyed(), 2);
        assert_eq!(
            events.lock().unwrap().as_slice(),
            ["create a", "destroy a", "create a", "destroy a"]
        );
        assert!(cache.is_empty());
    }

    #[test]
    fn release_of_an_unknown_key_is_harmless() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let cache = recording_cache(events.clone());

        let _ = cache.acquire(&"a".to_owned()).unwrap();
        cache.release("b");

        assert_eq!(cache.unknown_releases(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.destroyed(), 0);
        assert_eq!(events.lock().unwrap().as_slice(), ["create a"]);
    }

    #[test]
    fn failed_creation_commits_nothing() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let factory_attempts = attempts.clone();
        let cache = SharedCache::builder(
            move |_: &String| {
                // The first attempt fails, every further one succeeds...
                if factory_attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(anyhow::anyhow!("creation failed"))
                } else {
                    Ok(42)
                }
            },
            |name: &String| name.clone(),
        )
        .build();

        assert!(cache.acquire(&"a".to_owned()).is_err());
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.created(), 0);

        // The failed attempt left no zero-reference entry behind, so the factory runs again.
        assert_eq!(*cache.acquire(&"a".to_owned()).unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(cache.reference_count("a"), Some(1));
    }

    #[test]
    fn failing_destroy_hook_is_swallowed() {
        let cache = SharedCache::builder(
            |name: &String| Ok(name.clone()),
            |name: &String| name.clone(),
        )
        .on_destroy(|_, _| Err(anyhow::anyhow!("cleanup failed")))
        .build();

        let _ = cache.acquire(&"a".to_owned()).unwrap();
        cache.release("a");

        // The hook failed, but the entry is gone and the release did not propagate anything.
        assert!(cache.is_empty());
        assert_eq!(cache.destroyed(), 1);
    }

    #[test]
    fn scoped_handle_releases_on_drop() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let cache = recording_cache(events.clone());

        {
            let item = cache.acquire_scoped(&"a".to_owned()).unwrap();
            assert_eq!(*item, "resource-a");
            assert_eq!(item.key(), "a");
            assert_eq!(cache.reference_count("a"), Some(1));
        }

        assert!(cache.is_empty());
        assert_eq!(
            events.lock().unwrap().as_slice(),
            ["create a", "destroy a"]
        );
    }

    #[test]
    fn with_item_releases_even_on_panic() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let cache = recording_cache(events.clone());

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            cache
                .with_item(&"a".to_owned(), |_item| panic!("callback exploded"))
                .unwrap()
        }));

        assert!(result.is_err());
        assert!(cache.is_empty());
        assert_eq!(cache.destroyed(), 1);
    }

    #[test]
    fn with_item_passes_the_callback_result_through() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let cache = recording_cache(events);

        let length = cache
            .with_item(&"a".to_owned(), |item| item.len())
            .unwrap();

        assert_eq!(length, "resource-a".len());
        assert!(cache.is_empty());
    }

    #[test]
    fn acquire_and_release_pairs_are_idempotent_in_effect() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let cache = recording_cache(events.clone());

        let _ = cache.acquire(&"a".to_owned()).unwrap();
        cache.release("a");
        let _ = cache.acquire(&"a".to_owned()).unwrap();
        cache.release("a");

        // Aside from the recorded events, the cache looks exactly as if nothing had ever been
        // acquired.
        assert!(cache.is_empty());
        assert_eq!(cache.reference_count("a"), None);
        assert_eq!(cache.unknown_releases(), 0);
    }
}
