use std::sync::Arc;

use crate::cache::SharedCache;

/// Keeps at most one acquisition of a [SharedCache] alive and re-binds it whenever the derived
/// cache key changes.
///
/// This is the integration point for dependency driven lifecycles: some component computes its
/// creation arguments from a set of inputs and wants the matching cache entry to be acquired
/// while those inputs are active and released once they change or the component is torn down.
///
/// The binding keys strictly off the derived cache key, never off call order. Therefore calling
/// [update](CacheBinding::update) twice with arguments which derive the same key is a no-op for
/// the second call - frameworks which run their setup routine twice in a row (to flush out
/// lifecycle bugs) neither double-create nor double-destroy anything.
///
/// Dropping the binding releases whatever it currently holds.
///
/// # Example
/// ```
/// # use callisto::cache::{CacheBinding, SharedCache};
/// let cache = SharedCache::builder(
///     |name: &String| Ok(format!("resource for {}", name)),
///     |name: &String| name.clone(),
/// )
/// .build();
///
/// let mut binding = CacheBinding::new(cache.clone());
///
/// // Binding to the same key twice only creates the resource once...
/// let _ = binding.update(&"a".to_owned()).unwrap();
/// let _ = binding.update(&"a".to_owned()).unwrap();
/// assert_eq!(cache.created(), 1);
///
/// // ...binding to another key releases the previous entry.
/// let _ = binding.update(&"b".to_owned()).unwrap();
/// assert_eq!(cache.reference_count("a"), None);
/// assert_eq!(cache.reference_count("b"), Some(1));
///
/// drop(binding);
/// assert!(cache.is_empty());
/// ```
pub struct CacheBinding<A, T> {
    cache: Arc<SharedCache<A, T>>,
    active: Option<(String, Arc<T>)>,
}

impl<A, T> CacheBinding<A, T> {
    /// Creates a binding for the given cache which initially holds nothing.
    pub fn new(cache: Arc<SharedCache<A, T>>) -> Self {
        CacheBinding {
            cache,
            active: None,
        }
    }

    /// Binds to the entry for the key derived from the given arguments.
    ///
    /// If the binding already holds that very key, the held instance is returned without
    /// touching the reference count. Otherwise the new entry is acquired first and the
    /// previously held one (if any) is released afterwards.
    ///
    /// # Errors
    /// Fails if the factory fails. In this case the previously held entry remains bound.
    pub fn update(&mut self, args: &A) -> anyhow::Result<Arc<T>> {
        let key = self.cache.key_of(args);

        if let Some((active_key, value)) = &self.active {
            if *active_key == key {
                return Ok(value.clone());
            }
        }

        let value = self.cache.acquire(args)?;
        if let Some((stale_key, _)) = self.active.replace((key, value.clone())) {
            self.cache.release(&stale_key);
        }

        Ok(value)
    }

    /// Releases the currently held entry (if any).
    ///
    /// Calling this on an empty binding does nothing, so teardown logic may run repeatedly.
    pub fn clear(&mut self) {
        if let Some((key, _)) = self.active.take() {
            self.cache.release(&key);
        }
    }

    /// Returns the currently bound instance or **None** if the binding holds nothing.
    pub fn value(&self) -> Option<Arc<T>> {
        self.active.as_ref().map(|(_, value)| value.clone())
    }

    /// Returns the currently bound cache key or **None** if the binding holds nothing.
    pub fn key(&self) -> Option<&str> {
        self.active.as_ref().map(|(key, _)| key.as_str())
    }
}

impl<A, T> Drop for CacheBinding<A, T> {
    fn drop(&mut self) {
        self.clear();
    }
}
