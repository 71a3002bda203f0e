//! In-memory cache for storing key-value pairs.
//!
//! Uses moka's concurrent cache implementation. Concurrent misses on the
//! same key are coalesced, so an initializer runs at most once per key.

use std::{hash::Hash, sync::Arc};

use moka::sync::Cache;

/// Thread-safe in-memory cache with configurable capacity.
///
/// Used for storing opened key-value namespaces (`MemCache<String, Arc<dyn KeyValue>>`).
#[derive(Clone)]
pub struct MemCache<K, V> {
    entries: Cache<K, V>,
}

impl<K, V> MemCache<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Allocate a new [`MemCache`].
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Cache::new(capacity as u64),
        }
    }

    pub fn set(
        &self,
        key: K,
        value: V,
    ) {
        self.entries.insert(key, value);
    }

    pub fn get(
        &self,
        key: &K,
    ) -> Option<V> {
        self.entries.get(key)
    }

    pub fn remove(
        &self,
        key: &K,
    ) {
        self.entries.invalidate(key);
    }

    /// Returns the cached value, or runs `init` once and caches its result.
    ///
    /// Errors are not cached.
    pub fn get_or_try_insert_with<E, F>(
        &self,
        key: K,
        init: F,
    ) -> Result<V, E>
    where
        F: FnOnce() -> Result<V, E>,
        E: Clone + Send + Sync + 'static,
    {
        self.entries.try_get_with(key, init).map_err(|e: Arc<E>| (*e).clone())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_init_runs_once() {
        let cache: MemCache<String, usize> = MemCache::new(16);
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let v = cache
                .get_or_try_insert_with::<String, _>("a".to_string(), || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(7)
                })
                .unwrap();
            assert_eq!(v, 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_errors_are_not_cached() {
        let cache: MemCache<String, usize> = MemCache::new(16);
        let err = cache.get_or_try_insert_with("a".to_string(), || Err("boom".to_string()));
        assert_eq!(err, Err("boom".to_string()));
        assert!(cache.get(&"a".to_string()).is_none());

        cache.set("a".to_string(), 1);
        cache.remove(&"a".to_string());
        assert!(cache.get(&"a".to_string()).is_none());
    }
}
