use moka::ops::compute::Op;
use moka::policy::EvictionPolicy;

use super::CacheKey;
use crate::config::InMemoryCacheConfig;

/// A shared key/value store that a [`CoalescingCache`](super::CoalescingCache) keeps its pending
/// computations in.
///
/// Handles are cheap to clone and all clones refer to the same storage.
pub trait CacheStore<V>: Clone + Send + Sync + 'static {
    /// Returns the live value under `key`.
    fn get(&self, key: &CacheKey) -> Option<V>;

    /// Inserts `value`, replacing whatever was stored under `key`.
    fn set(&self, key: CacheKey, value: V);

    /// Removes the value under `key`, if any.
    fn del(&self, key: &CacheKey);

    /// Returns the live value under `key`, or inserts and returns the value produced by `init`.
    ///
    /// This is atomic per key: concurrent callers for the same key either observe the value that
    /// the first caller inserted or insert their own, never both.
    fn get_or_insert_with(&self, key: CacheKey, init: impl FnOnce() -> V) -> V;

    /// Removes the value under `key` if `predicate` holds for it, atomically.
    fn remove_if(&self, key: &CacheKey, predicate: impl FnOnce(&V) -> bool);
}

/// A bounded in-memory store whose entries expire a fixed time after insertion.
///
/// When full, the least recently used entry makes room for a new one.
pub struct MemoryStore<V> {
    cache: moka::sync::Cache<CacheKey, V>,
}

impl<V> Clone for MemoryStore<V> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
        }
    }
}

impl<V: Clone + Send + Sync + 'static> MemoryStore<V> {
    pub fn new(name: &str, config: &InMemoryCacheConfig) -> Self {
        let cache = moka::sync::Cache::builder()
            .name(name)
            .max_capacity(config.max_capacity)
            .time_to_live(config.time_to_live)
            // pending computations must be admitted, or concurrent callers would start their own
            .eviction_policy(EvictionPolicy::lru())
            .build();
        Self { cache }
    }

    /// The approximate number of live entries.
    pub fn entry_count(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }
}

impl<V: Clone + Send + Sync + 'static> CacheStore<V> for MemoryStore<V> {
    fn get(&self, key: &CacheKey) -> Option<V> {
        self.cache.get(key)
    }

    fn set(&self, key: CacheKey, value: V) {
        self.cache.insert(key, value);
    }

    fn del(&self, key: &CacheKey) {
        self.cache.invalidate(key);
    }

    fn get_or_insert_with(&self, key: CacheKey, init: impl FnOnce() -> V) -> V {
        self.cache.entry(key).or_insert_with(init).into_value()
    }

    fn remove_if(&self, key: &CacheKey, predicate: impl FnOnce(&V) -> bool) {
        self.cache
            .entry_by_ref(key)
            .and_compute_with(|entry| match entry {
                Some(entry) if predicate(entry.value()) => Op::Remove,
                _ => Op::Nop,
            });
    }
}
