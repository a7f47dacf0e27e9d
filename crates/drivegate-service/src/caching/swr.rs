use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use moka::notification::RemovalCause;
use moka::ops::compute::Op;
use moka::policy::EvictionPolicy;
use sentry::{Hub, SentryFutureExt};
use thiserror::Error;

use super::{CacheContents, CacheError, CacheKey, CacheStore};
use crate::utils::futures::CallOnDrop;

/// Invalid [`SwrConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SwrConfigError {
    #[error("max_age ({max_age:?}) must be greater than revalidate_after ({revalidate_after:?})")]
    RevalidateAfterExceedsMaxAge {
        max_age: Duration,
        revalidate_after: Duration,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct SwrConfig {
    /// Maximum number of entries. The least recently used entry is evicted first.
    pub max: u64,
    /// Entries older than this are gone, regardless of revalidation.
    pub max_age: Duration,
    /// Entries older than this are revalidated on their next read.
    pub revalidate_after: Duration,
}

/// Refreshes stale values of a [`SwrCache`].
pub trait Revalidator<V>: Send + Sync + 'static {
    /// Produces the successor of `value`.
    ///
    /// `Ok(None)` removes the entry, `Ok(Some(_))` replaces it. An error keeps the current value
    /// and is passed on to [`on_error`](Self::on_error).
    fn revalidate(&self, key: &CacheKey, value: &V) -> BoxFuture<'static, CacheContents<Option<V>>>;

    /// Called when a revalidation fails.
    fn on_error(&self, key: &CacheKey, error: &CacheError) {
        tracing::error!(
            %key,
            error = error as &dyn std::error::Error,
            "Revalidation failed"
        );
    }

    /// Called when an entry leaves the cache because it expired, was evicted for capacity, or
    /// was deleted.
    fn dispose(&self, _key: &CacheKey, _value: &V) {}
}

/// Bookkeeping of one specific cached value.
///
/// A replaced value takes its state with it, so a revalidation that finishes after its value was
/// replaced can never affect the replacement.
#[derive(Debug)]
struct RevalidationState {
    revalidate_after: Instant,
    revalidating: AtomicBool,
}

#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    revalidation: RevalidationState,
}

struct SwrInner<V> {
    name: &'static str,
    cache: moka::sync::Cache<CacheKey, Arc<CacheEntry<V>>>,
    revalidate_after: Duration,
    revalidator: Arc<dyn Revalidator<V>>,
}

/// A bounded stale-while-revalidate cache.
///
/// Values are served for up to `max_age` after they were stored. Reading a value that is older
/// than `revalidate_after` returns it right away and starts a background revalidation, unless one
/// is already running for that value. The outcome of the revalidation replaces or removes the
/// entry, which also restarts its clock.
pub struct SwrCache<V> {
    inner: Arc<SwrInner<V>>,
}

impl<V> Clone for SwrCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Clone + Send + Sync + 'static> SwrCache<V> {
    pub fn new<R>(name: &'static str, config: SwrConfig, revalidator: R) -> Result<Self, SwrConfigError>
    where
        R: Revalidator<V>,
    {
        if config.revalidate_after >= config.max_age {
            return Err(SwrConfigError::RevalidateAfterExceedsMaxAge {
                max_age: config.max_age,
                revalidate_after: config.revalidate_after,
            });
        }

        let revalidator: Arc<dyn Revalidator<V>> = Arc::new(revalidator);
        let cache = {
            let revalidator = Arc::clone(&revalidator);
            moka::sync::Cache::builder()
                .name(name)
                .max_capacity(config.max)
                .time_to_live(config.max_age)
                .eviction_policy(EvictionPolicy::lru())
                .eviction_listener(move |key: Arc<CacheKey>, entry: Arc<CacheEntry<V>>, cause| {
                    // a replacement is either a fresh `set` or a revalidation result, both of
                    // which may carry the very same value
                    if cause != RemovalCause::Replaced {
                        revalidator.dispose(&key, &entry.value);
                    }
                })
                .build()
        };

        Ok(Self {
            inner: Arc::new(SwrInner {
                name,
                cache,
                revalidate_after: config.revalidate_after,
                revalidator,
            }),
        })
    }

    /// Returns the value under `key`, scheduling a revalidation if it is due.
    pub fn get(&self, key: &CacheKey) -> Option<V> {
        let entry = self.inner.cache.get(key)?;
        self.maybe_revalidate(key, &entry);
        Some(entry.value.clone())
    }

    /// Stores `value` with a fresh revalidation state.
    pub fn set(&self, key: CacheKey, value: V) {
        self.inner.cache.insert(key, self.new_entry(value));
    }

    pub fn del(&self, key: &CacheKey) {
        self.inner.cache.invalidate(key);
    }

    /// Sweeps expired entries, disposing of them.
    pub fn prune(&self) {
        self.inner.cache.run_pending_tasks();
    }

    /// The approximate number of live entries.
    pub fn entry_count(&self) -> u64 {
        self.inner.cache.entry_count()
    }

    fn new_entry(&self, value: V) -> Arc<CacheEntry<V>> {
        Arc::new(CacheEntry {
            value,
            revalidation: RevalidationState {
                revalidate_after: Instant::now() + self.inner.revalidate_after,
                revalidating: AtomicBool::new(false),
            },
        })
    }

    fn maybe_revalidate(&self, key: &CacheKey, entry: &Arc<CacheEntry<V>>) {
        let state = &entry.revalidation;
        if state.revalidate_after > Instant::now() {
            return;
        }
        if state.revalidating.swap(true, Ordering::AcqRel) {
            return;
        }

        let done_token = {
            let entry = Arc::clone(entry);
            CallOnDrop::new(move || {
                entry.revalidation.revalidating.store(false, Ordering::Release);
            })
        };

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(cache = self.inner.name, %key, "No runtime to revalidate on");
            return;
        };

        tracing::trace!(cache = self.inner.name, %key, "Spawning revalidation");

        let revalidation = self.inner.revalidator.revalidate(key, &entry.value);
        let this = self.clone();
        let key = key.clone();
        let previous = Arc::clone(entry);
        let task = async move {
            let _done_token = done_token; // move into the future

            let result = revalidation.await;
            this.finish_revalidation(key, &previous, result);
        };

        runtime.spawn(task.bind_hub(Hub::new_from_top(Hub::current())));
    }

    fn finish_revalidation(
        &self,
        key: CacheKey,
        previous: &Arc<CacheEntry<V>>,
        result: CacheContents<Option<V>>,
    ) {
        let name = self.inner.name;
        let next = match result {
            Ok(next) => next,
            Err(err) => {
                metric!(counter("caches.revalidation") += 1, "cache" => name, "outcome" => "error");
                self.inner.revalidator.on_error(&key, &err);
                return;
            }
        };

        let outcome = if next.is_some() { "replaced" } else { "removed" };
        metric!(counter("caches.revalidation") += 1, "cache" => name, "outcome" => outcome);

        self.inner
            .cache
            .entry(key)
            .and_compute_with(|current| match current {
                // only the value that was revalidated may be replaced
                Some(current) if Arc::ptr_eq(current.value(), previous) => match next {
                    Some(value) => Op::Put(self.new_entry(value)),
                    None => Op::Remove,
                },
                _ => Op::Nop,
            });
    }
}

impl<V: Clone + Send + Sync + 'static> CacheStore<V> for SwrCache<V> {
    fn get(&self, key: &CacheKey) -> Option<V> {
        SwrCache::get(self, key)
    }

    fn set(&self, key: CacheKey, value: V) {
        SwrCache::set(self, key, value)
    }

    fn del(&self, key: &CacheKey) {
        SwrCache::del(self, key)
    }

    fn get_or_insert_with(&self, key: CacheKey, init: impl FnOnce() -> V) -> V {
        if let Some(value) = SwrCache::get(self, &key) {
            return value;
        }
        self.inner
            .cache
            .entry(key)
            .or_insert_with(|| self.new_entry(init()))
            .into_value()
            .value
            .clone()
    }

    fn remove_if(&self, key: &CacheKey, predicate: impl FnOnce(&V) -> bool) {
        self.inner
            .cache
            .entry_by_ref(key)
            .and_compute_with(|entry| match entry {
                Some(entry) if predicate(&entry.value().value) => Op::Remove,
                _ => Op::Nop,
            });
    }
}
