use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use sentry::{Hub, SentryFutureExt};
use serde::Serialize;

use super::{CacheContents, CacheKey, CacheStore};

/// A computation shared by every caller asking for the same [`CacheKey`].
///
/// Once settled, awaiting it again yields the same result immediately.
pub struct PendingComputation<T> {
    /// Identifies the computation so that a failure only evicts its own entry, never a newer
    /// computation that replaced it in the meantime.
    id: u64,
    future: Shared<BoxFuture<'static, CacheContents<T>>>,
}

impl<T> Clone for PendingComputation<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            future: self.future.clone(),
        }
    }
}

impl<T> fmt::Debug for PendingComputation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingComputation")
            .field("id", &self.id)
            .field("settled", &self.future.peek().is_some())
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> PendingComputation<T> {
    /// Wraps an already known result.
    ///
    /// Used to put a value computed outside of a [`CoalescingCache`] into its store.
    pub fn resolved(result: CacheContents<T>) -> Self {
        Self {
            id: 0,
            future: futures::future::ready(result).boxed().shared(),
        }
    }

    /// Waits for the computation to settle.
    pub async fn get(&self) -> CacheContents<T> {
        self.future.clone().await
    }

    /// Returns the result if the computation has already settled.
    pub fn peek(&self) -> Option<&CacheContents<T>> {
        self.future.peek()
    }
}

/// De-duplicates concurrent computations of the same value.
///
/// The cache keeps [`PendingComputation`]s in a [`CacheStore`]. A caller finding a live entry
/// awaits it, no matter whether it is still running or has settled. Otherwise the computation is
/// started, stored right away, and driven to completion on a spawned task so that it settles
/// even if every caller goes away. A failed computation is removed from the store as soon as it
/// settles, successful ones follow the eviction rules of the store.
pub struct CoalescingCache<T, S> {
    name: &'static str,
    store: S,
    next_id: Arc<AtomicU64>,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T, S: Clone> Clone for CoalescingCache<T, S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            store: self.store.clone(),
            next_id: Arc::clone(&self.next_id),
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T, S> CoalescingCache<T, S>
where
    T: Clone + Send + Sync + 'static,
    S: CacheStore<PendingComputation<T>>,
{
    pub fn new(name: &'static str, store: S) -> Self {
        Self {
            name,
            store,
            next_id: Arc::new(AtomicU64::new(1)),
            _marker: std::marker::PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Returns the cached result for `args`, invoking `compute` only if there is no live entry.
    ///
    /// `args` is typically a tuple of the arguments `compute` closes over, see
    /// [`CacheKey::from_args`].
    pub async fn get_or_compute<A, F, Fut>(&self, args: &A, compute: F) -> CacheContents<T>
    where
        A: Serialize + ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheContents<T>> + Send + 'static,
    {
        let key = CacheKey::from_args(args)?;
        let pending = self.get_or_compute_key(key, compute);
        pending.get().await
    }

    /// Like [`get_or_compute`](Self::get_or_compute), but with a prebuilt key, returning the
    /// shared computation itself.
    pub fn get_or_compute_key<F, Fut>(&self, key: CacheKey, compute: F) -> PendingComputation<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheContents<T>> + Send + 'static,
    {
        let name = self.name;
        metric!(counter("caches.access") += 1, "cache" => name);

        let mut started = None;
        let pending = self.store.get_or_insert_with(key.clone(), || {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let store = self.store.clone();
            let computation = compute();

            let future = async move {
                let result = computation.await;
                if let Err(err) = &result {
                    metric!(counter("caches.computation.failed") += 1, "cache" => name);
                    tracing::debug!(
                        cache = name,
                        %key,
                        error = err as &dyn std::error::Error,
                        "Evicting failed computation"
                    );
                    store.remove_if(&key, |current| current.id == id);
                }
                result
            };

            let pending = PendingComputation {
                id,
                future: future.boxed().shared(),
            };
            started = Some(pending.clone());
            pending
        });

        match started {
            Some(computation) => {
                metric!(counter("caches.computation") += 1, "cache" => name);
                let driver = computation.future.map(|_| ());
                tokio::spawn(driver.bind_hub(Hub::new_from_top(Hub::current())));
            }
            None => {
                metric!(counter("caches.memory.hit") += 1, "cache" => name);
            }
        }

        pending
    }
}
