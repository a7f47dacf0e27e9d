//! # Drivegate caching infrastructure
//!
//! Every file, folder and site configuration lives on the origin, so nearly every request would
//! cost at least one origin round trip without the caches in this module. All of them are
//! memory-only and can be rebuilt from the origin at any time.
//!
//! ## Layers
//!
//! - A [`CacheStore`] holds values under a [`CacheKey`]. [`MemoryStore`] is a plain bounded store
//!   with a time-to-live, [`SwrCache`] additionally revalidates values in the background once they
//!   become stale.
//! - A [`CoalescingCache`] sits on top of any store and makes sure there is at most one computation
//!   in flight for every key. All callers arriving while a computation is pending share its
//!   outcome. Failed computations are removed from the store so the next caller starts fresh,
//!   successful ones stay until the store evicts them.
//!
//! ### Metrics
//!
//! Each of these is tagged with a `cache` field naming the cache:
//!
//! - `caches.access`: All accesses.
//! - `caches.memory.hit`: Accesses served by a live entry, including pending computations.
//! - `caches.computation`: Computations actually being run.
//! - `caches.computation.failed`: Computations that failed and were evicted.
//! - `caches.revalidation`: Background revalidations, tagged with their `outcome`.
//!
//! ## [`CacheContents`] / [`CacheError`]
//!
//! Computations produce [`CacheContents`], an alias for a [`Result`] around a [`CacheError`].
//! The error is cloneable since the same outcome reaches every awaiter of a coalesced computation.

use std::time::Duration;

use thiserror::Error;

mod cache_key;
mod coalescing;
mod store;
mod swr;

pub use cache_key::CacheKey;
pub use coalescing::{CoalescingCache, PendingComputation};
pub use store::{CacheStore, MemoryStore};
pub use swr::{Revalidator, SwrCache, SwrConfig, SwrConfigError};

/// An error that happens when fetching something from the origin or computing a cached value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The item was not found on the origin.
    #[error("not found")]
    NotFound,
    /// The origin rejected our credentials or the request itself.
    ///
    /// The attached string contains the origin's response.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The origin did not answer in time.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    /// The item could not be fetched due to another problem, like connection loss, DNS
    /// resolution, or a 5xx response.
    ///
    /// The attached string contains the origin's response or error code.
    #[error("download failed: {0}")]
    DownloadError(String),
    /// The item was fetched successfully, but is invalid in some way.
    ///
    /// For example, a site configuration that is not valid JSON or contains a broken pattern.
    #[error("malformed: {0}")]
    Malformed(String),
    /// An unexpected error in the gateway itself.
    #[error("internal error")]
    InternalError,
}

impl From<std::io::Error> for CacheError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl From<serde_json::Error> for CacheError {
    #[track_caller]
    fn from(err: serde_json::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl CacheError {
    /// Logs the error and turns it into an [`InternalError`](Self::InternalError).
    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }
}

/// The result of a cached computation.
pub type CacheContents<T> = Result<T, CacheError>;

/// A [`CoalescingCache`] over a plain [`MemoryStore`].
pub type MemoryCache<T> = CoalescingCache<T, MemoryStore<PendingComputation<T>>>;

/// Creates a [`MemoryCache`] sized by `config`.
pub fn memory_cache<T>(name: &'static str, config: &crate::config::InMemoryCacheConfig) -> MemoryCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    CoalescingCache::new(name, MemoryStore::new(name, config))
}
