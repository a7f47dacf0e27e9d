//! Execution of site functions.
//!
//! Function sources live on the origin like every other file. Preparing one (downloading it and
//! handing it to the [`FunctionRuntime`]) is expensive, so prepared handlers are kept in a
//! [`FunctionHandlerCache`]. Handlers that have not been checked for a while are revalidated in
//! the background with a conditional metadata request, and are only prepared again once their
//! content actually changed.
//!
//! Invocations are bounded by an [`ExecSlotQueue`]: without a free slot, the request fails with
//! [`ExecError::Unavailable`] instead of piling up.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use thiserror::Error;

use crate::caching::{
    CacheContents, CacheError, CacheKey, CoalescingCache, PendingComputation, Revalidator,
    SwrCache, SwrConfig, SwrConfigError,
};
use crate::config::{ExecConfig, FunctionsConfig, HandlerCacheConfig};
use crate::exec::{ExecQueueError, ExecSlotQueue};
use crate::origin::{DrivePaths, Origin, OriginMeta, RemoteEntry};
use crate::sites::SiteConfig;

mod runtime;

pub use runtime::{
    FunctionHandler, FunctionRequest, FunctionResponse, FunctionRuntime, ProcessRuntime,
};

/// Errors of a function execution.
#[derive(Debug, Error)]
pub enum ExecError {
    /// No execution slot could be acquired.
    #[error("no execution slot available")]
    Unavailable,
    #[error("function did not finish within {0:?}")]
    Timeout(Duration),
    #[error("failed to prepare function")]
    Prepare(#[source] CacheError),
    #[error("function failed: {0}")]
    Failed(String),
    #[error("failed to run function")]
    Io(#[from] std::io::Error),
}

/// Where a prepared handler came from, recorded to revalidate it later.
#[derive(Debug, Clone)]
pub struct HandlerSource {
    pub drive_id: String,
    pub id: String,
    /// The entity tag of the item the handler was prepared from.
    pub etag: String,
    pub env: BTreeMap<String, String>,
}

/// A function ready to be invoked.
#[derive(Clone)]
pub struct PreparedHandler {
    pub handler: Arc<dyn FunctionHandler>,
    pub source: HandlerSource,
}

impl std::fmt::Debug for PreparedHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedHandler")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

type HandlerComputation = PendingComputation<Arc<PreparedHandler>>;

/// Downloads and prepares function sources.
#[derive(Clone)]
struct HandlerLoader {
    origin: Arc<dyn Origin>,
    runtime: Arc<dyn FunctionRuntime>,
}

impl HandlerLoader {
    async fn prepare(
        &self,
        file: &RemoteEntry,
        env: BTreeMap<String, String>,
    ) -> CacheContents<Arc<PreparedHandler>> {
        tracing::debug!(name = %file.name, ctag = %file.ctag, "Preparing function");
        metric!(counter("functions.prepare") += 1);

        let source = self.origin.download(file).await?;
        let handler = self.runtime.prepare(source, env.clone()).await?;

        Ok(Arc::new(PreparedHandler {
            handler,
            source: HandlerSource {
                drive_id: file.drive_id.clone(),
                id: file.id.clone(),
                etag: file.etag.clone(),
                env,
            },
        }))
    }
}

struct HandlerRevalidator {
    loader: HandlerLoader,
}

impl Revalidator<HandlerComputation> for HandlerRevalidator {
    fn revalidate(
        &self,
        key: &CacheKey,
        value: &HandlerComputation,
    ) -> BoxFuture<'static, CacheContents<Option<HandlerComputation>>> {
        let loader = self.loader.clone();
        let key = key.clone();
        let existing = value.clone();

        async move {
            let prepared = match existing.get().await {
                Ok(prepared) => prepared,
                Err(err) => {
                    tracing::warn!(
                        %key,
                        error = &err as &dyn std::error::Error,
                        "No handler to revalidate"
                    );
                    return Ok(Some(existing));
                }
            };

            let source = &prepared.source;
            let path = DrivePaths::item_path(&source.drive_id, &source.id);
            match loader.origin.fetch_meta(&path, Some(source.etag.as_str())).await? {
                OriginMeta::NotModified => Ok(Some(existing)),
                OriginMeta::Found(file) if file.etag == source.etag => Ok(Some(existing)),
                OriginMeta::Found(file) => {
                    tracing::debug!(%key, "Function changed, preparing it again");
                    let fresh = loader.prepare(&file, source.env.clone()).await?;
                    Ok(Some(PendingComputation::resolved(Ok(fresh))))
                }
                OriginMeta::Absent => Ok(None),
            }
        }
        .boxed()
    }

    fn dispose(&self, key: &CacheKey, _value: &HandlerComputation) {
        tracing::trace!(%key, "Disposing of function handler");
        metric!(counter("functions.handlers.disposed") += 1);
    }
}

/// Prepared handlers keyed by the identity of their source file and the site environment.
///
/// Concurrent requests for a handler that is not prepared yet share a single preparation.
#[derive(Clone)]
pub struct FunctionHandlerCache {
    loader: HandlerLoader,
    cache: CoalescingCache<Arc<PreparedHandler>, SwrCache<HandlerComputation>>,
}

impl FunctionHandlerCache {
    pub fn new(
        origin: Arc<dyn Origin>,
        runtime: Arc<dyn FunctionRuntime>,
        config: &HandlerCacheConfig,
    ) -> Result<Self, SwrConfigError> {
        let loader = HandlerLoader { origin, runtime };
        let swr_config = SwrConfig {
            max: config.max,
            max_age: config.max_age,
            revalidate_after: config.revalidate_after,
        };
        let revalidator = HandlerRevalidator {
            loader: loader.clone(),
        };
        let store = SwrCache::new("handlers", swr_config, revalidator)?;

        Ok(Self {
            loader,
            cache: CoalescingCache::new("handlers", store),
        })
    }

    /// Returns the handler for `file`, preparing it in the background if needed.
    ///
    /// The preparation keeps running when the returned computation is dropped.
    pub fn get_handler(
        &self,
        file: &RemoteEntry,
        env: BTreeMap<String, String>,
    ) -> CacheContents<HandlerComputation> {
        let key = CacheKey::from_args(&(&file.drive_id, &file.id, &env))?;
        let loader = self.loader.clone();
        let file = file.clone();

        Ok(self
            .cache
            .get_or_compute_key(key, move || async move { loader.prepare(&file, env).await }))
    }

    /// Sweeps expired handlers.
    pub fn prune(&self) {
        self.cache.store().prune();
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.store().entry_count()
    }
}

/// Errors creating a [`FunctionService`].
#[derive(Debug, Error)]
pub enum FunctionServiceError {
    #[error(transparent)]
    Queue(#[from] ExecQueueError),
    #[error(transparent)]
    HandlerCache(#[from] SwrConfigError),
}

/// Executes functions with admission control.
#[derive(Clone)]
pub struct FunctionService {
    handlers: FunctionHandlerCache,
    queue: ExecSlotQueue,
    max_duration: Option<Duration>,
    /// Host environment variables every function sees.
    host_env: BTreeMap<String, String>,
}

impl FunctionService {
    pub fn new(
        origin: Arc<dyn Origin>,
        runtime: Arc<dyn FunctionRuntime>,
        exec: &ExecConfig,
        functions: &FunctionsConfig,
        handlers: &HandlerCacheConfig,
    ) -> Result<Self, FunctionServiceError> {
        Ok(Self {
            handlers: FunctionHandlerCache::new(origin, runtime, handlers)?,
            queue: ExecSlotQueue::from_config(exec)?,
            max_duration: exec.max_duration,
            host_env: allowed_env(&functions.allowed_env, std::env::vars()),
        })
    }

    pub fn handlers(&self) -> &FunctionHandlerCache {
        &self.handlers
    }

    pub fn queue(&self) -> &ExecSlotQueue {
        &self.queue
    }

    /// The environment functions of `site` run with.
    fn env_for(&self, site: &SiteConfig) -> BTreeMap<String, String> {
        let mut env = self.host_env.clone();
        env.extend(
            site.functions_env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        env
    }

    /// Invokes the function in `file` with `request`.
    ///
    /// The handler is prepared while waiting for an execution slot. The slot is released on
    /// every exit path, including cancellation of the returned future.
    pub async fn execute(
        &self,
        request: FunctionRequest,
        site: &SiteConfig,
        file: &RemoteEntry,
    ) -> Result<FunctionResponse, ExecError> {
        let handler = self
            .handlers
            .get_handler(file, self.env_for(site))
            .map_err(ExecError::Prepare)?;

        let Some(slot) = self.queue.get_exec_slot().await else {
            metric!(counter("functions.rejected") += 1);
            return Err(ExecError::Unavailable);
        };

        let prepared = handler.get().await.map_err(ExecError::Prepare)?;
        let invocation = prepared.handler.invoke(request);

        let result = match self.max_duration {
            Some(max_duration) => tokio::time::timeout(max_duration, invocation)
                .await
                .unwrap_or(Err(ExecError::Timeout(max_duration))),
            None => invocation.await,
        };

        self.queue.release_exec_slot(slot);
        metric!(counter("functions.executed") += 1, "status" => if result.is_ok() { "ok" } else { "err" });
        result
    }
}

/// Picks the variables named in `allowed` out of `vars`.
fn allowed_env<I>(allowed: &[String], vars: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    vars.into_iter()
        .filter(|(key, _)| allowed.contains(key))
        .collect()
}
