//! The state shared by all request handlers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::HeaderValue;
use drivegate_service::config::Config;
use drivegate_service::functions::{FunctionRuntime, FunctionService, ProcessRuntime};
use drivegate_service::origin::{DrivePaths, GraphOrigin, Origin};
use drivegate_service::resolver::UriResolver;
use drivegate_service::sites::{OriginSiteConfigs, SiteConfigProvider};
use drivegate_service::utils::http::create_client;

/// The underlying service for the HTTP request handlers.
#[derive(Clone)]
pub struct GatewayService {
    inner: Arc<GatewayServiceInner>,
}

impl std::fmt::Debug for GatewayService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayService")
            .field("paths", self.inner.resolver.paths())
            .finish_non_exhaustive()
    }
}

struct GatewayServiceInner {
    origin: Arc<dyn Origin>,
    resolver: UriResolver,
    sites: Arc<dyn SiteConfigProvider>,
    functions: FunctionService,
    cache_control: HeaderValue,
}

impl GatewayService {
    /// Creates a service talking to the drive configured in `config`.
    pub fn create(config: &Config) -> Result<Self> {
        let client = create_client(&config.origin)?;
        let origin: Arc<dyn Origin> = Arc::new(GraphOrigin::new(client, &config.origin)?);
        let paths = DrivePaths::new(&config.origin.root);

        let sites = OriginSiteConfigs::new(
            Arc::clone(&origin),
            &paths,
            &config.defaults,
            &config.caches.site_config,
        )
        .context("invalid site defaults")?;
        let runtime = ProcessRuntime::new(&config.functions)?;

        Self::with_parts(config, origin, paths, Arc::new(sites), Arc::new(runtime))
    }

    /// Creates a service from its collaborators, using `config` for everything else.
    pub fn with_parts(
        config: &Config,
        origin: Arc<dyn Origin>,
        paths: DrivePaths,
        sites: Arc<dyn SiteConfigProvider>,
        runtime: Arc<dyn FunctionRuntime>,
    ) -> Result<Self> {
        let resolver = UriResolver::new(
            Arc::clone(&origin),
            paths,
            &config.caches,
            &config.defaults,
        )?;
        let functions = FunctionService::new(
            Arc::clone(&origin),
            runtime,
            &config.exec,
            &config.functions,
            &config.caches.handlers,
        )
        .context("invalid function execution settings")?;
        let cache_control = HeaderValue::from_str(&config.defaults.cache_control)
            .context("invalid Cache-Control default")?;

        Ok(Self {
            inner: Arc::new(GatewayServiceInner {
                origin,
                resolver,
                sites,
                functions,
                cache_control,
            }),
        })
    }

    pub fn origin(&self) -> &dyn Origin {
        self.inner.origin.as_ref()
    }

    pub fn resolver(&self) -> &UriResolver {
        &self.inner.resolver
    }

    pub fn sites(&self) -> &dyn SiteConfigProvider {
        self.inner.sites.as_ref()
    }

    pub fn functions(&self) -> &FunctionService {
        &self.inner.functions
    }

    /// The `Cache-Control` value of static files and listings.
    pub fn cache_control(&self) -> &HeaderValue {
        &self.inner.cache_control
    }

    /// Periodically sweeps expired function handlers on the current runtime.
    pub fn spawn_pruning(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let handlers = self.functions().handlers().clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                handlers.prune();
                tracing::debug!(remaining = handlers.entry_count(), "Pruned function handlers");
            }
        })
    }
}
