//! Per-site configuration, read from `<host>.json` files in the origin's root folder.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;

use crate::caching::{CacheContents, CacheError, MemoryCache, memory_cache};
use crate::config::{InMemoryCacheConfig, SiteDefaults};
use crate::origin::{DrivePaths, Origin, RemoteEntry};
use crate::routes::{Hooks, RouteError, RouteTable};

/// The hook consulted when a request doesn't resolve to anything.
pub const NOT_FOUND_HOOK: &str = "notFound";

/// The settings of a single site.
///
/// Resolutions work on an immutable snapshot, a site changing its configuration file only
/// affects requests that start after the new configuration was loaded.
#[derive(Clone)]
pub struct SiteConfig {
    /// Site paths of pages served for error statuses.
    pub custom_errors: BTreeMap<u16, String>,
    pub dir_listing: bool,
    pub routes: RouteTable,
    pub hooks: Hooks,
    pub functions: bool,
    /// Environment variables handed to the functions of this site.
    pub functions_env: BTreeMap<String, String>,
    pub functions_pattern: Regex,
    /// Extension tried for a function when nothing exists at the requested path.
    pub functions_auto_extension: Option<String>,
    /// Extension tried for static content when nothing exists at the requested path.
    pub auto_extension: Option<String>,
}

impl fmt::Debug for SiteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SiteConfig")
            .field("custom_errors", &self.custom_errors)
            .field("dir_listing", &self.dir_listing)
            .field("routes", &self.routes)
            .field("hooks", &self.hooks)
            .field("functions", &self.functions)
            .field("functions_env", &self.functions_env.keys())
            .field("functions_pattern", &self.functions_pattern.as_str())
            .field("functions_auto_extension", &self.functions_auto_extension)
            .field("auto_extension", &self.auto_extension)
            .finish()
    }
}

/// The contents of a site configuration file. Everything left out keeps its default.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct SiteConfigFile {
    custom_errors: Option<BTreeMap<u16, String>>,
    dir_listing: Option<bool>,
    routes: Option<Vec<(String, String)>>,
    hooks: Option<BTreeMap<String, Vec<(String, String)>>>,
    functions: Option<bool>,
    functions_env: Option<BTreeMap<String, String>>,
    functions_pattern: Option<String>,
    functions_auto_extension: Option<String>,
    auto_extension: Option<String>,
}

fn compile_pattern(pattern: &str) -> Result<Regex, RouteError> {
    Regex::new(pattern).map_err(|source| RouteError::InvalidPattern {
        pattern: pattern.to_owned(),
        source,
    })
}

fn compile_table(pairs: &[(String, String)]) -> Result<RouteTable, RouteError> {
    RouteTable::compile(pairs.iter().map(|(p, t)| (p.as_str(), t.as_str())))
}

fn malformed(err: RouteError) -> CacheError {
    let message = match std::error::Error::source(&err) {
        Some(source) => format!("{err}: {source}"),
        None => err.to_string(),
    };
    CacheError::Malformed(message)
}

impl SiteConfig {
    /// The configuration of a site without a configuration file.
    pub fn from_defaults(defaults: &SiteDefaults) -> Result<Self, RouteError> {
        Ok(Self {
            custom_errors: BTreeMap::new(),
            dir_listing: defaults.dir_listing,
            routes: RouteTable::default(),
            hooks: Hooks::new(),
            functions: defaults.functions,
            functions_env: BTreeMap::new(),
            functions_pattern: compile_pattern(&defaults.functions_pattern)?,
            functions_auto_extension: None,
            auto_extension: None,
        })
    }

    /// Applies a JSON configuration file on top of `self`.
    pub fn merge_json(&self, json: &[u8]) -> CacheContents<Self> {
        let file: SiteConfigFile =
            serde_json::from_slice(json).map_err(|err| CacheError::Malformed(err.to_string()))?;

        let mut config = self.clone();
        if let Some(custom_errors) = file.custom_errors {
            config.custom_errors = custom_errors;
        }
        if let Some(dir_listing) = file.dir_listing {
            config.dir_listing = dir_listing;
        }
        if let Some(routes) = file.routes {
            config.routes = compile_table(&routes).map_err(malformed)?;
        }
        if let Some(hooks) = file.hooks {
            config.hooks = hooks
                .iter()
                .map(|(name, pairs)| Ok((name.clone(), compile_table(pairs)?)))
                .collect::<Result<_, RouteError>>()
                .map_err(malformed)?;
        }
        if let Some(functions) = file.functions {
            config.functions = functions;
        }
        if let Some(functions_env) = file.functions_env {
            config.functions_env = functions_env;
        }
        if let Some(pattern) = file.functions_pattern {
            config.functions_pattern = compile_pattern(&pattern).map_err(malformed)?;
        }
        if file.functions_auto_extension.is_some() {
            config.functions_auto_extension = file.functions_auto_extension;
        }
        if file.auto_extension.is_some() {
            config.auto_extension = file.auto_extension;
        }

        Ok(config)
    }

    /// Whether the file at `path` is executed rather than served.
    pub fn should_exec(&self, path: &str) -> bool {
        self.functions && self.functions_pattern.is_match(path)
    }

    pub fn not_found_hook(&self) -> Option<&RouteTable> {
        self.hooks.get(NOT_FOUND_HOOK)
    }

    /// The site path of the custom page for `status`, if any.
    pub fn custom_error(&self, status: u16) -> Option<&str> {
        self.custom_errors.get(&status).map(String::as_str)
    }
}

/// Provides the [`SiteConfig`] of a host.
#[async_trait]
pub trait SiteConfigProvider: Send + Sync + 'static {
    async fn get_site_config(&self, host: &str) -> CacheContents<Arc<SiteConfig>>;
}

/// Loads site configurations from the origin.
///
/// The root folder listing and the parsed configurations are cached separately, so a burst of
/// requests for new hosts lists the root folder only once.
#[derive(Clone)]
pub struct OriginSiteConfigs {
    origin: Arc<dyn Origin>,
    root_children_path: String,
    base: Arc<SiteConfig>,
    root_listing: MemoryCache<Arc<[RemoteEntry]>>,
    configs: MemoryCache<Arc<SiteConfig>>,
}

impl OriginSiteConfigs {
    pub fn new(
        origin: Arc<dyn Origin>,
        paths: &DrivePaths,
        defaults: &SiteDefaults,
        cache_config: &InMemoryCacheConfig,
    ) -> Result<Self, RouteError> {
        let listing_config = InMemoryCacheConfig {
            max_capacity: 1,
            ..*cache_config
        };

        Ok(Self {
            origin,
            root_children_path: paths.root_children_path(),
            base: Arc::new(SiteConfig::from_defaults(defaults)?),
            root_listing: memory_cache("root_listing", &listing_config),
            configs: memory_cache("site_config", cache_config),
        })
    }

    async fn root_listing(&self) -> CacheContents<Arc<[RemoteEntry]>> {
        let origin = Arc::clone(&self.origin);
        let path = self.root_children_path.clone();

        self.root_listing
            .get_or_compute(&("root",), move || async move {
                match origin.fetch_children(&path).await? {
                    Some(entries) => Ok(entries.into()),
                    None => {
                        tracing::error!(%path, "Root folder not found");
                        Err(CacheError::DownloadError(format!(
                            "root folder not found: {path}"
                        )))
                    }
                }
            })
            .await
    }

    async fn load(&self, host: &str) -> CacheContents<Arc<SiteConfig>> {
        let listing = self.root_listing().await?;
        let name = format!("{host}.json");

        let Some(file) = listing.iter().find(|e| e.is_file() && e.name == name) else {
            tracing::trace!(host, "No site configuration, using defaults");
            return Ok(Arc::clone(&self.base));
        };

        let json = self.origin.download(file).await?;
        let config = self.base.merge_json(&json).inspect_err(|err| {
            tracing::warn!(
                host,
                error = err as &dyn std::error::Error,
                "Invalid site configuration"
            );
        })?;
        Ok(Arc::new(config))
    }
}

#[async_trait]
impl SiteConfigProvider for OriginSiteConfigs {
    async fn get_site_config(&self, host: &str) -> CacheContents<Arc<SiteConfig>> {
        let this = self.clone();
        let owned_host = host.to_owned();

        self.configs
            .get_or_compute(&(host,), move || async move { this.load(&owned_host).await })
            .await
    }
}
