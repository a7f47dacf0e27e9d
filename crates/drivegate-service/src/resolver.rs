//! Resolution of a request host and path into what should be served for it.

use std::sync::Arc;

use anyhow::Context;
use regex::{Regex, RegexBuilder};

use crate::caching::{CacheContents, CacheError, MemoryCache, memory_cache};
use crate::config::{CacheConfigs, SiteDefaults};
use crate::origin::{DrivePaths, Origin, OriginMeta, RemoteEntry};
use crate::routes::{RoutedPath, normalize_path};
use crate::sites::SiteConfig;

/// What a request resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// A file served as-is.
    Static { file: Arc<RemoteEntry> },
    /// A folder without an index file, listed with hidden and protected entries left out.
    Directory {
        pathname: String,
        entries: Vec<RemoteEntry>,
    },
    /// A file executed as a function. `url` is the path and query the function is invoked with.
    Function { file: Arc<RemoteEntry>, url: String },
    NotFound,
    /// The path cannot be expressed on the origin.
    InvalidPath,
}

/// Turns request paths into [`Resolution`]s, looking metadata up on the origin.
///
/// Metadata and folder listings are held in coalescing caches, including negative lookups, so
/// concurrent requests for the same path cost a single origin round trip.
#[derive(Clone)]
pub struct UriResolver {
    origin: Arc<dyn Origin>,
    paths: DrivePaths,
    meta: MemoryCache<Option<Arc<RemoteEntry>>>,
    children: MemoryCache<Option<Arc<[RemoteEntry]>>>,
    index_pattern: Regex,
    protected_files: Vec<Regex>,
    hidden_files: Vec<Regex>,
}

fn compile_all(patterns: &[String]) -> anyhow::Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| Regex::new(p).with_context(|| format!("invalid file pattern `{p}`")))
        .collect()
}

impl UriResolver {
    pub fn new(
        origin: Arc<dyn Origin>,
        paths: DrivePaths,
        caches: &CacheConfigs,
        defaults: &SiteDefaults,
    ) -> anyhow::Result<Self> {
        let index_pattern = RegexBuilder::new(&defaults.index_pattern)
            .case_insensitive(true)
            .build()
            .context("invalid index pattern")?;

        Ok(Self {
            origin,
            paths,
            meta: memory_cache("meta", &caches.meta),
            children: memory_cache("children", &caches.children),
            index_pattern,
            protected_files: compile_all(&defaults.protected_files)?,
            hidden_files: compile_all(&defaults.hidden_files)?,
        })
    }

    pub fn paths(&self) -> &DrivePaths {
        &self.paths
    }

    fn is_protected(&self, name: &str) -> bool {
        let name = name.to_lowercase();
        self.protected_files.iter().any(|re| re.is_match(&name))
    }

    fn is_hidden(&self, name: &str) -> bool {
        let name = name.to_lowercase();
        self.hidden_files.iter().any(|re| re.is_match(&name)) || self.is_protected(&name)
    }

    fn is_index(&self, entry: &RemoteEntry) -> bool {
        entry.is_file() && self.index_pattern.is_match(&entry.name) && !self.is_protected(&entry.name)
    }

    /// Looks up the metadata at `meta_path`, `None` if there is no such item.
    pub async fn meta(&self, meta_path: &str) -> CacheContents<Option<Arc<RemoteEntry>>> {
        let origin = Arc::clone(&self.origin);
        let path = meta_path.to_owned();

        self.meta
            .get_or_compute(&(meta_path,), move || async move {
                match origin.fetch_meta(&path, None).await? {
                    OriginMeta::Found(entry) => Ok(Some(Arc::new(entry))),
                    OriginMeta::Absent => Ok(None),
                    OriginMeta::NotModified => Err(CacheError::Malformed(
                        "unconditional lookup answered as not modified".into(),
                    )),
                }
            })
            .await
    }

    /// Lists the folder at `meta_path`, `None` if it vanished.
    pub async fn children(&self, meta_path: &str) -> CacheContents<Option<Arc<[RemoteEntry]>>> {
        let origin = Arc::clone(&self.origin);
        let path = DrivePaths::children_path(meta_path);

        self.children
            .get_or_compute(&(meta_path,), move || async move {
                Ok(origin.fetch_children(&path).await?.map(Into::into))
            })
            .await
    }

    /// Resolves the request `uri` (path and query) of `host` using the site configuration.
    pub async fn resolve(
        &self,
        host: &str,
        uri: &str,
        site: &SiteConfig,
    ) -> CacheContents<Resolution> {
        let routed = site.routes.find_route(uri);
        let Some(meta_path) = self.paths.meta_path(host, &routed.pathname) else {
            return Ok(Resolution::InvalidPath);
        };

        let resolution = match self.meta(&meta_path).await? {
            Some(entry) => self.dispatch(entry, &meta_path, &routed, uri, site).await?,
            None => self.resolve_missing(host, uri, &routed, site).await?,
        };

        tracing::trace!(host, uri, ?resolution, "Resolved request");
        Ok(resolution)
    }

    /// Dispatches an existing item found at `routed`.
    async fn dispatch(
        &self,
        entry: Arc<RemoteEntry>,
        meta_path: &str,
        routed: &RoutedPath,
        uri: &str,
        site: &SiteConfig,
    ) -> CacheContents<Resolution> {
        let pathname = &routed.pathname;

        if !entry.is_folder() {
            if self.is_protected(&entry.name) {
                return Ok(Resolution::NotFound);
            }
            let combined = format!("{pathname}/{}", entry.name);
            return Ok(self.file_resolution(entry, &combined, routed, uri, site));
        }

        let Some(children) = self.children(meta_path).await? else {
            return Ok(Resolution::NotFound);
        };

        if let Some(index) = children.iter().find(|e| self.is_index(e)) {
            let index_path = format!("{pathname}/{}", index.name);
            let index = Arc::new(index.clone());
            return Ok(self.file_resolution(index, &index_path, routed, uri, site));
        }

        if !site.dir_listing {
            return Ok(Resolution::NotFound);
        }

        let entries = children
            .iter()
            .filter(|e| !self.is_hidden(&e.name))
            .cloned()
            .collect();
        Ok(Resolution::Directory {
            pathname: pathname.clone(),
            entries,
        })
    }

    fn file_resolution(
        &self,
        file: Arc<RemoteEntry>,
        exec_path: &str,
        routed: &RoutedPath,
        uri: &str,
        site: &SiteConfig,
    ) -> Resolution {
        if site.should_exec(exec_path) {
            let url = function_url(&routed.path, uri);
            Resolution::Function { file, url }
        } else {
            Resolution::Static { file }
        }
    }

    /// Falls back to auto-extensions and the not-found hook when nothing exists at `routed`.
    async fn resolve_missing(
        &self,
        host: &str,
        uri: &str,
        routed: &RoutedPath,
        site: &SiteConfig,
    ) -> CacheContents<Resolution> {
        let pathname = &routed.pathname;

        if let Some(extension) = &site.auto_extension {
            let candidate = extended(pathname, extension);
            if let Some(meta_path) = self.paths.meta_path(host, &candidate.pathname) {
                if let Some(entry) = self.meta(&meta_path).await? {
                    return self.dispatch(entry, &meta_path, &candidate, uri, site).await;
                }
            }
        }

        if let Some(extension) = site.functions_auto_extension.as_ref().filter(|_| site.functions)
        {
            let candidate = extended(pathname, extension);
            if let Some(meta_path) = self.paths.meta_path(host, &candidate.pathname) {
                if let Some(entry) = self.meta(&meta_path).await? {
                    if entry.is_file() && site.should_exec(&candidate.pathname) {
                        let url = function_url(&candidate.path, uri);
                        return Ok(Resolution::Function { file: entry, url });
                    }
                }
            }
        }

        let Some(hook) = site.not_found_hook() else {
            return Ok(Resolution::NotFound);
        };
        let hooked = hook.find_route(uri);
        if hooked.pathname == *pathname {
            return Ok(Resolution::NotFound);
        }

        let Some(meta_path) = self.paths.meta_path(host, &hooked.pathname) else {
            return Ok(Resolution::InvalidPath);
        };
        match self.meta(&meta_path).await? {
            Some(entry) if entry.is_file() && !self.is_protected(&entry.name) => {
                Ok(self.file_resolution(entry, &hooked.pathname, &hooked, uri, site))
            }
            _ => Ok(Resolution::NotFound),
        }
    }
}

fn extended(pathname: &str, extension: &str) -> RoutedPath {
    let pathname = normalize_path(&format!("{pathname}{extension}"));
    RoutedPath {
        path: pathname.clone(),
        pathname,
    }
}

/// The URL a function is invoked with: the routed path, keeping the original query unless the
/// route brought its own.
fn function_url(routed_path: &str, uri: &str) -> String {
    let path = if routed_path.is_empty() { "/" } else { routed_path };
    if path.contains('?') {
        return path.to_owned();
    }
    match uri.split_once('?') {
        Some((_, query)) => format!("{path}?{query}"),
        None => path.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::{self, MockOrigin};

    fn resolver(origin: &Arc<MockOrigin>) -> UriResolver {
        UriResolver::new(
            origin.clone(),
            origin.paths(),
            &CacheConfigs::default(),
            &SiteDefaults::default(),
        )
        .unwrap()
    }

    fn site(json: &str) -> SiteConfig {
        SiteConfig::from_defaults(&SiteDefaults::default())
            .unwrap()
            .merge_json(json.as_bytes())
            .unwrap()
    }

    fn static_name(resolution: &Resolution) -> Option<&str> {
        match resolution {
            Resolution::Static { file } => Some(&file.name),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_static_and_index() {
        test::setup();
        let origin = MockOrigin::new();
        origin.add_file("example.com/index.html", "<h1>hi</h1>");
        origin.add_file("example.com/docs/readme.txt", "read me");
        let resolver = resolver(&origin);
        let site = site("{}");

        let root = resolver.resolve("example.com", "/", &site).await.unwrap();
        assert_eq!(static_name(&root), Some("index.html"));

        let file = resolver
            .resolve("example.com", "/docs/./readme.txt?x=1", &site)
            .await
            .unwrap();
        assert_eq!(static_name(&file), Some("readme.txt"));

        let missing = resolver.resolve("example.com", "/nope", &site).await.unwrap();
        assert_eq!(missing, Resolution::NotFound);
    }

    #[tokio::test]
    async fn test_directory_listing() {
        test::setup();
        let origin = MockOrigin::new();
        origin.add_file("example.com/docs/a.txt", "a");
        origin.add_file("example.com/docs/.secret", "s");
        origin.add_file("example.com/docs/b.txt.swp", "swap");
        origin.add_file("example.com/docs/index.html.swp", "swap");
        let resolver = resolver(&origin);

        let listing = resolver
            .resolve("example.com", "/docs/", &site("{}"))
            .await
            .unwrap();
        let Resolution::Directory { pathname, entries } = listing else {
            panic!("expected a listing, got {listing:?}");
        };
        assert_eq!(pathname, "/docs");
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["a.txt"]);

        let disabled = resolver
            .resolve("example.com", "/docs", &site(r#"{"dirListing": false}"#))
            .await
            .unwrap();
        assert_eq!(disabled, Resolution::NotFound);
    }

    #[tokio::test]
    async fn test_protected_files() {
        test::setup();
        let origin = MockOrigin::new();
        origin.add_file("example.com/notes.swp", "swap");
        let resolver = resolver(&origin);

        let resolution = resolver
            .resolve("example.com", "/notes.swp", &site("{}"))
            .await
            .unwrap();
        assert_eq!(resolution, Resolution::NotFound);
    }

    #[tokio::test]
    async fn test_invalid_path() {
        test::setup();
        let origin = MockOrigin::new();
        let resolver = resolver(&origin);

        let resolution = resolver
            .resolve("example.com", "/a:b", &site("{}"))
            .await
            .unwrap();
        assert_eq!(resolution, Resolution::InvalidPath);
        assert_eq!(origin.meta_calls(), 0);
    }

    #[tokio::test]
    async fn test_functions() {
        test::setup();
        let origin = MockOrigin::new();
        origin.add_file("example.com/api/hello.js", "fn");
        origin.add_file("example.com/app/index.js", "fn");
        origin.add_file("example.com/users.js", "fn");
        let resolver = resolver(&origin);
        let site = site(
            r#"{
                "functions": true,
                "routes": [["^/users/(?<id>[^/]*)$", "/users.js?id=$<id>"]]
            }"#,
        );

        let resolution = resolver
            .resolve("example.com", "/api/hello.js?name=x", &site)
            .await
            .unwrap();
        let Resolution::Function { file, url } = resolution else {
            panic!("expected a function, got {resolution:?}");
        };
        assert_eq!(file.name, "hello.js");
        assert_eq!(url, "/api/hello.js?name=x");

        let resolution = resolver.resolve("example.com", "/app", &site).await.unwrap();
        assert!(matches!(resolution, Resolution::Function { ref file, .. } if file.name == "index.js"));

        let resolution = resolver
            .resolve("example.com", "/users/42", &site)
            .await
            .unwrap();
        let Resolution::Function { file, url } = resolution else {
            panic!("expected a function, got {resolution:?}");
        };
        assert_eq!(file.name, "users.js");
        assert_eq!(url, "/users.js?id=42");

        // the same file is static with functions turned off
        let resolution = resolver
            .resolve("example.com", "/api/hello.js", &self::site("{}"))
            .await
            .unwrap();
        assert_eq!(static_name(&resolution), Some("hello.js"));
    }

    #[tokio::test]
    async fn test_auto_extensions() {
        test::setup();
        let origin = MockOrigin::new();
        origin.add_file("example.com/about.html", "about");
        origin.add_file("example.com/api/time.js", "fn");
        origin.add_file("example.com/both.html", "html");
        origin.add_file("example.com/both.js", "fn");
        let resolver = resolver(&origin);
        let site = site(
            r#"{
                "functions": true,
                "autoExtension": ".html",
                "functionsAutoExtension": ".js"
            }"#,
        );

        let about = resolver.resolve("example.com", "/about", &site).await.unwrap();
        assert_eq!(static_name(&about), Some("about.html"));

        let time = resolver
            .resolve("example.com", "/api/time?tz=utc", &site)
            .await
            .unwrap();
        assert_eq!(
            time,
            Resolution::Function {
                file: Arc::new(origin.entry("example.com/api/time.js")),
                url: "/api/time.js?tz=utc".into(),
            }
        );

        // content is tried before functions
        let both = resolver.resolve("example.com", "/both", &site).await.unwrap();
        assert_eq!(static_name(&both), Some("both.html"));

        // an extended path is not extended again
        let nested = resolver
            .resolve("example.com", "/about.html.html", &site)
            .await
            .unwrap();
        assert_eq!(nested, Resolution::NotFound);
    }

    #[tokio::test]
    async fn test_not_found_hook() {
        test::setup();
        let origin = MockOrigin::new();
        origin.add_file("example.com/fallback.html", "fallback");
        origin.add_file("example.com/render.js", "fn");
        let resolver = resolver(&origin);

        let site_a = site(r#"{"hooks": {"notFound": [["^/blog/.*$", "/fallback.html"]]}}"#);
        let hooked = resolver
            .resolve("example.com", "/blog/post", &site_a)
            .await
            .unwrap();
        assert_eq!(static_name(&hooked), Some("fallback.html"));

        let unhooked = resolver
            .resolve("example.com", "/other", &site_a)
            .await
            .unwrap();
        assert_eq!(unhooked, Resolution::NotFound);

        let site_b = site(
            r#"{
                "functions": true,
                "hooks": {"notFound": [["^/p/(?<slug>.*)$", "/render.js?slug=$<slug>"]]}
            }"#,
        );
        let rendered = resolver
            .resolve("example.com", "/p/hello", &site_b)
            .await
            .unwrap();
        let Resolution::Function { file, url } = rendered else {
            panic!("expected a function, got {rendered:?}");
        };
        assert_eq!(file.name, "render.js");
        assert_eq!(url, "/render.js?slug=hello");

        // hooks pointing at missing files end in not found
        let site_c = site(r#"{"hooks": {"notFound": [["^/x$", "/missing.html"]]}}"#);
        let missing = resolver.resolve("example.com", "/x", &site_c).await.unwrap();
        assert_eq!(missing, Resolution::NotFound);
    }

    #[tokio::test]
    async fn test_meta_lookups_are_cached() {
        test::setup();
        let origin = MockOrigin::new();
        origin.add_file("example.com/a.txt", "a");
        let resolver = resolver(&origin);
        let site = site("{}");

        let (a, b, c) = tokio::join!(
            resolver.resolve("example.com", "/a.txt", &site),
            resolver.resolve("example.com", "/a.txt", &site),
            resolver.resolve("example.com", "/missing", &site),
        );
        assert_eq!(static_name(&a.unwrap()), Some("a.txt"));
        assert_eq!(static_name(&b.unwrap()), Some("a.txt"));
        assert_eq!(c.unwrap(), Resolution::NotFound);

        resolver
            .resolve("example.com", "/missing", &site)
            .await
            .unwrap();
        assert_eq!(origin.meta_calls(), 2);
    }

    #[tokio::test]
    async fn test_origin_errors_propagate() {
        test::setup();
        let origin = MockOrigin::new();
        origin.add_file("example.com/a.txt", "a");
        origin.fail_meta(true);
        let resolver = resolver(&origin);

        let err = resolver
            .resolve("example.com", "/a.txt", &site("{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::DownloadError(_)));

        // failures are not cached
        origin.fail_meta(false);
        let resolution = resolver
            .resolve("example.com", "/a.txt", &site("{}"))
            .await
            .unwrap();
        assert_eq!(static_name(&resolution), Some("a.txt"));
    }

    #[test]
    fn test_function_url() {
        assert_eq!(function_url("/a.js", "/a?x=1"), "/a.js?x=1");
        assert_eq!(function_url("/a.js?id=2", "/a?x=1"), "/a.js?id=2");
        assert_eq!(function_url("", "/"), "/");
    }
}
