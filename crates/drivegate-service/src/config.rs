use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for the gateway.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A tag name to report the hostname to, for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "drivegate".into(),
            hostname_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Connection settings for the cloud drive that backs every site.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct OriginConfig {
    /// Base URL of the drive API, without a trailing slash.
    pub api_url: String,
    /// Base URL of the OAuth token endpoint. The tenant id is appended to it.
    pub login_url: String,
    /// The OAuth scope requested for client-credential tokens.
    pub scope: String,
    /// Directory tenant. Falls back to the `TENANT_ID` environment variable.
    pub tenant_id: Option<String>,
    /// Falls back to the `CLIENT_ID` environment variable.
    pub client_id: Option<String>,
    /// Falls back to the `CLIENT_SECRET` environment variable.
    pub client_secret: Option<String>,
    /// Drive path under which every site lives as a folder named after its host.
    ///
    /// Site configuration files (`<host>.json`) are read from this folder as well.
    pub root: String,
    /// The timeout for establishing a connection to the origin.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// The timeout for a whole origin request, excluding streamed content bodies.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for OriginConfig {
    fn default() -> Self {
        OriginConfig {
            api_url: "https://graph.microsoft.com/v1.0".into(),
            login_url: "https://login.microsoftonline.com".into(),
            scope: "https://graph.microsoft.com/.default".into(),
            tenant_id: env::var("TENANT_ID").ok(),
            client_id: env::var("CLIENT_ID").ok(),
            client_secret: env::var("CLIENT_SECRET").ok(),
            root: "/me/drive/root:/sites".into(),
            connect_timeout: Duration::from_secs(5),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Size and lifetime of a plain in-memory cache.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct InMemoryCacheConfig {
    /// Maximum number of entries.
    pub max_capacity: u64,
    /// Maximum duration since insertion.
    #[serde(with = "humantime_serde")]
    pub time_to_live: Duration,
}

impl InMemoryCacheConfig {
    const fn new(max_capacity: u64, time_to_live: Duration) -> Self {
        Self {
            max_capacity,
            time_to_live,
        }
    }
}

impl Default for InMemoryCacheConfig {
    fn default() -> Self {
        Self::new(100, Duration::from_secs(30))
    }
}

/// Settings of the stale-while-revalidate cache holding prepared function handlers.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct HandlerCacheConfig {
    /// Maximum number of prepared handlers.
    pub max: u64,
    /// Handlers older than this are dropped instead of being revalidated.
    #[serde(with = "humantime_serde")]
    pub max_age: Duration,
    /// Handlers older than this are checked against the origin in the background.
    #[serde(with = "humantime_serde")]
    pub revalidate_after: Duration,
    /// How often expired handlers are swept.
    #[serde(with = "humantime_serde")]
    pub prune_interval: Duration,
}

impl Default for HandlerCacheConfig {
    fn default() -> Self {
        Self {
            max: 500,
            max_age: Duration::from_secs(15 * 60),
            revalidate_after: Duration::from_secs(60),
            prune_interval: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct CacheConfigs {
    /// Item metadata, including negative lookups.
    pub meta: InMemoryCacheConfig,
    /// Folder listings.
    pub children: InMemoryCacheConfig,
    /// Parsed site configurations and the root listing they are found in.
    pub site_config: InMemoryCacheConfig,
    /// Prepared function handlers.
    pub handlers: HandlerCacheConfig,
}

impl Default for CacheConfigs {
    fn default() -> Self {
        Self {
            meta: InMemoryCacheConfig::default(),
            children: InMemoryCacheConfig::default(),
            site_config: InMemoryCacheConfig::new(100, Duration::from_secs(60)),
            handlers: HandlerCacheConfig::default(),
        }
    }
}

/// Admission control for function executions.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct ExecConfig {
    /// Number of functions that may run at the same time. Must be positive.
    pub max_concurrent: usize,
    /// Number of requests that may wait for a slot. `0` disables waiting altogether.
    pub max_queue: usize,
    /// How long a request waits for a slot. `0s` means it never waits.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Upper bound for a single execution once it was granted a slot.
    #[serde(with = "humantime_serde")]
    pub max_duration: Option<Duration>,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_queue: 100,
            timeout: Duration::from_secs(10),
            max_duration: None,
        }
    }
}

/// The child-process function runtime.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FunctionsConfig {
    /// Interpreter invoked with the path of the function source as its last argument.
    pub command: Vec<String>,
    /// Host environment variables passed through to functions.
    pub allowed_env: Vec<String>,
    /// Where function sources are written to. Defaults to the system temp dir.
    pub temp_dir: Option<PathBuf>,
}

impl Default for FunctionsConfig {
    fn default() -> Self {
        Self {
            command: vec!["node".into()],
            allowed_env: [
                "HOME", "HOSTNAME", "LANG", "LC_CTYPE", "LOGNAME", "MAIL", "PATH", "PWD", "SHELL",
                "TERM", "USER",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            temp_dir: None,
        }
    }
}

/// Values applied to every site before its own configuration file is merged on top.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SiteDefaults {
    /// Names that are served for a folder, matched case-insensitively.
    pub index_pattern: String,
    /// Names that are never served and never used as an index.
    pub protected_files: Vec<String>,
    /// Names that are left out of directory listings.
    pub hidden_files: Vec<String>,
    pub functions_pattern: String,
    pub functions: bool,
    pub dir_listing: bool,
    /// `Cache-Control` sent along with static files and listings.
    pub cache_control: String,
}

impl Default for SiteDefaults {
    fn default() -> Self {
        Self {
            index_pattern: r"^index\.(html|htm|txt|js)$".into(),
            protected_files: vec![r"\.swp$".into()],
            hidden_files: vec![r"^\.".into()],
            functions_pattern: r"\.js$".into(),
            functions: false,
            dir_listing: true,
            cache_control: "public, max-age=30, must-revalidate, s-maxage=30, stale-while-revalidate"
                .into(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Host and port to bind the HTTP webserver to.
    pub bind: String,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// The sample rate for Sentry traces. (0.0 - 1.0, defaults to 0.05)
    pub traces_sample_rate: f32,

    /// The cloud drive every file, folder and site configuration is read from.
    pub origin: OriginConfig,

    /// Fine-tune the in-memory caches.
    pub caches: CacheConfigs,

    /// Bounds concurrent function executions.
    pub exec: ExecConfig,

    pub functions: FunctionsConfig,

    /// Site settings used when a site doesn't override them.
    pub defaults: SiteDefaults,
}

fn is_docker() -> bool {
    if fs::metadata("/.dockerenv").is_ok() {
        return true;
    }

    fs::read_to_string("/proc/self/cgroup")
        .map(|s| s.contains("/docker"))
        .unwrap_or(false)
}

/// Default value for the "bind" configuration.
fn default_bind() -> String {
    if is_docker() {
        "0.0.0.0:3000".to_owned()
    } else {
        "127.0.0.1:3000".to_owned()
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind: default_bind(),
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            traces_sample_rate: 0.05,
            origin: OriginConfig::default(),
            caches: CacheConfigs::default(),
            exec: ExecConfig::default(),
            functions: FunctionsConfig::default(),
            defaults: SiteDefaults::default(),
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
