//! Exposes the command line application.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use drivegate_service::config::Config;
use drivegate_service::metrics;

use crate::logging;
use crate::server;

/// Drivegate commands.
#[derive(Subcommand)]
enum Command {
    /// Run the web server.
    #[command(name = "run")]
    Run,
}

/// Command line interface parser.
#[derive(Parser)]
#[command(bin_name = "drivegate", version)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long = "config", short = 'c', global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: Some(concat!("drivegate@", env!("CARGO_PKG_VERSION")).into()),
        session_mode: sentry::SessionMode::Request,
        auto_session_tracking: false,
        traces_sample_rate: config.traces_sample_rate,
        ..Default::default()
    });

    // SAFETY: We are still single-threaded, the runtime is only started by `server::run`.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();
        if let Some(tag) = config.metrics.hostname_tag.clone() {
            if let Some(name) = hostname::get().ok().and_then(|s| s.into_string().ok()) {
                tags.insert(tag, name);
            }
        }
        metrics::configure_statsd(&config.metrics.prefix, statsd, tags)
            .context("failed to configure statsd")?;
    }

    match cli.command {
        Command::Run => server::run(config).context("failed to start the server")?,
    }

    Ok(())
}
