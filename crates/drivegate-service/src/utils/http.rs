use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::OriginConfig;

/// Creates the [`reqwest::Client`] used to talk to the origin.
///
/// Only the connection phase is bounded here. Metadata requests carry their own timeout while
/// content bodies are streamed to the client for as long as they take.
pub fn create_client(config: &OriginConfig) -> Result<reqwest::Client> {
    reqwest::ClientBuilder::new()
        .connect_timeout(config.connect_timeout)
        .pool_idle_timeout(Duration::from_secs(30))
        .build()
        .context("failed to build the origin HTTP client")
}
