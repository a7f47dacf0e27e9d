use std::net::SocketAddr;

use anyhow::{Context, Result};
use drivegate_service::config::Config;
use drivegate_service::metric;

use crate::endpoints;
use crate::service::GatewayService;

/// Starts the HTTP server based on the loaded config.
pub fn run(config: Config) -> Result<()> {
    // Log this metric before actually starting the server. This allows to see restarts even if
    // service creation fails.
    metric!(counter("server.starting") += 1);

    let megs = 1024 * 1024;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("drivegate-web")
        .enable_all()
        .thread_stack_size(8 * megs)
        .build()?;

    let service = GatewayService::create(&config).context("failed to create service state")?;
    let socket = config.bind.parse::<SocketAddr>()?;

    runtime.block_on(async {
        let _pruning = service.spawn_pruning(config.caches.handlers.prune_interval);

        tracing::info!("Starting HTTP server on {}", socket);
        axum_server::bind(socket)
            .serve(endpoints::create_app(service).into_make_service())
            .await
    })?;
    tracing::info!("System shutdown complete");

    Ok(())
}
