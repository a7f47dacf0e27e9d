//! Helpers for testing the web server.
//!
//! In every test, call [`setup`] first. Apps built here serve sites from a [`MockOrigin`], use
//! the [`MockRuntime`] for functions and are driven without binding a socket, see [`send`].

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::request::Builder;
use axum::response::Response;
use drivegate_service::config::Config;
use drivegate_service::sites::OriginSiteConfigs;
use tower::ServiceExt;

use crate::endpoints;
use crate::service::GatewayService;

pub use drivegate_service::test::{MOCK_DATE, MockOrigin, MockRuntime, setup};

/// Creates a [`GatewayService`] on top of the given test doubles.
pub fn service(origin: &Arc<MockOrigin>, runtime: &Arc<MockRuntime>, config: Config) -> GatewayService {
    let sites = OriginSiteConfigs::new(
        origin.clone(),
        &origin.paths(),
        &config.defaults,
        &config.caches.site_config,
    )
    .unwrap();

    GatewayService::with_parts(
        &config,
        origin.clone(),
        origin.paths(),
        Arc::new(sites),
        runtime.clone(),
    )
    .unwrap()
}

/// Creates the full app, including all middlewares, with the given configuration.
pub fn app_with(origin: &Arc<MockOrigin>, runtime: &Arc<MockRuntime>, config: Config) -> Router {
    endpoints::create_app(service(origin, runtime, config))
}

/// Creates the full app with the default configuration.
pub fn app(origin: &Arc<MockOrigin>) -> Router {
    app_with(origin, &MockRuntime::new(), Config::default())
}

/// Sends a request without a body through `app`.
pub async fn send(app: &Router, request: Builder) -> Response {
    let request = request.body(Body::empty()).unwrap();
    app.clone().oneshot(request).await.unwrap()
}

/// Collects the body of `response` into a string.
pub async fn body_string(response: Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}
