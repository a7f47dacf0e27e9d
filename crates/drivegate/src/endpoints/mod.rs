use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::header::{HeaderMap, HeaderValue, VARY};
use axum::routing::get;
use drivegate_service::metric;
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use tower::ServiceBuilder;

use crate::service::GatewayService;

mod error;
mod function;
mod listing;
mod methods;
mod metrics;
mod negotiate;
mod serve;
mod static_file;

pub use error::ResponseError;
use metrics::MetricsLayer;
use serve::serve;

/// Static content differs by these request headers.
fn set_vary(headers: &mut HeaderMap) {
    headers.insert(
        VARY,
        HeaderValue::from_static("Accept, Accept-Encoding, Range"),
    );
}

pub async fn healthcheck() -> &'static str {
    metric!(counter("healthcheck") += 1);
    "ok"
}

pub fn create_app(service: GatewayService) -> Router {
    // The layers here go "top to bottom" according to the reading order here.
    let layer = ServiceBuilder::new()
        .layer(NewSentryLayer::new_from_top())
        .layer(SentryHttpLayer::new().enable_transaction())
        .layer(MetricsLayer)
        .layer(DefaultBodyLimit::max(function::MAX_BODY_SIZE));
    Router::new()
        .fallback(serve)
        .with_state(service)
        .layer(layer)
        // the healthcheck is last, as it will bypass all the middlewares
        .route("/healthcheck", get(healthcheck))
}

#[cfg(test)]
mod tests {
    use axum::http::{Request, StatusCode};

    use super::*;
    use crate::test::{self, MockOrigin, body_string, send};

    #[tokio::test]
    async fn test_healthcheck() {
        test::setup();
        let origin = MockOrigin::empty();
        let app = test::app(&origin);

        // answered without a host and without consulting the origin
        let response = send(&app, Request::get("/healthcheck")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "ok");
        assert_eq!(origin.children_calls(), 0);
    }
}
