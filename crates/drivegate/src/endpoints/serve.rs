use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{HOST, SERVER};
use axum::http::request::Parts;
use axum::http::HeaderValue;
use axum::response::Response;
use drivegate_service::resolver::Resolution;
use drivegate_service::sites::SiteConfig;
use once_cell::sync::Lazy;
use regex::Regex;

use super::negotiate::{Media, negotiate};
use super::{ResponseError, function, listing, static_file};
use crate::service::GatewayService;

/// The `Server` header sent with every response.
pub const SERVER_NAME: &str = "Drivegate";

/// RFC 1123 host names.
static HOSTNAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(([a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9\-]*[a-zA-Z0-9])\.)*([A-Za-z0-9]|[A-Za-z0-9][A-Za-z0-9\-]*[A-Za-z0-9])$",
    )
    .unwrap()
});

/// The host a request is addressed to, without its port.
///
/// HTTP/2 requests carry it in the URI authority instead of a `Host` header.
fn request_host(parts: &Parts) -> Option<&str> {
    let host = match parts.headers.get(HOST) {
        Some(value) => value.to_str().ok()?,
        None => parts.uri.host()?,
    };
    let host = host.split(':').next().unwrap_or_default();
    HOSTNAME_RE.is_match(host).then_some(host)
}

/// Serves every request that is not handled by a dedicated route.
pub async fn serve(State(service): State<GatewayService>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let media = negotiate(&parts.headers);

    let mut response = match request_host(&parts) {
        Some(host) => {
            let host = host.to_owned();
            sentry::configure_scope(|scope| scope.set_tag("host", &host));
            serve_host(&service, &host, &parts, body, media).await
        }
        None => ResponseError::invalid_host().render(media),
    };

    response
        .headers_mut()
        .insert(SERVER, HeaderValue::from_static(SERVER_NAME));
    response
}

async fn serve_host(
    service: &GatewayService,
    host: &str,
    parts: &Parts,
    body: Body,
    media: Media,
) -> Response {
    let site = match service.sites().get_site_config(host).await {
        Ok(site) => site,
        Err(err) => return ResponseError::from(err).render(media),
    };

    match dispatch(service, host, &site, parts, body).await {
        Ok(response) => response,
        Err(err) => match static_file::send_error_page(service, host, &site, err.status()).await {
            Some(page) => {
                err.report();
                page
            }
            None => err.render(media),
        },
    }
}

async fn dispatch(
    service: &GatewayService,
    host: &str,
    site: &SiteConfig,
    parts: &Parts,
    body: Body,
) -> Result<Response, ResponseError> {
    let uri = parts.uri.path_and_query().map_or("/", |pq| pq.as_str());

    match service.resolver().resolve(host, uri, site).await? {
        Resolution::Static { file } => static_file::send_file(service, parts, &file).await,
        Resolution::Directory { pathname, entries } => {
            listing::send_listing(service, parts, &pathname, &entries)
        }
        Resolution::Function { file, url } => {
            function::exec_function(service, site, parts, body, &file, url).await
        }
        Resolution::NotFound => Err(ResponseError::not_found()),
        Resolution::InvalidPath => Err(ResponseError::invalid_path()),
    }
}

#[cfg(test)]
mod tests {
    use axum::http::{Request, StatusCode, header};

    use super::*;
    use crate::test::{self, MockOrigin, body_string, send};

    fn with_host(uri: &str, host: &str) -> Request<()> {
        Request::get(uri).header(HOST, host).body(()).unwrap()
    }

    #[test]
    fn test_request_host() {
        let (parts, _) = with_host("/", "example.com:8080").into_parts();
        assert_eq!(request_host(&parts), Some("example.com"));

        let (parts, _) = with_host("/", "-bad-.com").into_parts();
        assert_eq!(request_host(&parts), None);

        let (parts, _) = with_host("/", "").into_parts();
        assert_eq!(request_host(&parts), None);

        let (parts, _) = Request::get("https://sub.example.org/x")
            .body(())
            .unwrap()
            .into_parts();
        assert_eq!(request_host(&parts), Some("sub.example.org"));
    }

    #[tokio::test]
    async fn test_invalid_host() {
        test::setup();
        let origin = MockOrigin::new();
        let app = test::app(&origin);

        let response = send(&app, Request::get("/").header(HOST, "not_a_host")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.headers()[SERVER], SERVER_NAME);

        let body: serde_json::Value =
            serde_json::from_str(&body_string(response).await).unwrap();
        insta::assert_json_snapshot!(body, @r###"
        {
          "error": {
            "code": "invalid_host",
            "message": "Invalid Host"
          }
        }
        "###);
    }

    #[tokio::test]
    async fn test_not_found_and_invalid_path() {
        test::setup();
        let origin = MockOrigin::new();
        origin.add_file("example.com/index.html", "hi");
        let app = test::app(&origin);

        let response = send(
            &app,
            Request::get("/missing.html")
                .header(HOST, "example.com")
                .header(header::ACCEPT, "text/html"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[SERVER], SERVER_NAME);
        assert_eq!(
            body_string(response).await,
            "\n<html>\n<h2>Not Found</h2>\n<p>Page not found</p>\n"
        );

        let response = send(&app, Request::get("/a:b").header(HOST, "example.com")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value =
            serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body["error"]["code"], "invalid_path");
    }

    #[tokio::test]
    async fn test_index_and_hook() {
        test::setup();
        let origin = MockOrigin::new();
        origin.add_file(
            "example.com.json",
            r#"{"hooks": {"notFound": [["^/.*$", "/app.html"]]}}"#,
        );
        origin.add_file("example.com/index.html", "index");
        origin.add_file("example.com/app.html", "app");
        let app = test::app(&origin);

        let response = send(&app, Request::get("/").header(HOST, "example.com")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "index");

        let response = send(
            &app,
            Request::get("/deep/link").header(HOST, "example.com"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "app");
    }

    #[tokio::test]
    async fn test_origin_failure() {
        test::setup();
        let origin = MockOrigin::new();
        origin.add_file("example.com/index.html", "hi");
        origin.fail_meta(true);
        let app = test::app(&origin);

        let response = send(
            &app,
            Request::get("/index.html")
                .header(HOST, "example.com")
                .header(header::ACCEPT, "text/plain"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_string(response).await, "Internal server error");
    }
}
