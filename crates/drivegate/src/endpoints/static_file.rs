//! Streams file content from the origin, honoring conditional and range requests.

use anyhow::anyhow;
use axum::body::Body;
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::request::Parts;
use axum::http::{Method, StatusCode};
use axum::response::Response;
use drivegate_service::conditional::{Evaluation, Preconditions, etag_for_ctag};
use drivegate_service::origin::{ContentRequest, RemoteEntry};
use drivegate_service::routes::normalize_path;
use drivegate_service::sites::SiteConfig;

use super::methods::check_static_method;
use super::{ResponseError, set_vary};
use crate::service::GatewayService;

/// Origin response headers handed on to the client.
const PASSED_HEADERS: [HeaderName; 6] = [
    header::ACCEPT_RANGES,
    header::CONTENT_TYPE,
    header::CONTENT_RANGE,
    header::CONTENT_ENCODING,
    header::CONTENT_LENGTH,
    header::DATE,
];

/// All values of header `name`, joined into a single list.
fn joined(headers: &HeaderMap, name: HeaderName) -> Option<String> {
    let values: Vec<&str> = headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    (!values.is_empty()).then(|| values.join(", "))
}

fn pass_headers(from: &HeaderMap, to: &mut HeaderMap, names: &[HeaderName]) {
    for name in names {
        if let Some(value) = from.get(name) {
            to.insert(name.clone(), value.clone());
        }
    }
}

/// Serves `file` from the origin.
///
/// A request whose `If-None-Match` matches is answered with `304` after a `HEAD` request to the
/// origin, whose `Date` is handed on. A stale `If-Range` turns a range request into a full one.
pub async fn send_file(
    service: &GatewayService,
    parts: &Parts,
    file: &RemoteEntry,
) -> Result<Response, ResponseError> {
    if let Some(preflight) = check_static_method(&parts.method)? {
        return Ok(preflight);
    }

    let etag = etag_for_ctag(&file.ctag);
    let if_none_match = joined(&parts.headers, header::IF_NONE_MATCH);
    let if_range = joined(&parts.headers, header::IF_RANGE);
    let preconditions = Preconditions {
        if_none_match: if_none_match.as_deref(),
        if_range: if_range.as_deref(),
        has_range: parts.headers.contains_key(header::RANGE),
    };
    let evaluation = preconditions.evaluate(&etag);

    let mut forwarded = HeaderMap::new();
    let mut passed = vec![header::ACCEPT_ENCODING];
    if evaluation != (Evaluation::Full { keep_range: false }) {
        passed.push(header::RANGE);
    }
    pass_headers(&parts.headers, &mut forwarded, &passed);

    let method = match evaluation {
        Evaluation::NotModified => Method::HEAD,
        Evaluation::Full { .. } => parts.method.clone(),
    };
    let request = ContentRequest {
        locator: file.content_locator()?.to_owned(),
        method,
        headers: forwarded,
    };
    let upstream = service.origin().fetch_content(request).await?;

    match upstream.status {
        StatusCode::BAD_REQUEST => return Err(ResponseError::bad_request()),
        StatusCode::NOT_FOUND => return Err(ResponseError::not_found()),
        status @ (StatusCode::UNAUTHORIZED
        | StatusCode::FORBIDDEN
        | StatusCode::INTERNAL_SERVER_ERROR) => {
            return Err(ResponseError::internal().with_source(anyhow!(
                "origin answered {status} for the content of `{}`",
                file.name
            )));
        }
        _ => {}
    }

    let mut headers = HeaderMap::new();
    set_vary(&mut headers);
    headers.insert(header::CACHE_CONTROL, service.cache_control().clone());
    if let Ok(etag) = HeaderValue::from_str(&etag) {
        headers.insert(header::ETAG, etag);
    }

    if evaluation == Evaluation::NotModified {
        pass_headers(&upstream.headers, &mut headers, &[header::DATE]);
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::NOT_MODIFIED;
        *response.headers_mut() = headers;
        return Ok(response);
    }

    let disposition = format!("inline; filename=\"{}\"", file.name);
    if let Ok(disposition) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, disposition);
    }
    pass_headers(&upstream.headers, &mut headers, &PASSED_HEADERS);

    let mut response = Response::new(Body::from_stream(upstream.body));
    *response.status_mut() = upstream.status;
    *response.headers_mut() = headers;
    Ok(response)
}

/// Serves the custom page `site` configured for `status`, if there is one.
///
/// Any problem with the page yields `None` so the standard error body is sent instead.
pub async fn send_error_page(
    service: &GatewayService,
    host: &str,
    site: &SiteConfig,
    status: StatusCode,
) -> Option<Response> {
    let path = normalize_path(site.custom_error(status.as_u16())?);
    let meta_path = service.resolver().paths().meta_path(host, &path)?;

    let file = match service.resolver().meta(&meta_path).await {
        Ok(Some(file)) if file.is_file() => file,
        Ok(_) => {
            tracing::debug!(host, %path, "Custom error page not found");
            return None;
        }
        Err(err) => {
            tracing::warn!(
                host,
                %path,
                error = &err as &dyn std::error::Error,
                "Failed to look up custom error page"
            );
            return None;
        }
    };

    let request = ContentRequest::get(file.content_locator().ok()?);
    let upstream = match service.origin().fetch_content(request).await {
        Ok(upstream) if upstream.status.is_success() => upstream,
        Ok(upstream) => {
            tracing::warn!(host, %path, status = %upstream.status, "Custom error page unavailable");
            return None;
        }
        Err(err) => {
            tracing::warn!(
                host,
                %path,
                error = &err as &dyn std::error::Error,
                "Failed to fetch custom error page"
            );
            return None;
        }
    };

    let mut response = Response::new(Body::from_stream(upstream.body));
    *response.status_mut() = status;
    pass_headers(
        &upstream.headers,
        response.headers_mut(),
        &[header::CONTENT_TYPE, header::CONTENT_ENCODING],
    );
    Some(response)
}

#[cfg(test)]
mod tests {
    use axum::http::Request;

    use super::*;
    use crate::test::{self, MOCK_DATE, MockOrigin, body_string, send};

    fn get(path: &str) -> axum::http::request::Builder {
        Request::get(path).header(header::HOST, "example.com")
    }

    #[tokio::test]
    async fn test_send_file() {
        test::setup();
        let origin = MockOrigin::new();
        let file = origin.add_file("example.com/hello.txt", "hello world");
        let app = test::app(&origin);

        let response = send(&app, get("/hello.txt")).await;
        assert_eq!(response.status(), StatusCode::OK);

        let headers = response.headers();
        assert_eq!(headers[header::ETAG], etag_for_ctag(&file.ctag).as_str());
        assert_eq!(headers[header::VARY], "Accept, Accept-Encoding, Range");
        assert_eq!(
            headers[header::CONTENT_DISPOSITION],
            "inline; filename=\"hello.txt\""
        );
        assert_eq!(headers[header::CONTENT_TYPE], "text/plain");
        assert_eq!(headers[header::DATE], MOCK_DATE);
        assert!(headers.contains_key(header::CACHE_CONTROL));
        assert_eq!(body_string(response).await, "hello world");
    }

    #[tokio::test]
    async fn test_not_modified() {
        test::setup();
        let origin = MockOrigin::new();
        let file = origin.add_file("example.com/hello.txt", "hello world");
        let app = test::app(&origin);
        let etag = etag_for_ctag(&file.ctag);

        let response = send(
            &app,
            get("/hello.txt").header(header::IF_NONE_MATCH, format!("W/\"other\", {etag}")),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
        assert_eq!(response.headers()[header::ETAG], etag.as_str());
        assert_eq!(response.headers()[header::DATE], MOCK_DATE);
        assert_eq!(body_string(response).await, "");

        let requests = origin.content_requests();
        assert_eq!(requests.last().unwrap().method, Method::HEAD);

        // a new version no longer matches
        origin.add_file("example.com/hello.txt", "hello again");
        let response = send(&app, get("/hello.txt").header(header::IF_NONE_MATCH, &etag)).await;
        // metadata is still cached
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    }

    #[tokio::test]
    async fn test_ranges() {
        test::setup();
        let origin = MockOrigin::new();
        let file = origin.add_file("example.com/hello.txt", "hello world");
        let app = test::app(&origin);
        let etag = etag_for_ctag(&file.ctag);

        let response = send(&app, get("/hello.txt").header(header::RANGE, "bytes=0-4")).await;
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 0-4/11");
        assert_eq!(body_string(response).await, "hello");

        let response = send(
            &app,
            get("/hello.txt")
                .header(header::RANGE, "bytes=6-")
                .header(header::IF_RANGE, &etag),
        )
        .await;
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(body_string(response).await, "world");

        let response = send(
            &app,
            get("/hello.txt")
                .header(header::RANGE, "bytes=6-")
                .header(header::IF_RANGE, "W/\"stale\""),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "hello world");
        assert!(
            !origin
                .content_requests()
                .last()
                .unwrap()
                .headers
                .contains_key(header::RANGE)
        );
    }

    #[tokio::test]
    async fn test_methods() {
        test::setup();
        let origin = MockOrigin::new();
        origin.add_file("example.com/hello.txt", "hello world");
        let app = test::app(&origin);

        let response = send(&app, get("/hello.txt").method(Method::POST)).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()[header::ALLOW], "GET, HEAD, OPTIONS");

        let response = send(&app, get("/hello.txt").method(Method::OPTIONS)).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "*"
        );

        let response = send(&app, get("/hello.txt").method(Method::HEAD)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "11");

        // neither the preflight nor the rejected request reached the origin
        assert_eq!(origin.content_calls(), 1);
    }

    #[tokio::test]
    async fn test_custom_error_page() {
        test::setup();
        let origin = MockOrigin::new();
        origin.add_file(
            "example.com.json",
            r#"{"customErrors": {"404": "/errors/404.html"}}"#,
        );
        origin.add_file("example.com/errors/404.html", "<h1>gone</h1>");
        origin.add_file("other.org.json", r#"{"customErrors": {"404": "/missing.html"}}"#);
        origin.add_file("other.org/index.html", "hi");
        let app = test::app(&origin);

        let response = send(&app, get("/nope")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/html");
        assert_eq!(body_string(response).await, "<h1>gone</h1>");

        // a broken page falls back to the standard error
        let response = send(
            &app,
            Request::get("/nope")
                .header(header::HOST, "other.org")
                .header(header::ACCEPT, "text/plain"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_string(response).await, "Page not found");
    }
}
