use axum::Json;
use axum::http::header::{ALLOW, CONTENT_TYPE};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use drivegate_service::caching::CacheError;
use drivegate_service::functions::ExecError;
use sentry::integrations::anyhow::capture_anyhow;
use serde::{Deserialize, Serialize};

use super::negotiate::Media;

/// An error answered to the client, rendered in the representation the client accepts.
#[derive(Debug)]
pub struct ResponseError {
    status: StatusCode,
    code: &'static str,
    message: &'static str,
    allow: Option<&'static str>,
    err: Option<anyhow::Error>,
}

impl ResponseError {
    fn new(status: StatusCode, code: &'static str, message: &'static str) -> Self {
        Self {
            status,
            code,
            message,
            allow: None,
            err: None,
        }
    }

    pub fn invalid_host() -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_host", "Invalid Host")
    }

    pub fn invalid_path() -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_path", "Invalid path")
    }

    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", "Page not found")
    }

    pub fn method_not_allowed(allow: &'static str) -> Self {
        Self {
            allow: Some(allow),
            ..Self::new(
                StatusCode::METHOD_NOT_ALLOWED,
                "method_not_allowed",
                "Method not allowed",
            )
        }
    }

    pub fn payload_too_large() -> Self {
        Self::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            "payload_too_large",
            "Payload too large",
        )
    }

    /// The origin refused a request we built.
    pub fn bad_request() -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "bad_request",
            "Bad request",
        )
    }

    pub fn internal() -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_server_error",
            "Internal server error",
        )
    }

    pub fn service_unavailable() -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "service_unavailable",
            "Service unavailable",
        )
    }

    pub fn execution_timeout() -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "execution_timeout",
            "Function execution timed out",
        )
    }

    /// Attaches the underlying cause, reported along with server errors.
    pub fn with_source(mut self, err: impl Into<anyhow::Error>) -> Self {
        self.err = Some(err.into());
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    /// Logs server errors and sends their cause to Sentry.
    pub fn report(&self) {
        if !self.status.is_server_error() {
            return;
        }
        match self.err {
            Some(ref err) => {
                tracing::error!(code = self.code, "Request failed: {err:#}");
                capture_anyhow(err);
            }
            None => tracing::error!(code = self.code, "Request failed"),
        }
    }

    /// Reports server errors and renders the error body as `media`.
    pub fn render(self, media: Media) -> Response {
        self.report();

        let mut response = match media {
            Media::Html => {
                let reason = self
                    .status
                    .canonical_reason()
                    .unwrap_or("Internal Server Error");
                let body = format!("\n<html>\n<h2>{reason}</h2>\n<p>{}</p>\n", self.message);
                (
                    [(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"))],
                    body,
                )
                    .into_response()
            }
            Media::Plain => self.message.into_response(),
            Media::Json => Json(ApiErrorResponse {
                error: ApiError {
                    code: self.code.to_owned(),
                    message: self.message.to_owned(),
                },
            })
            .into_response(),
        };

        *response.status_mut() = self.status;
        if let Some(allow) = self.allow {
            response
                .headers_mut()
                .insert(ALLOW, HeaderValue::from_static(allow));
        }
        response
    }
}

impl From<CacheError> for ResponseError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::NotFound => Self::not_found(),
            err => Self::internal().with_source(err),
        }
    }
}

impl From<ExecError> for ResponseError {
    fn from(err: ExecError) -> Self {
        match err {
            ExecError::Unavailable => Self::service_unavailable(),
            ExecError::Timeout(_) => Self::execution_timeout().with_source(err),
            ExecError::Prepare(CacheError::NotFound) => Self::not_found(),
            err => Self::internal().with_source(err),
        }
    }
}

impl IntoResponse for ResponseError {
    fn into_response(self) -> Response {
        self.render(Media::Json)
    }
}

/// The JSON body of an error response.
#[derive(Serialize, Deserialize, Debug)]
pub struct ApiErrorResponse {
    pub error: ApiError,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_render_json() {
        let response = ResponseError::not_found().render(Media::Json);
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body: serde_json::Value = serde_json::from_str(&body(response).await).unwrap();
        insta::assert_json_snapshot!(body, @r###"
        {
          "error": {
            "code": "not_found",
            "message": "Page not found"
          }
        }
        "###);
    }

    #[tokio::test]
    async fn test_render_html() {
        let response = ResponseError::internal().render(Media::Html);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.headers()[CONTENT_TYPE],
            "text/html; charset=utf-8"
        );
        assert_eq!(
            body(response).await,
            "\n<html>\n<h2>Internal Server Error</h2>\n<p>Internal server error</p>\n"
        );
    }

    #[tokio::test]
    async fn test_render_plain_with_allow() {
        let response = ResponseError::method_not_allowed("GET, HEAD").render(Media::Plain);
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()[ALLOW], "GET, HEAD");
        assert_eq!(body(response).await, "Method not allowed");
    }

    #[test]
    fn test_exec_errors() {
        let err = ResponseError::from(ExecError::Unavailable);
        assert_eq!(
            (err.status(), err.code()),
            (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable")
        );

        let err = ResponseError::from(ExecError::Prepare(CacheError::NotFound));
        assert_eq!(err.status(), StatusCode::NOT_FOUND);

        let err = ResponseError::from(ExecError::Failed("boom".into()));
        assert_eq!(err.code(), "internal_server_error");
    }
}
