use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};

use super::ResponseError;

/// The methods static files and listings can be requested with.
pub const ALLOW_METHODS: &str = "GET, HEAD, OPTIONS";

const ALLOW_REQUEST_HEADERS: &str = "Accept, Accept-Encoding, Range, If-None-Match";
const EXPOSE_RESPONSE_HEADERS: &str = "Accept-Ranges, Content-Range, Content-Length, \
    Content-Type, Content-Encoding, Content-Disposition, Date, ETag, Transfer-Encoding, Server";

/// Checks the method of a request for a static resource.
///
/// Returns the complete preflight response for `OPTIONS`, `None` if the request should be
/// served, and an error for every other method.
pub fn check_static_method(method: &Method) -> Result<Option<Response>, ResponseError> {
    match *method {
        Method::GET | Method::HEAD => Ok(None),
        Method::OPTIONS => Ok(Some(preflight())),
        _ => Err(ResponseError::method_not_allowed(ALLOW_METHODS)),
    }
}

fn preflight() -> Response {
    (
        StatusCode::NO_CONTENT,
        [
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*")),
            (
                header::ACCESS_CONTROL_ALLOW_METHODS,
                HeaderValue::from_static(ALLOW_METHODS),
            ),
            (
                header::ACCESS_CONTROL_ALLOW_HEADERS,
                HeaderValue::from_static(ALLOW_REQUEST_HEADERS),
            ),
            (
                header::ACCESS_CONTROL_EXPOSE_HEADERS,
                HeaderValue::from_static(EXPOSE_RESPONSE_HEADERS),
            ),
            (
                header::ACCESS_CONTROL_MAX_AGE,
                HeaderValue::from_static("86400"),
            ),
        ],
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_methods() {
        assert!(check_static_method(&Method::GET).unwrap().is_none());
        assert!(check_static_method(&Method::HEAD).unwrap().is_none());

        let preflight = check_static_method(&Method::OPTIONS).unwrap().unwrap();
        assert_eq!(preflight.status(), StatusCode::NO_CONTENT);
        assert_eq!(preflight.headers()[header::ACCESS_CONTROL_MAX_AGE], "86400");

        let err = check_static_method(&Method::POST).unwrap_err();
        assert_eq!(err.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
