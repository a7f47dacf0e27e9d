use std::collections::BTreeMap;

use axum::body::Body;
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use drivegate_service::functions::FunctionRequest;
use drivegate_service::origin::RemoteEntry;
use drivegate_service::sites::SiteConfig;

use super::ResponseError;
use crate::service::GatewayService;

/// The largest request body handed to a function.
pub const MAX_BODY_SIZE: usize = 5 * 1024 * 1024;

/// Request headers as a map, repeated headers joined into a single list.
fn header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut map: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes());
        map.entry(name.as_str().to_owned())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert_with(|| value.into_owned());
    }
    map
}

/// Runs the function in `file` and answers with whatever it returned.
pub async fn exec_function(
    service: &GatewayService,
    site: &SiteConfig,
    parts: &Parts,
    body: Body,
    file: &RemoteEntry,
    url: String,
) -> Result<Response, ResponseError> {
    // a saturated queue rejects before the body is read
    if service.functions().queue().is_saturated() {
        return Err(ResponseError::service_unavailable());
    }

    let body = axum::body::to_bytes(body, MAX_BODY_SIZE)
        .await
        .map_err(|err| ResponseError::payload_too_large().with_source(err))?;

    let request = FunctionRequest {
        method: parts.method.to_string(),
        url,
        headers: header_map(&parts.headers),
        body,
    };

    tracing::debug!(name = %file.name, url = %request.url, "Executing function");
    let output = service.functions().execute(request, site, file).await?;

    let status = StatusCode::from_u16(output.status).map_err(|err| {
        ResponseError::internal().with_source(anyhow::Error::new(err).context(format!(
            "function `{}` answered with status {}",
            file.name, output.status
        )))
    })?;

    let mut response = Response::new(Body::from(output.body));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    for (name, value) in &output.headers {
        match (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => tracing::debug!(name = %file.name, header = %name, "Dropping invalid header"),
        }
    }

    Ok(response)
}
