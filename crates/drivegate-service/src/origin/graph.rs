use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, IF_NONE_MATCH};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use super::{ContentRequest, ContentResponse, EntryKind, Origin, OriginMeta, RemoteEntry};
use crate::caching::{CacheContents, CacheError};
use crate::config::OriginConfig;
use crate::utils::futures::{m, measure};

/// Tokens are renewed this long before they actually lapse.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct AccessToken {
    header: Arc<str>,
    expires_at: Instant,
}

impl AccessToken {
    fn is_expired(&self) -> bool {
        self.expires_at <= Instant::now()
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    token_type: String,
    expires_in: u64,
    access_token: String,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    error: ApiError,
}

#[derive(Deserialize)]
struct ApiError {
    code: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ItemReference {
    drive_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileFacet {
    mime_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FolderFacet {
    #[serde(default)]
    child_count: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveItem {
    id: String,
    name: String,
    #[serde(default)]
    c_tag: String,
    #[serde(default)]
    e_tag: String,
    #[serde(default)]
    size: u64,
    last_modified_date_time: Option<DateTime<Utc>>,
    #[serde(rename = "@microsoft.graph.downloadUrl")]
    download_url: Option<String>,
    parent_reference: Option<ItemReference>,
    file: Option<FileFacet>,
    folder: Option<FolderFacet>,
}

impl DriveItem {
    /// Converts the item, skipping items that are neither files nor folders.
    fn into_entry(self) -> Option<RemoteEntry> {
        let kind = match (self.file, self.folder) {
            (_, Some(folder)) => EntryKind::Folder {
                child_count: folder.child_count,
            },
            (Some(file), None) => EntryKind::File {
                mime_type: file.mime_type,
            },
            (None, None) => return None,
        };

        Some(RemoteEntry {
            id: self.id,
            drive_id: self
                .parent_reference
                .map(|parent| parent.drive_id)
                .unwrap_or_default(),
            name: self.name,
            ctag: self.c_tag,
            etag: self.e_tag,
            size: self.size,
            last_modified: self.last_modified_date_time,
            download_url: self.download_url,
            kind,
        })
    }
}

#[derive(Deserialize)]
struct ChildrenPage {
    value: Vec<DriveItem>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

enum ApiResponse<T> {
    Json(T),
    NotModified,
    Absent,
}

/// An [`Origin`] backed by the Microsoft Graph drive API.
///
/// Requests are authenticated with an OAuth client-credentials token that is shared by all
/// requests until it expires.
pub struct GraphOrigin {
    client: reqwest::Client,
    api_url: String,
    token_url: String,
    scope: String,
    client_id: String,
    client_secret: String,
    timeout: Duration,
    token_cache: moka::future::Cache<(), CacheContents<AccessToken>>,
}

impl GraphOrigin {
    pub fn new(client: reqwest::Client, config: &OriginConfig) -> anyhow::Result<Self> {
        let tenant_id = config
            .tenant_id
            .as_deref()
            .context("missing origin tenant id")?;
        let client_id = config.client_id.clone().context("missing origin client id")?;
        let client_secret = config
            .client_secret
            .clone()
            .context("missing origin client secret")?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_owned(),
            token_url: format!(
                "{}/{tenant_id}/oauth2/v2.0/token",
                config.login_url.trim_end_matches('/')
            ),
            scope: config.scope.clone(),
            client_id,
            client_secret,
            timeout: config.timeout,
            token_cache: moka::future::Cache::new(1),
        })
    }

    fn request_error(&self, err: reqwest::Error) -> CacheError {
        if err.is_timeout() {
            CacheError::Timeout(self.timeout)
        } else {
            tracing::debug!(error = &err as &dyn std::error::Error, "Origin request failed");
            CacheError::DownloadError(err.to_string())
        }
    }

    /// Resolves a valid access token, requesting a new one if the cached one expired.
    async fn get_token(&self) -> CacheContents<AccessToken> {
        metric!(counter("origin.token.access") += 1);

        let init = Box::pin(async {
            metric!(counter("origin.token.computation") += 1);
            self.request_token().await
        });
        let replace_if =
            |entry: &CacheContents<AccessToken>| entry.as_ref().map_or(true, |t| t.is_expired());

        self.token_cache
            .entry(())
            .or_insert_with_if(init, replace_if)
            .await
            .into_value()
    }

    async fn request_token(&self) -> CacheContents<AccessToken> {
        let requested_at = Instant::now();
        let response = self
            .client
            .post(&self.token_url)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("scope", self.scope.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("grant_type", "client_credentials"),
            ])
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|err| self.request_error(err))?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(%status, "Failed to acquire an origin access token");
            return Err(CacheError::PermissionDenied(format!(
                "token request failed with {status}"
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|err| CacheError::Malformed(err.to_string()))?;
        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);

        Ok(AccessToken {
            header: format!("{} {}", token.token_type, token.access_token).into(),
            expires_at: requested_at + lifetime,
        })
    }

    async fn api_get<T: DeserializeOwned>(
        &self,
        url: &str,
        if_none_match: Option<&str>,
    ) -> CacheContents<ApiResponse<T>> {
        let token = self.get_token().await?;

        let mut request = self
            .client
            .get(url)
            .header(AUTHORIZATION, &*token.header)
            .timeout(self.timeout);
        if let Some(etag) = if_none_match {
            request = request.header(IF_NONE_MATCH, etag);
        }

        let response = measure("origin.api", m::result, request.send())
            .await
            .map_err(|err| self.request_error(err))?;

        let status = response.status();
        metric!(counter("origin.api.status") += 1, "status" => status.as_str());
        match status {
            StatusCode::NOT_FOUND | StatusCode::NO_CONTENT => Ok(ApiResponse::Absent),
            StatusCode::NOT_MODIFIED => Ok(ApiResponse::NotModified),
            status if status.is_success() => {
                let body = response.bytes().await.map_err(|err| self.request_error(err))?;
                let value = serde_json::from_slice(&body)
                    .map_err(|err| CacheError::Malformed(err.to_string()))?;
                Ok(ApiResponse::Json(value))
            }
            status => {
                let code = response
                    .json::<ApiErrorBody>()
                    .await
                    .map(|body| body.error.code)
                    .unwrap_or_else(|_| "Fetch failed".to_owned());
                tracing::debug!(%status, %code, url, "Origin API error");

                Err(match status {
                    StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                        CacheError::PermissionDenied(code)
                    }
                    _ => CacheError::DownloadError(format!("{code} ({status})")),
                })
            }
        }
    }
}

#[async_trait]
impl Origin for GraphOrigin {
    async fn fetch_meta(
        &self,
        path: &str,
        if_none_match: Option<&str>,
    ) -> CacheContents<OriginMeta> {
        let url = format!("{}{path}", self.api_url);
        let meta = match self.api_get::<DriveItem>(&url, if_none_match).await? {
            ApiResponse::Json(item) => item
                .into_entry()
                .map_or(OriginMeta::Absent, OriginMeta::Found),
            ApiResponse::NotModified => OriginMeta::NotModified,
            ApiResponse::Absent => OriginMeta::Absent,
        };
        Ok(meta)
    }

    async fn fetch_children(&self, path: &str) -> CacheContents<Option<Vec<RemoteEntry>>> {
        let mut url = format!("{}{path}", self.api_url);
        let mut entries = Vec::new();

        loop {
            let page = match self.api_get::<ChildrenPage>(&url, None).await? {
                ApiResponse::Json(page) => page,
                ApiResponse::Absent | ApiResponse::NotModified if entries.is_empty() => {
                    return Ok(None);
                }
                ApiResponse::Absent | ApiResponse::NotModified => break,
            };

            entries.extend(page.value.into_iter().filter_map(DriveItem::into_entry));
            match page.next_link {
                Some(next) => url = next,
                None => break,
            }
        }

        Ok(Some(entries))
    }

    async fn fetch_content(&self, request: ContentRequest) -> CacheContents<ContentResponse> {
        let response = self
            .client
            .request(request.method, &request.locator)
            .headers(request.headers)
            .send()
            .await
            .map_err(|err| self.request_error(err))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes_stream()
            .map_err(|err| CacheError::DownloadError(err.to_string()))
            .boxed();

        Ok(ContentResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::Json;
    use axum::Router;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode, Uri};
    use axum::response::{IntoResponse, Response};
    use axum::routing::post;
    use drivegate_test::Server;
    use serde_json::json;

    use super::*;
    use crate::test;

    #[derive(Default)]
    struct Hits {
        tokens: AtomicUsize,
    }

    async fn token(State(hits): State<Arc<Hits>>) -> Json<serde_json::Value> {
        hits.tokens.fetch_add(1, Ordering::SeqCst);
        Json(json!({
            "token_type": "Bearer",
            "expires_in": 3599,
            "access_token": "secret-token",
        }))
    }

    fn item(id: &str, name: &str, folder: bool) -> serde_json::Value {
        let mut item = json!({
            "id": id,
            "name": name,
            "cTag": format!("ctag-{id}"),
            "eTag": format!("etag-{id}"),
            "size": 12,
            "lastModifiedDateTime": "2024-03-01T12:00:00Z",
            "parentReference": { "driveId": "drive", "id": "parent" },
        });
        if folder {
            item["folder"] = json!({ "childCount": 2 });
        } else {
            item["file"] = json!({ "mimeType": "text/html" });
            item["@microsoft.graph.downloadUrl"] = json!(format!("https://download/{id}"));
        }
        item
    }

    async fn api(uri: Uri, headers: HeaderMap) -> Response {
        if headers.get("authorization").and_then(|v| v.to_str().ok())
            != Some("Bearer secret-token")
        {
            return StatusCode::UNAUTHORIZED.into_response();
        }

        let path = uri.path();
        match path {
            "/v1.0/root:/sites/example.com/index.html:" => {
                if headers.get("if-none-match").is_some_and(|v| v == "etag-1") {
                    return StatusCode::NOT_MODIFIED.into_response();
                }
                Json(item("1", "index.html", false)).into_response()
            }
            "/v1.0/root:/sites/example.com/docs:/children" => {
                if uri.query() == Some("page=2") {
                    Json(json!({ "value": [item("3", "b.txt", false)] })).into_response()
                } else {
                    let next = format!(
                        "http://{}/v1.0/root:/sites/example.com/docs:/children?page=2",
                        headers["host"].to_str().unwrap()
                    );
                    Json(json!({
                        "value": [item("2", "a", true), {"id": "x", "name": "odd"}],
                        "@odata.nextLink": next,
                    }))
                    .into_response()
                }
            }
            "/v1.0/root:/sites/example.com/broken:" => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": { "code": "generalException", "message": "oops" } })),
            )
                .into_response(),
            _ => (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": { "code": "itemNotFound", "message": "nope" } })),
            )
                .into_response(),
        }
    }

    async fn graph_server() -> (Server, Arc<Hits>) {
        let hits = Arc::new(Hits::default());
        let router = Router::new()
            .route("/login/tenant/oauth2/v2.0/token", post(token))
            .fallback(api)
            .with_state(Arc::clone(&hits));
        (Server::with_router(router).await, hits)
    }

    fn origin(server: &Server) -> GraphOrigin {
        let config = OriginConfig {
            api_url: server.url("/v1.0").to_string(),
            login_url: server.url("/login").to_string(),
            tenant_id: Some("tenant".into()),
            client_id: Some("client".into()),
            client_secret: Some("secret".into()),
            ..Default::default()
        };
        GraphOrigin::new(reqwest::Client::new(), &config).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_meta() {
        test::setup();
        let (server, hits) = graph_server().await;
        let origin = origin(&server);

        let meta = origin
            .fetch_meta("/root:/sites/example.com/index.html:", None)
            .await
            .unwrap();
        let OriginMeta::Found(entry) = meta else {
            panic!("expected an entry, got {meta:?}");
        };
        assert_eq!(entry.id, "1");
        assert_eq!(entry.drive_id, "drive");
        assert_eq!(entry.ctag, "ctag-1");
        assert_eq!(entry.download_url.as_deref(), Some("https://download/1"));
        assert_eq!(
            entry.kind,
            EntryKind::File {
                mime_type: Some("text/html".into())
            }
        );

        let meta = origin
            .fetch_meta("/root:/sites/example.com/index.html:", Some("etag-1"))
            .await;
        assert_eq!(meta, Ok(OriginMeta::NotModified));

        let meta = origin
            .fetch_meta("/root:/sites/example.com/missing:", None)
            .await;
        assert_eq!(meta, Ok(OriginMeta::Absent));

        // the token is shared by all requests
        assert_eq!(hits.tokens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_api_errors() {
        test::setup();
        let (server, _hits) = graph_server().await;
        let origin = origin(&server);

        let meta = origin
            .fetch_meta("/root:/sites/example.com/broken:", None)
            .await;
        assert_eq!(
            meta,
            Err(CacheError::DownloadError(
                "generalException (500 Internal Server Error)".into()
            ))
        );
    }

    #[tokio::test]
    async fn test_fetch_children_follows_pages() {
        test::setup();
        let (server, _hits) = graph_server().await;
        let origin = origin(&server);

        let children = origin
            .fetch_children("/root:/sites/example.com/docs:/children")
            .await
            .unwrap()
            .unwrap();
        let names: Vec<_> = children.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["a", "b.txt"]);
        assert!(children[0].is_folder());

        let missing = origin
            .fetch_children("/root:/sites/example.com/nope:/children")
            .await;
        assert_eq!(missing, Ok(None));
    }
}
