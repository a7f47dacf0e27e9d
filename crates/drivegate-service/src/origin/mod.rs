//! Access to the cloud drive that serves as the origin of every site.
//!
//! Sites live in folders named after their host below a configurable root folder. Items are
//! addressed by path (`{root}/{host}{path}:`) when resolving requests and by identity
//! (`/drives/{drive}/items/{id}`) when revalidating something that was resolved before.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};

use crate::caching::{CacheContents, CacheError};

mod graph;

pub use graph::GraphOrigin;

/// What kind of item a [`RemoteEntry`] describes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    File { mime_type: Option<String> },
    Folder { child_count: u64 },
}

/// Metadata of a file or folder on the origin.
///
/// Identity is `(drive_id, id)`, the content tag changes whenever the content does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub id: String,
    pub drive_id: String,
    pub name: String,
    pub ctag: String,
    pub etag: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    /// Pre-authenticated URL the content can be fetched from.
    pub download_url: Option<String>,
    pub kind: EntryKind,
}

impl RemoteEntry {
    pub fn is_file(&self) -> bool {
        matches!(self.kind, EntryKind::File { .. })
    }

    pub fn is_folder(&self) -> bool {
        matches!(self.kind, EntryKind::Folder { .. })
    }

    /// Where to fetch the content of a file from.
    pub fn content_locator(&self) -> CacheContents<&str> {
        self.download_url.as_deref().ok_or_else(|| {
            CacheError::DownloadError(format!("no download URL for item `{}`", self.id))
        })
    }
}

/// The outcome of a (conditional) metadata lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OriginMeta {
    Found(RemoteEntry),
    /// The item still matches the entity tag the lookup was conditioned on.
    NotModified,
    Absent,
}

/// A request for the content of a file.
#[derive(Debug, Clone)]
pub struct ContentRequest {
    pub locator: String,
    pub method: Method,
    /// Request headers passed on to the origin, such as `Accept-Encoding` or `Range`.
    pub headers: HeaderMap,
}

impl ContentRequest {
    pub fn get(locator: impl Into<String>) -> Self {
        Self {
            locator: locator.into(),
            method: Method::GET,
            headers: HeaderMap::new(),
        }
    }
}

/// The response of the origin to a [`ContentRequest`], with a streaming body.
pub struct ContentResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: BoxStream<'static, Result<Bytes, CacheError>>,
}

impl std::fmt::Debug for ContentResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl ContentResponse {
    /// Collects the whole body into memory.
    pub async fn bytes(self) -> CacheContents<Bytes> {
        let mut buf = BytesMut::new();
        let mut body = self.body;
        while let Some(chunk) = body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

/// The document store every file, folder and site configuration is read from.
#[async_trait]
pub trait Origin: Send + Sync + 'static {
    /// Looks up the item at `path`.
    ///
    /// With `if_none_match`, [`OriginMeta::NotModified`] is returned if the item's entity tag
    /// still matches.
    async fn fetch_meta(&self, path: &str, if_none_match: Option<&str>)
    -> CacheContents<OriginMeta>;

    /// Lists the children of the folder at `path`, `None` if there is no such folder.
    async fn fetch_children(&self, path: &str) -> CacheContents<Option<Vec<RemoteEntry>>>;

    /// Fetches file content. Non-success statuses are returned as responses, not errors.
    async fn fetch_content(&self, request: ContentRequest) -> CacheContents<ContentResponse>;

    /// Downloads the whole content of a file.
    async fn download(&self, entry: &RemoteEntry) -> CacheContents<Bytes> {
        let locator = entry.content_locator()?;
        let response = self.fetch_content(ContentRequest::get(locator)).await?;
        match response.status {
            status if status.is_success() => response.bytes().await,
            StatusCode::NOT_FOUND => Err(CacheError::NotFound),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(
                CacheError::PermissionDenied(format!("content of `{}`", entry.name)),
            ),
            status => Err(CacheError::DownloadError(status.to_string())),
        }
    }
}

/// Builds the origin paths items are looked up by.
#[derive(Debug, Clone)]
pub struct DrivePaths {
    root: String,
}

impl DrivePaths {
    pub fn new(root: impl Into<String>) -> Self {
        let root = root.into().trim_end_matches('/').to_owned();
        Self { root }
    }

    /// The metadata path of `path` within the site of `host`.
    ///
    /// `path` is a normalized request path, which is empty for the site root. Paths containing
    /// the `:` delimiter cannot be expressed and yield `None`.
    pub fn meta_path(&self, host: &str, path: &str) -> Option<String> {
        if path.contains(':') || host.contains(':') {
            return None;
        }
        Some(format!("{}/{host}{path}:", self.root))
    }

    /// The listing path of the folder whose metadata path is `meta_path`.
    pub fn children_path(meta_path: &str) -> String {
        format!("{meta_path}/children")
    }

    /// The path of an item by its identity.
    pub fn item_path(drive_id: &str, id: &str) -> String {
        format!("/drives/{drive_id}/items/{id}")
    }

    /// The listing path of the root folder, where site configuration files live.
    pub fn root_children_path(&self) -> String {
        let delimiter = if self.root.contains(':') { ":" } else { "" };
        format!("{}{delimiter}/children", self.root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drive_paths() {
        let paths = DrivePaths::new("/drives/abc/root:/sites/");

        assert_eq!(
            paths.meta_path("example.com", "/blog/post.html").as_deref(),
            Some("/drives/abc/root:/sites/example.com/blog/post.html:")
        );
        assert_eq!(
            paths.meta_path("example.com", "").as_deref(),
            Some("/drives/abc/root:/sites/example.com:")
        );
        assert_eq!(paths.meta_path("example.com", "/a:b"), None);
        assert_eq!(
            DrivePaths::children_path("/drives/abc/root:/sites/example.com:"),
            "/drives/abc/root:/sites/example.com:/children"
        );
        assert_eq!(
            paths.root_children_path(),
            "/drives/abc/root:/sites:/children"
        );
        assert_eq!(
            DrivePaths::new("/drives/abc/root").root_children_path(),
            "/drives/abc/root/children"
        );
        assert_eq!(DrivePaths::item_path("d", "i"), "/drives/d/items/i");
    }
}
