//! Evaluation of conditional request headers against weak entity tags.

use sha2::{Digest, Sha224};

/// Derives the weak entity tag of a file from its origin content tag.
pub fn etag_for_ctag(ctag: &str) -> String {
    let digest = Sha224::digest(ctag.as_bytes());
    format!("W/\"{digest:x}\"")
}

/// Extracts the quoted payload of an entity tag, ignoring a leading `W/`.
fn opaque_tag(tag: &str) -> Option<&str> {
    let tag = tag.strip_prefix("W/").unwrap_or(tag);
    let payload = tag.strip_prefix('"')?.strip_suffix('"')?;
    (!payload.contains('"')).then_some(payload)
}

/// Checks whether an `If-None-Match` or `If-Range` header value matches `etag`.
///
/// The header is a comma separated list of entity tags. `*` matches anything, every other
/// element matches if its payload equals the payload of `etag` under weak comparison. Elements
/// that are not properly quoted never match.
pub fn weak_match(header: &str, etag: &str) -> bool {
    let Some(expected) = opaque_tag(etag) else {
        return false;
    };

    header
        .split(',')
        .map(str::trim)
        .any(|tag| tag == "*" || opaque_tag(tag) == Some(expected))
}

/// The conditional headers of a request for a static file.
#[derive(Debug, Clone, Copy, Default)]
pub struct Preconditions<'a> {
    pub if_none_match: Option<&'a str>,
    pub if_range: Option<&'a str>,
    pub has_range: bool,
}

/// How a request for a static file should be answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evaluation {
    /// The client's copy is current, answer `304` without a body.
    NotModified,
    /// Send the content. `keep_range` tells whether the `Range` header may be forwarded.
    Full { keep_range: bool },
}

impl Preconditions<'_> {
    pub fn evaluate(&self, etag: &str) -> Evaluation {
        if self.if_none_match.is_some_and(|header| weak_match(header, etag)) {
            return Evaluation::NotModified;
        }

        // a stale `If-Range` turns the range request into a full one
        let keep_range = self.has_range && self.if_range.is_none_or(|header| weak_match(header, etag));
        Evaluation::Full { keep_range }
    }
}
