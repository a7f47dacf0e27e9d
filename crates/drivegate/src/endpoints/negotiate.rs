//! Content negotiation for generated bodies, such as errors and directory listings.

use axum::http::HeaderMap;
use axum::http::header::ACCEPT;

/// The representations generated bodies are rendered in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Media {
    Html,
    Json,
    Plain,
}

/// Parses the media ranges of all `Accept` headers, most preferred first.
///
/// Parameters other than the quality are dropped, ranges with a quality of zero are left out.
/// Without an `Accept` header, everything is acceptable.
pub fn media_types(headers: &HeaderMap) -> Vec<String> {
    if headers.get(ACCEPT).is_none() {
        return vec!["*/*".to_owned()];
    }

    let mut ranges: Vec<(String, f32)> = headers
        .get_all(ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|range| {
            let mut parts = range.split(';').map(str::trim);
            let media = parts.next().filter(|m| !m.is_empty())?.to_ascii_lowercase();
            let quality = parts
                .filter_map(|param| param.strip_prefix("q="))
                .find_map(|q| q.parse::<f32>().ok())
                .unwrap_or(1.0);
            (quality > 0.0).then_some((media, quality))
        })
        .collect();

    ranges.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranges.into_iter().map(|(media, _)| media).collect()
}

/// Picks the representation of a generated body.
///
/// HTML wins whenever it is acceptable, then JSON for anything accepting `*/*`. Plain text is only
/// chosen when explicitly asked for, JSON is the fallback for everything else.
pub fn negotiate(headers: &HeaderMap) -> Media {
    let types = media_types(headers);
    let accepts = |media: &str| types.iter().any(|t| t == media);

    if accepts("text/html") {
        Media::Html
    } else if accepts("*/*") {
        Media::Json
    } else if accepts("text/plain") {
        Media::Plain
    } else {
        Media::Json
    }
}
