use std::fmt::Write;

use axum::Json;
use axum::http::header::{self, HeaderValue};
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, SecondsFormat, Utc};
use drivegate_service::origin::{EntryKind, RemoteEntry};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Serialize;

use super::methods::check_static_method;
use super::negotiate::{Media, negotiate};
use super::{ResponseError, set_vary};
use crate::service::GatewayService;

/// Everything but the characters `encodeURIComponent` leaves alone.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

#[derive(Debug, Serialize)]
struct Listing<'a> {
    path: &'a str,
    files: Vec<ListingEntry<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ListingEntry<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    e_tag: &'a str,
    size: u64,
    last_modified_date_time: Option<DateTime<Utc>>,
}

fn kind(entry: &RemoteEntry) -> (&'static str, &'static str) {
    match entry.kind {
        EntryKind::File { .. } => ("file", "📄"),
        EntryKind::Folder { .. } => ("folder", "📁"),
    }
}

fn href(pathname: &str, name: &str) -> String {
    format!("{pathname}/{}", utf8_percent_encode(name, URI_COMPONENT))
}

/// The path of the folder containing `pathname`.
fn parent(pathname: &str) -> &str {
    match pathname.rsplit_once('/') {
        Some((parent, _)) if !parent.is_empty() => parent,
        _ => "/",
    }
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}

fn render_html(pathname: &str, entries: &[RemoteEntry]) -> String {
    let title = escape_html(if pathname.is_empty() { "/" } else { pathname });
    let mut rows = String::new();
    for entry in entries {
        let modified = entry
            .last_modified
            .map(|date| date.to_rfc3339_opts(SecondsFormat::Secs, true))
            .unwrap_or_default();
        let _ = write!(
            rows,
            "
				<tr>
					<td>{}</td>
					<td><a href=\"{}\">{}</a></td>
					<td>{}</td>
					<td>{modified}</td>
				</tr>",
            kind(entry).1,
            escape_html(&href(pathname, &entry.name)),
            escape_html(&entry.name),
            entry.size,
        );
    }

    format!(
        "<html lang=en>
	<head>
		<meta charset=utf-8>
		<title>File listing - {title}</title>
	</head>
	<body>
		<h2>{title}</h2>
		<hr/>
		<table>
			<thead>
				<tr>
					<th></th>
					<th>Filename</th>
					<th>Size <small>(bytes)</small></th>
					<th>Date Modified</th>
				</tr>
			</thead>
			<tbody>
				<tr>
					<td></td>
					<td><a href=\"{parent}\">..</a></td>
					<td></td>
					<td></td>
				</tr>{rows}
			</tbody>
		</table>
		<hr>
	</body>
</html>
",
        parent = escape_html(parent(pathname)),
    )
}

fn render_plain(pathname: &str, entries: &[RemoteEntry]) -> String {
    entries
        .iter()
        .map(|entry| format!("{} {}", kind(entry).0, href(pathname, &entry.name)))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Lists the folder at `pathname` in the representation the client accepts.
pub fn send_listing(
    service: &GatewayService,
    parts: &Parts,
    pathname: &str,
    entries: &[RemoteEntry],
) -> Result<Response, ResponseError> {
    if let Some(preflight) = check_static_method(&parts.method)? {
        return Ok(preflight);
    }

    let mut response = match negotiate(&parts.headers) {
        Media::Html => (
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/html; charset=utf-8"),
            )],
            render_html(pathname, entries),
        )
            .into_response(),
        Media::Plain => render_plain(pathname, entries).into_response(),
        Media::Json => Json(Listing {
            path: if pathname.is_empty() { "/" } else { pathname },
            files: entries
                .iter()
                .map(|entry| ListingEntry {
                    name: &entry.name,
                    kind: kind(entry).0,
                    e_tag: &entry.etag,
                    size: entry.size,
                    last_modified_date_time: entry.last_modified,
                })
                .collect(),
        })
        .into_response(),
    };

    let headers = response.headers_mut();
    set_vary(headers);
    headers.insert(header::CACHE_CONTROL, service.cache_control().clone());
    Ok(response)
}
