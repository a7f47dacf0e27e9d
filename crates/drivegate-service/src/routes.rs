//! Rewriting of request paths through per-site route and hook tables.

use std::collections::HashMap;
use std::fmt;

use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("invalid route pattern `{pattern}`")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// A single rewrite rule: the first match of `pattern` is replaced using a template.
///
/// Templates use the `$<name>`, `$1` and `$&` group references that site configurations are
/// written with.
#[derive(Clone)]
pub struct RouteRule {
    pattern: Regex,
    replacement: String,
}

impl fmt::Debug for RouteRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RouteRule")
            .field(&self.pattern.as_str())
            .field(&self.replacement)
            .finish()
    }
}

impl RouteRule {
    pub fn new(pattern: &str, template: &str) -> Result<Self, RouteError> {
        let pattern = Regex::new(pattern).map_err(|source| RouteError::InvalidPattern {
            pattern: pattern.to_owned(),
            source,
        })?;
        Ok(Self {
            pattern,
            replacement: convert_template(template),
        })
    }

    /// Rewrites the first match in `path`. Returns the path unchanged if there is none.
    pub fn apply(&self, path: &str) -> String {
        self.pattern
            .replacen(path, 1, self.replacement.as_str())
            .into_owned()
    }
}

/// Translates a replacement template into the syntax of [`Regex::replace`].
fn convert_template(template: &str) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        if let Some(tail) = after.strip_prefix('$') {
            out.push_str("$$");
            rest = tail;
        } else if let Some(tail) = after.strip_prefix('&') {
            out.push_str("${0}");
            rest = tail;
        } else if let Some((name, tail)) = after
            .strip_prefix('<')
            .and_then(|named| named.split_once('>'))
        {
            out.push_str("${");
            out.push_str(name);
            out.push('}');
            rest = tail;
        } else {
            let digits = after
                .bytes()
                .take(2)
                .take_while(u8::is_ascii_digit)
                .count();
            if digits > 0 {
                out.push_str("${");
                out.push_str(&after[..digits]);
                out.push('}');
            } else {
                // not a group reference, keep the dollar sign
                out.push_str("$$");
            }
            rest = &after[digits..];
        }
    }

    out.push_str(rest);
    out
}

/// An ordered list of [`RouteRule`]s where the first rule changing the path wins.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    rules: Vec<RouteRule>,
}

impl RouteTable {
    pub fn new(rules: Vec<RouteRule>) -> Self {
        Self { rules }
    }

    /// Compiles `(pattern, template)` pairs.
    pub fn compile<'a, I>(pairs: I) -> Result<Self, RouteError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let rules = pairs
            .into_iter()
            .map(|(pattern, template)| RouteRule::new(pattern, template))
            .collect::<Result<_, _>>()?;
        Ok(Self { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Routes a request URI (path and optional query) through this table.
    ///
    /// The path is normalized before matching, and the rewrite happens at most once.
    pub fn find_route(&self, uri: &str) -> RoutedPath {
        let mut path = normalize_path(strip_query(uri));

        for rule in &self.rules {
            let out = rule.apply(&path);
            if out != path {
                path = out;
                break;
            }
        }

        let pathname = normalize_path(strip_query(&path));
        RoutedPath { path, pathname }
    }
}

/// Named hook tables, such as `notFound`.
pub type Hooks = HashMap<String, RouteTable>;

/// The outcome of routing a request URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedPath {
    /// The rewritten path, including a query string the route may have added.
    pub path: String,
    /// The normalized path component of [`path`](Self::path), used to look up files.
    pub pathname: String,
}

fn strip_query(uri: &str) -> &str {
    let end = uri.find(['?', '#']).unwrap_or(uri.len());
    &uri[..end]
}

/// Resolves `.` and `..` segments, collapses repeated slashes and removes trailing slashes.
///
/// The root path normalizes to the empty string.
pub fn normalize_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut segments: Vec<&str> = Vec::new();

    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.last().is_some_and(|last| *last != "..") {
                    segments.pop();
                } else if !absolute {
                    segments.push("..");
                }
            }
            segment => segments.push(segment),
        }
    }

    let mut normalized = String::with_capacity(path.len());
    if absolute && !segments.is_empty() {
        normalized.push('/');
    }
    normalized.push_str(&segments.join("/"));
    normalized
}
