//! Route patterns and the regex route table.
//!
//! Framework code describes routes once as a [`RoutePattern`]; each backend
//! renders it in the syntax of its substrate:
//!
//! | Segment | threaded | axum | hyper |
//! | --- | --- | --- | --- |
//! | string capture | `<string:name>` | `{name}` | `{name}` |
//! | integer capture | `<int:name>` | `{name}` | `{name:int}` |
//! | trailing wildcard | `<path:name>` | `{*name}` | `{name:path}` |
//!
//! The threaded and hyper variants have no router of their own, so they
//! compile their rendered patterns into a [`Router`]. The axum variant
//! hands its rendering to `axum::Router` and re-checks integer captures
//! with [`RoutePattern::validate`].

use super::{BackendKind, ParamVec, RouteHandler};
use crate::error::{Error, Result};
use http::Method;
use regex::Regex;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// One path segment of a [`RoutePattern`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Param(String),
    IntParam(String),
    /// Matches the rest of the path, slashes included. Always last.
    CatchAll(String),
}

/// Backend-neutral route pattern.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RoutePattern {
    segments: Vec<Segment>,
}

impl RoutePattern {
    /// Start from a literal path such as `/_backplane-component-suites`.
    pub fn new(path: &str) -> Self {
        let segments = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| Segment::Literal(s.to_string()))
            .collect();
        Self { segments }
    }

    pub fn root() -> Self {
        Self::default()
    }

    pub fn literal(mut self, s: &str) -> Self {
        self.segments.extend(
            s.split('/')
                .filter(|p| !p.is_empty())
                .map(|p| Segment::Literal(p.to_string())),
        );
        self
    }

    pub fn param(mut self, name: &str) -> Self {
        self.segments.push(Segment::Param(name.to_string()));
        self
    }

    pub fn int_param(mut self, name: &str) -> Self {
        self.segments.push(Segment::IntParam(name.to_string()));
        self
    }

    pub fn catch_all(mut self, name: &str) -> Self {
        self.segments.push(Segment::CatchAll(name.to_string()));
        self
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Names of all captures, in order.
    pub fn param_names(&self) -> Vec<&str> {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Literal(_) => None,
                Segment::Param(n) | Segment::IntParam(n) | Segment::CatchAll(n) => {
                    Some(n.as_str())
                }
            })
            .collect()
    }

    /// Reject patterns with a wildcard anywhere but the end, or duplicate
    /// capture names.
    pub fn check(&self) -> Result<()> {
        let last = self.segments.len().saturating_sub(1);
        for (i, seg) in self.segments.iter().enumerate() {
            if matches!(seg, Segment::CatchAll(_)) && i != last {
                return Err(Error::Registration(format!(
                    "wildcard must be the last segment of {self}"
                )));
            }
        }
        let mut names = self.param_names();
        names.sort_unstable();
        if names.windows(2).any(|w| w[0] == w[1]) {
            return Err(Error::Registration(format!(
                "duplicate capture name in {self}"
            )));
        }
        Ok(())
    }

    /// Render in the syntax of `kind`.
    pub fn render(&self, kind: BackendKind) -> String {
        if self.segments.is_empty() {
            return "/".to_string();
        }
        let mut out = String::new();
        for seg in &self.segments {
            out.push('/');
            let rendered = match (kind, seg) {
                (_, Segment::Literal(s)) => s.clone(),
                (BackendKind::SyncThreaded, Segment::Param(n)) => format!("<string:{n}>"),
                (BackendKind::SyncThreaded, Segment::IntParam(n)) => format!("<int:{n}>"),
                (BackendKind::SyncThreaded, Segment::CatchAll(n)) => format!("<path:{n}>"),
                (BackendKind::AsyncA, Segment::Param(n) | Segment::IntParam(n)) => {
                    format!("{{{n}}}")
                }
                (BackendKind::AsyncA, Segment::CatchAll(n)) => format!("{{*{n}}}"),
                (BackendKind::AsyncB, Segment::Param(n)) => format!("{{{n}}}"),
                (BackendKind::AsyncB, Segment::IntParam(n)) => format!("{{{n}:int}}"),
                (BackendKind::AsyncB, Segment::CatchAll(n)) => format!("{{{n}:path}}"),
            };
            out.push_str(&rendered);
        }
        out
    }

    /// Check captured values against typed segments.
    pub fn validate(&self, params: &ParamVec) -> bool {
        self.segments.iter().all(|seg| match seg {
            Segment::IntParam(n) => params
                .iter()
                .find(|(k, _)| k.as_ref() == n)
                .map(|(_, v)| !v.is_empty() && v.bytes().all(|b| b.is_ascii_digit()))
                .unwrap_or(false),
            _ => true,
        })
    }
}

impl fmt::Display for RoutePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Neutral form, used in logs only.
        f.write_str(&self.render(BackendKind::AsyncB))
    }
}

/// Convert a rendered pattern (`<conv:name>` or `{name[:conv]}`) into a
/// regex and its ordered capture names.
pub fn path_to_regex(path: &str) -> Result<(Regex, Vec<Arc<str>>)> {
    if path == "/" {
        return Regex::new(r"^/$")
            .map(|r| (r, Vec::new()))
            .map_err(|e| Error::Registration(e.to_string()));
    }

    let mut pattern = String::with_capacity(path.len() + 8);
    pattern.push('^');
    let mut names: Vec<Arc<str>> = Vec::new();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let last = segments.len().saturating_sub(1);

    for (i, segment) in segments.iter().enumerate() {
        pattern.push('/');
        let angled = segment.strip_prefix('<').and_then(|s| s.strip_suffix('>'));
        let capture = if let Some(inner) = angled {
            // <converter:name> or <name>
            Some(match inner.split_once(':') {
                Some((conv, name)) => (conv, name),
                None => ("string", inner),
            })
        } else if let Some(inner) = segment.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
            // {name:converter}, {*name} or {name}
            Some(match inner.split_once(':') {
                Some((name, conv)) => (conv, name),
                None => match inner.strip_prefix('*') {
                    Some(name) => ("path", name),
                    None => ("string", inner),
                },
            })
        } else {
            None
        };

        match capture {
            Some((conv, name)) => {
                let group = match conv {
                    "string" | "str" => "([^/]+)",
                    "int" => r"(\d+)",
                    "path" if i == last => "(.+)",
                    "path" => {
                        return Err(Error::Registration(format!(
                            "wildcard must be the last segment of {path}"
                        )))
                    }
                    other => {
                        return Err(Error::Registration(format!(
                            "unknown converter '{other}' in {path}"
                        )))
                    }
                };
                pattern.push_str(group);
                names.push(Arc::from(name));
            }
            None => pattern.push_str(&regex::escape(segment)),
        }
    }

    pattern.push('$');
    let regex = Regex::new(&pattern).map_err(|e| Error::Registration(e.to_string()))?;
    Ok((regex, names))
}

struct RouteEntry {
    pattern: String,
    regex: Regex,
    param_names: Vec<Arc<str>>,
    methods: Vec<Method>,
    handler: RouteHandler,
    endpoint: String,
}

/// Outcome of [`Router::route`].
pub enum RouteLookup {
    Matched {
        handler: RouteHandler,
        params: ParamVec,
        endpoint: String,
    },
    MethodNotAllowed,
    NotFound,
}

/// Regex route table; first registration wins.
#[derive(Default)]
pub struct Router {
    entries: Vec<RouteEntry>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a route from its rendered pattern.
    pub fn insert(
        &mut self,
        rendered: &str,
        methods: &[Method],
        handler: RouteHandler,
        endpoint: &str,
    ) -> Result<()> {
        let (regex, param_names) = path_to_regex(rendered)?;
        self.entries.push(RouteEntry {
            pattern: rendered.to_string(),
            regex,
            param_names,
            methods: methods.to_vec(),
            handler,
            endpoint: endpoint.to_string(),
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn log_table(&self) {
        let summary: Vec<String> = self
            .entries
            .iter()
            .take(20)
            .map(|e| format!("{:?} {} -> {}", e.methods, e.pattern, e.endpoint))
            .collect();
        info!(
            routes_count = self.entries.len(),
            routes_summary = ?summary,
            "Routing table loaded"
        );
    }

    pub fn route(&self, method: &Method, path: &str) -> RouteLookup {
        let start = Instant::now();
        let mut path_matched = false;
        for entry in &self.entries {
            let Some(caps) = entry.regex.captures(path) else {
                continue;
            };
            // HEAD is served by GET routes.
            let allowed = entry.methods.contains(method)
                || (*method == Method::HEAD && entry.methods.contains(&Method::GET));
            if !allowed {
                path_matched = true;
                continue;
            }
            let mut params = ParamVec::new();
            for (i, name) in entry.param_names.iter().enumerate() {
                if let Some(m) = caps.get(i + 1) {
                    params.push((Arc::clone(name), decode_segment(m.as_str())));
                }
            }
            let elapsed = start.elapsed();
            if elapsed > Duration::from_millis(1) {
                warn!(
                    method = %method,
                    path = %path,
                    endpoint = %entry.endpoint,
                    duration_us = elapsed.as_micros(),
                    "Slow route matching detected"
                );
            } else {
                debug!(
                    method = %method,
                    path = %path,
                    endpoint = %entry.endpoint,
                    route_pattern = %entry.pattern,
                    path_params = ?params,
                    "Route matched"
                );
            }
            return RouteLookup::Matched {
                handler: Arc::clone(&entry.handler),
                params,
                endpoint: entry.endpoint.clone(),
            };
        }
        if path_matched {
            debug!(method = %method, path = %path, "Method not allowed");
            RouteLookup::MethodNotAllowed
        } else {
            debug!(method = %method, path = %path, "No route matched");
            RouteLookup::NotFound
        }
    }
}

fn decode_segment(raw: &str) -> String {
    percent_decode(raw).unwrap_or_else(|| raw.to_string())
}

/// Percent-decode a path capture; `None` when the result is not UTF-8.
fn percent_decode(raw: &str) -> Option<String> {
    if !raw.contains('%') {
        return Some(raw.to_string());
    }
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok()?;
            if let Ok(b) = u8::from_str_radix(hex, 16) {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8(out).ok()
}
