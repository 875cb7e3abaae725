use crate::error::{Error, Result};
use crate::sse::EventStream;
use bytes::Bytes;
use serde::Serialize;
use std::fmt;

pub const DEFAULT_MIMETYPE: &str = "text/html";

/// Response body: either fully buffered or a server-push stream.
pub enum Body {
    Full(Bytes),
    Stream(EventStream),
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Full(b) => f.debug_tuple("Full").field(&b.len()).finish(),
            Body::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// Backend-neutral response value.
///
/// Each backend variant converts this into its native response type at
/// the very end of a call. Headers keep insertion order and may repeat
/// (`Server-Timing` is emitted once per ledger entry).
#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Body,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Body::Full(Bytes::new()),
        }
    }

    /// Plain-text response.
    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self::new(status)
            .with_header("Content-Type", "text/plain; charset=utf-8")
            .with_body(body.into())
    }

    /// Empty `204 No Content`.
    pub fn no_content() -> Self {
        Self::new(204)
    }

    /// Empty `304 Not Modified`.
    pub fn not_modified() -> Self {
        Self::new(304)
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Body::Full(body.into());
        self
    }

    pub fn with_stream(mut self, stream: EventStream) -> Self {
        self.body = Body::Stream(stream);
        self
    }

    /// Append a header, keeping existing values with the same name.
    pub fn add_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.push((name.to_string(), value.into()));
    }

    /// Replace every header with this name by a single value.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.into()));
    }

    /// First header value with this name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All header values with this name, in insertion order.
    pub fn header_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    /// Buffered body bytes; `None` for streams.
    pub fn body_bytes(&self) -> Option<&Bytes> {
        match &self.body {
            Body::Full(b) => Some(b),
            Body::Stream(_) => None,
        }
    }

    pub fn is_stream(&self) -> bool {
        matches!(self.body, Body::Stream(_))
    }
}

/// Build a response from raw data.
///
/// An explicit `content_type` wins over `mimetype`; text mimetypes get a
/// `charset=utf-8` parameter. Without either the body is served as HTML.
pub fn build_response(
    body: impl Into<Bytes>,
    mimetype: Option<&str>,
    content_type: Option<&str>,
) -> Response {
    let content_type = match (content_type, mimetype) {
        (Some(ct), _) => ct.to_string(),
        (None, Some(mt)) => with_charset(mt),
        (None, None) => with_charset(DEFAULT_MIMETYPE),
    };
    Response::new(200)
        .with_header("Content-Type", content_type)
        .with_body(body)
}

fn with_charset(mimetype: &str) -> String {
    if mimetype.starts_with("text/") && !mimetype.contains("charset") {
        format!("{mimetype}; charset=utf-8")
    } else {
        mimetype.to_string()
    }
}

/// Serialize a value as an `application/json` response.
pub fn to_json_response<T: Serialize + ?Sized>(value: &T) -> Result<Response> {
    let body = serde_json::to_vec(value).map_err(Error::callback)?;
    Ok(Response::new(200)
        .with_header("Content-Type", "application/json")
        .with_body(body))
}

/// Canonical reason phrase for a status code.
pub fn status_reason(status: u16) -> &'static str {
    http::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Unknown")
}
