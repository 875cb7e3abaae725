use crate::error::{Error, Result};
use crate::ids::RequestId;
use crate::timing::TimingLedger;
use bytes::Bytes;
use http::Method;
use std::collections::HashMap;
use std::net::SocketAddr;
use tracing::debug;

/// The in-flight inbound request, as seen by handlers on every backend.
///
/// Backends build one per call through [`RequestBuilder`] and bind it to
/// the ambient context (see [`crate::context`]) for the duration of the
/// call. Header names are stored lowercase.
#[derive(Debug)]
pub struct ActiveRequest {
    id: RequestId,
    method: Method,
    path: String,
    raw_query: Option<String>,
    query: HashMap<String, String>,
    headers: HashMap<String, String>,
    cookies: HashMap<String, String>,
    body: Bytes,
    remote_addr: Option<SocketAddr>,
    scheme: String,
    timing: TimingLedger,
}

impl ActiveRequest {
    /// Start building a request from a method and a request target
    /// (`/path?query`).
    pub fn builder(method: Method, target: &str) -> RequestBuilder {
        RequestBuilder {
            method,
            target: target.to_string(),
            headers: HashMap::new(),
            body: Bytes::new(),
            remote_addr: None,
            scheme: None,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Path without the query string.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Path with the query string, always carrying a `?`.
    pub fn full_path(&self) -> String {
        format!("{}?{}", self.path, self.raw_query.as_deref().unwrap_or(""))
    }

    pub fn query(&self) -> &HashMap<String, String> {
        &self.query
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn cookies(&self) -> &HashMap<String, String> {
        &self.cookies
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn is_json(&self) -> bool {
        self.header("content-type")
            .map(|ct| {
                let mime = ct.split(';').next().unwrap_or("").trim();
                mime == "application/json" || mime.ends_with("+json")
            })
            .unwrap_or(false)
    }

    /// Decode the body as JSON; an empty body decodes to `null`.
    pub fn json(&self) -> Result<serde_json::Value> {
        if self.body.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_slice(&self.body).map_err(|e| Error::MalformedEnvelope(e.to_string()))
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        self.header("host").unwrap_or("localhost")
    }

    /// `scheme://host/`
    pub fn root(&self) -> String {
        format!("{}://{}/", self.scheme, self.host())
    }

    pub fn url(&self) -> String {
        match &self.raw_query {
            Some(q) => format!("{}://{}{}?{}", self.scheme, self.host(), self.path, q),
            None => format!("{}://{}{}", self.scheme, self.host(), self.path),
        }
    }

    pub fn origin(&self) -> Option<&str> {
        self.header("origin")
    }

    /// Per-request timing ledger read by the Server-Timing hook.
    pub fn timing(&self) -> &TimingLedger {
        &self.timing
    }
}

/// Builder used by the backends to assemble an [`ActiveRequest`].
#[derive(Debug)]
pub struct RequestBuilder {
    method: Method,
    target: String,
    headers: HashMap<String, String>,
    body: Bytes,
    remote_addr: Option<SocketAddr>,
    scheme: Option<String>,
}

impl RequestBuilder {
    /// Add a header; repeated names are joined with `, `.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .entry(name.to_ascii_lowercase())
            .and_modify(|v| {
                v.push_str(", ");
                v.push_str(value);
            })
            .or_insert_with(|| value.to_string());
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn remote_addr(mut self, addr: Option<SocketAddr>) -> Self {
        self.remote_addr = addr;
        self
    }

    pub fn scheme(mut self, scheme: &str) -> Self {
        self.scheme = Some(scheme.to_string());
        self
    }

    pub fn build(self) -> ActiveRequest {
        let (path, raw_query) = match self.target.split_once('?') {
            Some((p, q)) => (p.to_string(), Some(q.to_string())),
            None => (self.target.clone(), None),
        };
        let path = if path.is_empty() { "/".to_string() } else { path };
        let query = raw_query.as_deref().map(parse_query).unwrap_or_default();
        let cookies = parse_cookies(&self.headers);
        let inbound = self.headers.get("x-request-id").map(String::as_str);
        let id = RequestId::from_header_or_new(inbound);
        let scheme = self
            .scheme
            .or_else(|| self.headers.get("x-forwarded-proto").cloned())
            .unwrap_or_else(|| "http".to_string());

        debug!(
            request_id = %id,
            method = %self.method,
            path = %path,
            header_count = self.headers.len(),
            cookie_count = cookies.len(),
            body_size_bytes = self.body.len(),
            "Request parsed"
        );

        ActiveRequest {
            id,
            method: self.method,
            path,
            raw_query,
            query,
            headers: self.headers,
            cookies,
            body: self.body,
            remote_addr: self.remote_addr,
            scheme,
            timing: TimingLedger::new(),
        }
    }
}

/// Parse the `cookie` header of a lowercase header map.
pub fn parse_cookies(headers: &HashMap<String, String>) -> HashMap<String, String> {
    headers
        .get("cookie")
        .map(|c| {
            c.split(';')
                .filter_map(|pair| {
                    let mut parts = pair.trim().splitn(2, '=');
                    let name = parts.next()?.trim();
                    if name.is_empty() {
                        return None;
                    }
                    let value = parts.next().unwrap_or("").trim().to_string();
                    Some((name.to_string(), value))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Decode a raw query string (without the `?`).
pub fn parse_query(raw: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(raw.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}
