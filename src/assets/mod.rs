//! # Static Resources
//!
//! Two ways of serving files, both on top of the backend capability
//! interface only:
//!
//! - [`suites`]: component-suite resources of registered packages. Paths
//!   may carry a fingerprint ([`fingerprint`]); fingerprinted responses are
//!   cached for a year and never answered with 304, all others negotiate
//!   with a content-hash ETag.
//! - [`mount`]: plain directories mounted under a URL prefix
//!   (`registerStaticMount`).

pub mod fingerprint;
pub mod mount;
pub mod suites;

use crate::server::{build_response, ActiveRequest, Response};
use sha2::{Digest, Sha256};
use std::path::Path;

pub use fingerprint::{build_fingerprint, check_fingerprint};
pub use mount::StaticMount;
pub use suites::{serve_component_suite, Package, PackageRegistry};

/// `Cache-Control` value for fingerprinted resources.
pub const IMMUTABLE_CACHE_CONTROL: &str = "public, max-age=31536000";

/// MIME type from a file extension; `application/octet-stream` if unknown.
pub fn mime_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" | "mjs" => "application/javascript",
        "json" => "application/json",
        "map" => "application/json",
        "txt" => "text/plain",
        "csv" => "text/csv",
        "xml" => "application/xml",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "ico" => "image/x-icon",
        "webp" => "image/webp",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "wasm" => "application/wasm",
        _ => "application/octet-stream",
    }
}

/// Hex SHA-256 of the content.
pub fn content_etag(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Whether an `If-None-Match` header value matches `etag`.
///
/// Accepts `*`, comma-separated lists, quoted or bare tags and the weak
/// `W/` prefix.
pub fn etag_matches(if_none_match: &str, etag: &str) -> bool {
    if_none_match.split(',').any(|candidate| {
        let candidate = candidate.trim();
        if candidate == "*" {
            return true;
        }
        let candidate = candidate.strip_prefix("W/").unwrap_or(candidate);
        candidate.trim_matches('"') == etag
    })
}

/// 200 with an ETag, or an empty 304 when the request already holds it.
pub fn etag_response(req: &ActiveRequest, bytes: Vec<u8>, mimetype: &str) -> Response {
    let tag = content_etag(&bytes);
    let quoted = format!("\"{tag}\"");
    if req
        .header("if-none-match")
        .map(|v| etag_matches(v, &tag))
        .unwrap_or(false)
    {
        return Response::not_modified().with_header("ETag", quoted);
    }
    let mut resp = build_response(bytes, Some(mimetype), None);
    resp.add_header("ETag", quoted);
    resp
}
