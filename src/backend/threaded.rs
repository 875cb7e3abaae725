//! Sync-threaded variant: `may_minihttp` serving on `may` coroutines.
//!
//! Every request runs to completion on the coroutine that accepted it.
//! Handlers that hand back a future are refused, and push streams are run to
//! completion and written as one body because the substrate buffers
//! responses.

use super::app::{App, AppBuilder, REQUEST_ID_HEADER};
use super::routes::Router;
use super::{
    bind_listener, build_router, delegate_setup, record_run_config, runtime_config, Backend,
    BackendKind, RunConfig, ServerHandle,
};
use crate::error::Result;
use crate::server::{status_reason, ActiveRequest, Body, Response};
use crate::timing;
use dashmap::DashMap;
use http::Method;
use may_minihttp::{HttpServer, HttpService, Request};
use once_cell::sync::Lazy;
use std::borrow::Cow;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Upper bound on distinct dynamic header lines kept for the substrate,
/// which only accepts `&'static str` headers.
const DYNAMIC_LINE_CAP: usize = 4096;

/// Headers whose values come from bounded sets (the MIME table, the cache
/// policies and the content hashes of served files). They never count
/// against the cap, so asset negotiation keeps working once it is reached.
const BOUNDED_HEADERS: [&str; 3] = ["content-type", "cache-control", "etag"];

static HEADER_LINES: Lazy<HeaderLines> = Lazy::new(|| HeaderLines::new(DYNAMIC_LINE_CAP));

/// Interned `'static` header lines shared by every response that sends them.
struct HeaderLines {
    lines: DashMap<String, &'static str>,
    dynamic: AtomicUsize,
    cap: usize,
    warned: AtomicBool,
}

impl HeaderLines {
    fn new(cap: usize) -> Self {
        Self {
            lines: DashMap::new(),
            dynamic: AtomicUsize::new(0),
            cap,
            warned: AtomicBool::new(false),
        }
    }

    /// The line for `name: value`, or `None` when it is dynamic and the
    /// cap is reached.
    fn line(&self, name: &str, value: &str) -> Option<&'static str> {
        let value = if name.eq_ignore_ascii_case(timing::HEADER) {
            coarse_timing(value)
        } else {
            Cow::Borrowed(value)
        };
        let line = format!("{name}: {value}");
        if let Some(existing) = self.lines.get(&line) {
            return Some(*existing);
        }
        let bounded = BOUNDED_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h));
        if !bounded && self.dynamic.fetch_add(1, Ordering::SeqCst) >= self.cap {
            self.dynamic.fetch_sub(1, Ordering::SeqCst);
            if !self.warned.swap(true, Ordering::Relaxed) {
                warn!(
                    cap = self.cap,
                    header = %name,
                    "Header line cache full, new dynamic header values are dropped"
                );
            }
            return None;
        }
        let leaked: &'static str = Box::leak(line.clone().into_boxed_str());
        Some(*self.lines.entry(line).or_insert(leaked))
    }
}

/// Round every `dur=` of a Server-Timing token to whole milliseconds, so
/// the set of distinct lines stays small.
fn coarse_timing(value: &str) -> Cow<'_, str> {
    if !value.contains("dur=") {
        return Cow::Borrowed(value);
    }
    let params: Vec<String> = value
        .split(';')
        .map(|param| match param.strip_prefix("dur=").map(str::parse::<f64>) {
            Some(Ok(ms)) => format!("dur={}", ms.round()),
            _ => param.to_string(),
        })
        .collect();
    Cow::Owned(params.join(";"))
}

/// Adapter serving an app with `may_minihttp`.
pub struct ThreadedBackend {
    builder: AppBuilder,
}

impl ThreadedBackend {
    pub fn new(name: &str, config: RunConfig) -> Self {
        Self {
            builder: AppBuilder::new(name, config),
        }
    }
}

impl Backend for ThreadedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::SyncThreaded
    }

    delegate_setup!();

    fn run(
        &mut self,
        host: &str,
        port: u16,
        debug: bool,
        extra: RunConfig,
    ) -> Result<ServerHandle> {
        record_run_config(self.builder.config_mut(), debug, extra);
        let runtime = runtime_config(self.builder.config());
        runtime.apply_to_may();

        let app = self.builder.freeze(BackendKind::SyncThreaded, debug);
        let router = Arc::new(build_router(&app, BackendKind::SyncThreaded)?);

        // The substrate binds by address; reserve the port first so that
        // port 0 resolves to a concrete one.
        let addr = bind_listener(host, port)?.local_addr()?;
        let service = ThreadedService { app, router };
        let handle = HttpServer(service).start(addr)?;
        info!(
            backend = %BackendKind::SyncThreaded,
            addr = %addr,
            workers = runtime.workers,
            stack_size = runtime.stack_size,
            "Server started"
        );
        Ok(ServerHandle::coroutine(addr, BackendKind::SyncThreaded, handle))
    }
}

#[derive(Clone)]
struct ThreadedService {
    app: Arc<App>,
    router: Arc<Router>,
}

impl HttpService for ThreadedService {
    fn call(&mut self, req: Request, rsp: &mut may_minihttp::Response) -> io::Result<()> {
        let request = match read_request(req) {
            Ok(request) => Arc::new(request),
            Err(reason) => {
                debug!(reason = %reason, "Unreadable request");
                write_response(Response::text(400, reason), rsp);
                return Ok(());
            }
        };
        let lookup = self.router.route(request.method(), request.path());
        let resp = self.app.handle_blocking(request, lookup);
        write_response(resp, rsp);
        Ok(())
    }
}

fn read_request(req: Request) -> std::result::Result<ActiveRequest, String> {
    let method = Method::from_bytes(req.method().as_bytes()).map_err(|e| e.to_string())?;
    let mut builder = ActiveRequest::builder(method, req.path());
    for h in req.headers() {
        builder = builder.header(h.name, &String::from_utf8_lossy(h.value));
    }
    let mut body = Vec::new();
    req.body()
        .read_to_end(&mut body)
        .map_err(|e| format!("failed to read body: {e}"))?;
    Ok(builder.body(body).build())
}

fn write_response(resp: Response, rsp: &mut may_minihttp::Response) {
    rsp.status_code(resp.status as usize, status_reason(resp.status));
    for (name, value) in &resp.headers {
        // The substrate writes its own length; the request id is unique per
        // response and would exhaust the header cache.
        if name.eq_ignore_ascii_case("content-length")
            || name.eq_ignore_ascii_case(REQUEST_ID_HEADER)
        {
            continue;
        }
        if let Some(line) = HEADER_LINES.line(name, value) {
            rsp.header(line);
        }
    }
    let body = match resp.body {
        Body::Full(bytes) => bytes.to_vec(),
        Body::Stream(stream) => stream.collect_blocking().to_vec(),
    };
    rsp.body_vec(body);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_lines_are_shared() {
        let lines = HeaderLines::new(8);
        let a = lines.line("X-Test", "one").unwrap();
        let b = lines.line("X-Test", "one").unwrap();
        assert!(std::ptr::eq(a, b));
        assert_eq!(a, "X-Test: one");
    }

    #[test]
    fn test_full_cache_keeps_asset_headers() {
        let lines = HeaderLines::new(16);
        for i in 0..(16 + 10) {
            lines.line("Server-Timing", &format!("__server;dur={i}"));
        }
        assert!(lines.line("Server-Timing", "__server;dur=999").is_none());
        assert!(lines.line("X-Other", "late").is_none());

        assert_eq!(lines.line("ETag", "\"abc123\""), Some("ETag: \"abc123\""));
        assert!(lines.line("Cache-Control", "public, max-age=31536000").is_some());
        assert!(lines.line("Content-Type", "text/css; charset=utf-8").is_some());
        // Lines seen before the cap filled keep being served.
        assert_eq!(
            lines.line("Server-Timing", "__server;dur=3"),
            Some("Server-Timing: __server;dur=3")
        );
    }

    #[test]
    fn test_timing_durations_are_rounded() {
        assert_eq!(coarse_timing("db;desc=\"q\";dur=4.37"), "db;desc=\"q\";dur=4");
        assert_eq!(coarse_timing("__server;dur=12"), "__server;dur=12");
        assert_eq!(coarse_timing("mark"), "mark");

        let lines = HeaderLines::new(4);
        assert_eq!(
            lines.line("server-timing", "render;dur=1.6"),
            Some("server-timing: render;dur=2")
        );
        assert!(std::ptr::eq(
            lines.line("server-timing", "render;dur=2.4").unwrap(),
            lines.line("server-timing", "render;dur=2").unwrap()
        ));
    }
}
