//! Setup-phase registry and the frozen request pipeline shared by all
//! backend variants.

use super::{
    AfterHook, BackendKind, BeforeHook, ExecutionMode, MaybeAsync, RequestCx, RouteHandler,
    RouteRegistration, RoutePattern, RunConfig,
};
use crate::assets::mount::StaticMount;
use crate::backend::routes::RouteLookup;
use crate::context;
use crate::error::{panic_message, Error, Result};
use crate::server::{ActiveRequest, Response};
use crate::timing;
use crate::traceback::{self, TracebackRenderer};
use futures::FutureExt;
use http::Method;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Header carrying the request id on every response.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Mutable registrations collected during setup.
pub struct AppBuilder {
    name: String,
    config: RunConfig,
    routes: Vec<RouteRegistration>,
    before: Vec<BeforeHook>,
    after: Vec<AfterHook>,
    translators: bool,
    exception_handler: Option<(Option<String>, TracebackRenderer)>,
    timing_installed: AtomicBool,
    frozen: bool,
}

impl AppBuilder {
    pub fn new(name: &str, config: RunConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            routes: Vec::new(),
            before: Vec::new(),
            after: Vec::new(),
            translators: false,
            exception_handler: None,
            timing_installed: AtomicBool::new(false),
            frozen: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut RunConfig {
        &mut self.config
    }

    pub fn routes(&self) -> &[RouteRegistration] {
        &self.routes
    }

    fn ensure_open(&self) -> Result<()> {
        if self.frozen {
            return Err(Error::Registration(format!(
                "app '{}' is already serving; registrations are closed",
                self.name
            )));
        }
        Ok(())
    }

    pub fn add_route(&mut self, registration: RouteRegistration) -> Result<()> {
        self.ensure_open()?;
        registration.pattern.check()?;
        if self.routes.iter().any(|r| r.endpoint == registration.endpoint) {
            return Err(Error::Registration(format!(
                "endpoint '{}' is already registered",
                registration.endpoint
            )));
        }
        debug!(
            pattern = %registration.pattern,
            endpoint = %registration.endpoint,
            methods = ?registration.methods,
            "Route registered"
        );
        self.routes.push(registration);
        Ok(())
    }

    /// Mount a static directory. Missing directories are skipped.
    pub fn add_static_mount(
        &mut self,
        name: &str,
        url_prefix: &str,
        directory: &Path,
    ) -> Result<()> {
        self.ensure_open()?;
        if !directory.is_dir() {
            debug!(
                mount = %name,
                directory = %directory.display(),
                "Static directory missing, mount skipped"
            );
            return Ok(());
        }
        let mount = Arc::new(StaticMount::new(directory));
        let handler: RouteHandler = Arc::new(move |cx: RequestCx| {
            MaybeAsync::Ready(mount.serve(&cx.request, cx.param("filename").unwrap_or("")))
        });
        self.add_route(RouteRegistration {
            pattern: RoutePattern::new(url_prefix).catch_all("filename"),
            handler,
            methods: vec![Method::GET],
            endpoint: format!("{name}.static"),
            include_in_schema: false,
        })
    }

    pub fn before_request(&mut self, hook: BeforeHook) {
        self.before.push(hook);
    }

    pub fn after_request(&mut self, hook: AfterHook) {
        self.after.push(hook);
    }

    pub fn register_error_translators(&mut self) {
        self.translators = true;
    }

    pub fn register_unhandled_exception_handler(
        &mut self,
        secret: Option<String>,
        renderer: TracebackRenderer,
    ) {
        self.exception_handler = Some((secret, renderer));
    }

    /// Install the Server-Timing hooks at most once.
    pub fn install_timing(&mut self) -> bool {
        if self.timing_installed.swap(true, Ordering::SeqCst) {
            debug!(app = %self.name, "Timing hooks already installed");
            return false;
        }
        let (before, after) = timing::hooks();
        self.before.push(before);
        self.after.push(after);
        true
    }

    /// Close registrations and produce the immutable serving pipeline.
    pub fn freeze(&mut self, kind: BackendKind, debug: bool) -> Arc<App> {
        self.frozen = true;
        info!(
            app = %self.name,
            backend = %kind,
            routes_count = self.routes.len(),
            before_hooks = self.before.len(),
            after_hooks = self.after.len(),
            "Registrations frozen"
        );
        Arc::new(App {
            name: self.name.clone(),
            kind,
            routes: self.routes.clone(),
            before: self.before.clone(),
            after: self.after.clone(),
            translators: self.translators,
            exception_handler: self.exception_handler.clone(),
            debug,
        })
    }
}

/// Frozen, shareable request pipeline.
///
/// `handle_blocking` and `handle_async` run the complete call: bind the
/// request, run before-hooks, invoke the handler, translate errors, run
/// after-hooks. The axum variant uses the individual steps from its
/// middleware instead.
pub struct App {
    name: String,
    kind: BackendKind,
    routes: Vec<RouteRegistration>,
    before: Vec<BeforeHook>,
    after: Vec<AfterHook>,
    translators: bool,
    exception_handler: Option<(Option<String>, TracebackRenderer)>,
    debug: bool,
}

impl App {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn mode(&self) -> ExecutionMode {
        self.kind.execution_mode()
    }

    pub fn routes(&self) -> &[RouteRegistration] {
        &self.routes
    }

    pub fn before_hooks(&self) -> &[BeforeHook] {
        &self.before
    }

    pub fn after_hooks(&self) -> &[AfterHook] {
        &self.after
    }

    /// Map an error to a response at the backend boundary.
    pub fn translate(&self, err: Error) -> Response {
        match &err {
            Error::NoOp if self.translators => Response::no_content(),
            Error::InvalidResource(msg) if self.translators => Response::text(404, msg.clone()),
            Error::MalformedEnvelope(_) => {
                debug!(error = %err, "Malformed dispatch envelope");
                Response::text(400, err.to_string())
            }
            Error::NotFound(_) => Response::text(404, "Not Found"),
            Error::MethodNotAllowed(_) => Response::text(405, "Method Not Allowed"),
            Error::UnsupportedAsyncCallback(_) => {
                error!(backend = %self.kind, error = %err, "Awaitable refused by backend");
                Response::text(500, err.to_string())
            }
            _ => self.unhandled(&err),
        }
    }

    fn unhandled(&self, err: &Error) -> Response {
        error!(
            backend = %self.kind,
            error_kind = err.kind(),
            error = %err,
            "Unhandled error"
        );
        let body = match &self.exception_handler {
            Some((secret, renderer)) => {
                let render = AssertUnwindSafe(|| renderer(secret.as_deref(), err));
                panic::catch_unwind(render).unwrap_or_else(|_| {
                    warn!("Traceback renderer panicked");
                    traceback::GENERIC_MESSAGE.to_string()
                })
            }
            None if self.debug => traceback::render_report(err),
            None => traceback::GENERIC_MESSAGE.to_string(),
        };
        Response::text(500, body)
    }

    pub fn run_before_blocking(&self, req: &Arc<ActiveRequest>) -> Result<()> {
        for hook in &self.before {
            let outcome = catch(|| hook(Arc::clone(req)))?;
            match outcome {
                MaybeAsync::Ready(r) => r?,
                MaybeAsync::Pending(fut) => futures::executor::block_on(fut)?,
            }
        }
        Ok(())
    }

    pub async fn run_before_async(&self, req: &Arc<ActiveRequest>) -> Result<()> {
        for hook in &self.before {
            let outcome = catch(|| hook(Arc::clone(req)))?;
            resolve_caught(outcome).await??;
        }
        Ok(())
    }

    pub fn run_after_blocking(&self, req: &Arc<ActiveRequest>, mut resp: Response) -> Response {
        for hook in &self.after {
            resp = match catch(|| hook(Arc::clone(req), resp)) {
                Ok(MaybeAsync::Ready(r)) => r.unwrap_or_else(|e| self.translate(e)),
                Ok(MaybeAsync::Pending(fut)) => {
                    futures::executor::block_on(fut).unwrap_or_else(|e| self.translate(e))
                }
                Err(e) => self.translate(e),
            };
        }
        resp
    }

    pub async fn run_after_async(&self, req: &Arc<ActiveRequest>, mut resp: Response) -> Response {
        for hook in &self.after {
            let outcome = match catch(|| hook(Arc::clone(req), resp)) {
                Ok(maybe) => resolve_caught(maybe).await,
                Err(e) => Err(e),
            };
            resp = match outcome {
                Ok(Ok(r)) => r,
                Ok(Err(e)) | Err(e) => self.translate(e),
            };
        }
        resp
    }

    /// Call a handler on the current thread, refusing futures.
    pub fn invoke_blocking(
        &self,
        handler: &RouteHandler,
        cx: RequestCx,
        endpoint: &str,
    ) -> Result<Response> {
        match catch(|| handler(cx))? {
            MaybeAsync::Ready(r) => r,
            MaybeAsync::Pending(_) => Err(Error::UnsupportedAsyncCallback(endpoint.to_string())),
        }
    }

    /// Call a handler and await its result if needed.
    pub async fn invoke_async(&self, handler: &RouteHandler, cx: RequestCx) -> Result<Response> {
        let outcome = catch(|| handler(cx))?;
        resolve_caught(outcome).await?
    }

    /// Add the headers every response carries.
    pub fn finish(&self, req: &ActiveRequest, mut resp: Response) -> Response {
        resp.set_header(REQUEST_ID_HEADER, req.id().to_string());
        resp
    }

    /// Complete call on the sync-threaded path.
    pub fn handle_blocking(&self, req: Arc<ActiveRequest>, lookup: RouteLookup) -> Response {
        let span = tracing::info_span!(
            "request",
            request_id = %req.id(),
            method = %req.method(),
            path = %req.path(),
            backend = %self.kind,
        );
        let _entered = span.enter();
        let started = std::time::Instant::now();
        let resp = context::scope(Arc::clone(&req), || {
            let resp = match self.run_before_blocking(&req) {
                Err(e) => self.translate(e),
                Ok(()) => match lookup {
                    RouteLookup::Matched {
                        handler,
                        params,
                        endpoint,
                    } => {
                        let cx = RequestCx {
                            request: Arc::clone(&req),
                            params,
                            mode: self.mode(),
                        };
                        self.invoke_blocking(&handler, cx, &endpoint)
                            .unwrap_or_else(|e| self.translate(e))
                    }
                    RouteLookup::MethodNotAllowed => {
                        self.translate(Error::MethodNotAllowed(req.path().to_string()))
                    }
                    RouteLookup::NotFound => {
                        self.translate(Error::NotFound(req.path().to_string()))
                    }
                },
            };
            self.run_after_blocking(&req, resp)
        });
        log_completion(&req, &resp, started);
        self.finish(&req, resp)
    }

    /// Complete call on the async paths.
    pub async fn handle_async(&self, req: Arc<ActiveRequest>, lookup: RouteLookup) -> Response {
        let started = std::time::Instant::now();
        let call = async {
            let resp = match self.run_before_async(&req).await {
                Err(e) => self.translate(e),
                Ok(()) => match lookup {
                    RouteLookup::Matched { handler, params, .. } => {
                        let cx = RequestCx {
                            request: Arc::clone(&req),
                            params,
                            mode: self.mode(),
                        };
                        self.invoke_async(&handler, cx)
                            .await
                            .unwrap_or_else(|e| self.translate(e))
                    }
                    RouteLookup::MethodNotAllowed => {
                        self.translate(Error::MethodNotAllowed(req.path().to_string()))
                    }
                    RouteLookup::NotFound => {
                        self.translate(Error::NotFound(req.path().to_string()))
                    }
                },
            };
            self.run_after_async(&req, resp).await
        };
        let resp = context::scope_async(Arc::clone(&req), call).await;
        log_completion(&req, &resp, started);
        self.finish(&req, resp)
    }
}

/// Run `f`, turning a panic into [`Error::Panic`].
fn catch<T>(f: impl FnOnce() -> T) -> Result<T> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|p| Error::Panic(panic_message(p.as_ref())))
}

/// Await a callable's outcome, turning a panic inside the future into
/// [`Error::Panic`].
async fn resolve_caught<T: Send + 'static>(outcome: MaybeAsync<T>) -> Result<T> {
    match outcome {
        MaybeAsync::Ready(v) => Ok(v),
        MaybeAsync::Pending(fut) => AssertUnwindSafe(fut)
            .catch_unwind()
            .await
            .map_err(|p| Error::Panic(panic_message(p.as_ref()))),
    }
}

pub(crate) fn log_completion(req: &ActiveRequest, resp: &Response, started: std::time::Instant) {
    info!(
        request_id = %req.id(),
        method = %req.method(),
        path = %req.path(),
        status = resp.status,
        streaming = resp.is_stream(),
        duration_ms = started.elapsed().as_millis() as u64,
        "Request completed"
    );
}
