//! # Backend Capability Interface
//!
//! [`Backend`] is the contract every serving substrate implements so that
//! the dispatch pipeline, the asset server and the streaming endpoint are
//! written once. Three variants ship with the crate:
//!
//! | Kind | Module | Substrate |
//! | --- | --- | --- |
//! | [`BackendKind::SyncThreaded`] | [`threaded`] | `may_minihttp` on `may` coroutines |
//! | [`BackendKind::AsyncA`] | [`axum_backend`] | `axum` on a multi-thread tokio runtime |
//! | [`BackendKind::AsyncB`] | [`hyper_backend`] | `hyper`, one current-thread runtime per worker |
//!
//! ## Lifecycle
//!
//! 1. [`create_backend`] (the `createApplication` operation) builds an
//!    adapter from a name and a [`RunConfig`].
//! 2. Setup: routes, static mounts, hooks and error handlers are registered
//!    on the adapter. Registrations are plain values kept in an
//!    [`app::AppBuilder`].
//! 3. [`Backend::run`] freezes the registrations into an immutable
//!    [`app::App`] and starts serving; nothing can be registered afterwards.
//!
//! ## Sync and async callables
//!
//! Handlers and hooks return [`MaybeAsync`]: either a finished value or a
//! boxed future. Async variants await futures; the sync-threaded variant
//! refuses futures produced by handlers with
//! [`Error::UnsupportedAsyncCallback`](crate::error::Error::UnsupportedAsyncCallback).

pub mod app;
pub mod axum_backend;
pub mod hyper_backend;
pub mod routes;
pub mod threaded;

use crate::error::{Error, Result};
use crate::runtime_config::RuntimeConfig;
use crate::server::{ActiveRequest, Response};
use crate::traceback::TracebackRenderer;
use futures::future::BoxFuture;
use futures::FutureExt;
use http::Method;
use once_cell::sync::Lazy;
use serde_json::Value;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info};

pub use app::{App, AppBuilder};
pub use routes::{RoutePattern, Router, Segment};

/// Mutable run-configuration map of a backend adapter.
pub type RunConfig = HashMap<String, Value>;

/// Maximum number of path parameters stored inline.
pub const MAX_INLINE_PARAMS: usize = 4;

/// Path parameters captured by a route match.
pub type ParamVec = SmallVec<[(Arc<str>, String); MAX_INLINE_PARAMS]>;

/// A value that is either ready or still has to be awaited.
pub enum MaybeAsync<T> {
    Ready(T),
    Pending(BoxFuture<'static, T>),
}

impl<T: Send + 'static> MaybeAsync<T> {
    pub fn ready(value: T) -> Self {
        MaybeAsync::Ready(value)
    }

    pub fn pending<F>(fut: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        MaybeAsync::Pending(fut.boxed())
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, MaybeAsync::Pending(_))
    }

    /// Await the value if needed.
    pub async fn resolve(self) -> T {
        match self {
            MaybeAsync::Ready(v) => v,
            MaybeAsync::Pending(fut) => fut.await,
        }
    }

    /// Transform the eventual value.
    pub fn map<U, F>(self, f: F) -> MaybeAsync<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        match self {
            MaybeAsync::Ready(v) => MaybeAsync::Ready(f(v)),
            MaybeAsync::Pending(fut) => MaybeAsync::Pending(fut.map(f).boxed()),
        }
    }
}

impl<T> fmt::Debug for MaybeAsync<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaybeAsync::Ready(_) => f.write_str("MaybeAsync::Ready"),
            MaybeAsync::Pending(_) => f.write_str("MaybeAsync::Pending"),
        }
    }
}

/// How the running backend executes handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Handlers run to completion on the calling thread; futures are refused.
    Blocking,
    /// Handlers may return futures, which are awaited.
    Async,
}

/// Everything a route handler receives.
#[derive(Debug, Clone)]
pub struct RequestCx {
    pub request: Arc<ActiveRequest>,
    pub params: ParamVec,
    pub mode: ExecutionMode,
}

impl RequestCx {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.as_ref() == name)
            .map(|(_, v)| v.as_str())
    }
}

pub type RouteHandler = Arc<dyn Fn(RequestCx) -> MaybeAsync<Result<Response>> + Send + Sync>;
pub type BeforeHook = Arc<dyn Fn(Arc<ActiveRequest>) -> MaybeAsync<Result<()>> + Send + Sync>;
pub type AfterHook =
    Arc<dyn Fn(Arc<ActiveRequest>, Response) -> MaybeAsync<Result<Response>> + Send + Sync>;

/// Wrap a synchronous closure as a [`RouteHandler`].
pub fn handler<F>(f: F) -> RouteHandler
where
    F: Fn(RequestCx) -> Result<Response> + Send + Sync + 'static,
{
    Arc::new(move |cx| MaybeAsync::Ready(f(cx)))
}

/// Wrap an async closure as a [`RouteHandler`].
pub fn async_handler<F, Fut>(f: F) -> RouteHandler
where
    F: Fn(RequestCx) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response>> + Send + 'static,
{
    Arc::new(move |cx| MaybeAsync::pending(f(cx)))
}

/// Wrap a synchronous closure as a [`BeforeHook`].
pub fn before_hook<F>(f: F) -> BeforeHook
where
    F: Fn(&ActiveRequest) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(move |req| MaybeAsync::Ready(f(&req)))
}

/// Wrap a synchronous closure as an [`AfterHook`].
pub fn after_hook<F>(f: F) -> AfterHook
where
    F: Fn(&ActiveRequest, Response) -> Result<Response> + Send + Sync + 'static,
{
    Arc::new(move |req, resp| MaybeAsync::Ready(f(&req, resp)))
}

/// The three backend variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    SyncThreaded,
    AsyncA,
    AsyncB,
}

impl BackendKind {
    pub const ALL: [BackendKind; 3] = [
        BackendKind::SyncThreaded,
        BackendKind::AsyncA,
        BackendKind::AsyncB,
    ];

    /// Canonical registry name.
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::SyncThreaded => "threaded",
            BackendKind::AsyncA => "axum",
            BackendKind::AsyncB => "hyper",
        }
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        match self {
            BackendKind::SyncThreaded => ExecutionMode::Blocking,
            BackendKind::AsyncA | BackendKind::AsyncB => ExecutionMode::Async,
        }
    }

    pub fn supports_async(&self) -> bool {
        self.execution_mode() == ExecutionMode::Async
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "threaded" | "sync" | "sync-threaded" => Ok(BackendKind::SyncThreaded),
            "axum" | "async-a" => Ok(BackendKind::AsyncA),
            "hyper" | "async-b" => Ok(BackendKind::AsyncB),
            other => Err(Error::Registration(format!("unknown backend '{other}'"))),
        }
    }
}

/// An immutable route registration.
#[derive(Clone)]
pub struct RouteRegistration {
    pub pattern: RoutePattern,
    pub handler: RouteHandler,
    pub methods: Vec<Method>,
    pub endpoint: String,
    pub include_in_schema: bool,
}

impl fmt::Debug for RouteRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteRegistration")
            .field("pattern", &self.pattern)
            .field("methods", &self.methods)
            .field("endpoint", &self.endpoint)
            .field("include_in_schema", &self.include_in_schema)
            .finish()
    }
}

/// Capability interface implemented by every backend variant.
///
/// Registration methods may only be called before [`Backend::run`].
pub trait Backend: Send {
    fn kind(&self) -> BackendKind;

    /// Application name given at creation.
    fn name(&self) -> &str;

    fn config(&self) -> &RunConfig;

    fn config_mut(&mut self) -> &mut RunConfig;

    /// Register a route. The pattern is rendered in this variant's syntax.
    fn add_route(
        &mut self,
        pattern: RoutePattern,
        handler: RouteHandler,
        methods: &[Method],
        endpoint: &str,
    ) -> Result<()>;

    /// Register a route that is hidden from (or shown in) schema listings.
    fn add_route_with_schema(
        &mut self,
        pattern: RoutePattern,
        handler: RouteHandler,
        methods: &[Method],
        endpoint: &str,
        include_in_schema: bool,
    ) -> Result<()>;

    /// Serve files from `directory` under `url_prefix`.
    ///
    /// A missing directory is not an error; the mount is skipped.
    fn register_static_mount(&mut self, name: &str, url_prefix: &str, directory: &Path)
        -> Result<()>;

    /// Translate the no-op signal to 204 and the invalid-resource signal
    /// to 404.
    fn register_error_translators(&mut self);

    /// Render any other error with `renderer(secret, error)` as a 500.
    fn register_unhandled_exception_handler(
        &mut self,
        secret: Option<String>,
        renderer: TracebackRenderer,
    );

    fn before_request(&mut self, hook: BeforeHook);

    fn after_request(&mut self, hook: AfterHook);

    /// Install the Server-Timing hooks once; later calls are no-ops.
    /// Returns whether this call installed them.
    fn install_timing(&mut self) -> bool;

    fn build_response(
        &self,
        body: bytes::Bytes,
        mimetype: Option<&str>,
        content_type: Option<&str>,
    ) -> Response {
        crate::server::build_response(body, mimetype, content_type)
    }

    fn to_json_response(&self, value: &Value) -> Result<Response> {
        crate::server::to_json_response(value)
    }

    /// Registered routes, in registration order.
    fn routes(&self) -> &[RouteRegistration];

    /// Start serving. Returns once the listener is bound.
    fn run(&mut self, host: &str, port: u16, debug: bool, extra: RunConfig)
        -> Result<ServerHandle>;
}

/// Factory signature used by the backend registry.
pub type BackendFactory = Arc<dyn Fn(&str, RunConfig) -> Box<dyn Backend> + Send + Sync>;

static REGISTRY: Lazy<RwLock<HashMap<String, BackendFactory>>> = Lazy::new(|| {
    let mut map: HashMap<String, BackendFactory> = HashMap::new();
    map.insert(
        BackendKind::SyncThreaded.name().to_string(),
        Arc::new(|name: &str, config: RunConfig| -> Box<dyn Backend> {
            Box::new(threaded::ThreadedBackend::new(name, config))
        }),
    );
    map.insert(
        BackendKind::AsyncA.name().to_string(),
        Arc::new(|name: &str, config: RunConfig| -> Box<dyn Backend> {
            Box::new(axum_backend::AxumBackend::new(name, config))
        }),
    );
    map.insert(
        BackendKind::AsyncB.name().to_string(),
        Arc::new(|name: &str, config: RunConfig| -> Box<dyn Backend> {
            Box::new(hyper_backend::HyperBackend::new(name, config))
        }),
    );
    RwLock::new(map)
});

/// Register an additional backend factory under `name`.
pub fn register_backend(name: &str, factory: BackendFactory) -> Result<()> {
    let key = name.trim().to_ascii_lowercase();
    if BackendKind::from_str(&key).is_ok() {
        return Err(Error::Registration(format!(
            "backend name '{key}' is reserved"
        )));
    }
    let mut registry = REGISTRY
        .write()
        .map_err(|_| Error::Registration("backend registry poisoned".to_string()))?;
    if registry.contains_key(&key) {
        return Err(Error::Registration(format!(
            "backend '{key}' is already registered"
        )));
    }
    info!(backend = %key, "Backend registered");
    registry.insert(key, factory);
    Ok(())
}

/// Create a backend adapter by name or alias (`createApplication`).
pub fn create_backend(
    backend: &str,
    app_name: &str,
    config: RunConfig,
) -> Result<Box<dyn Backend>> {
    let key = match BackendKind::from_str(backend) {
        Ok(kind) => kind.name().to_string(),
        Err(_) => backend.trim().to_ascii_lowercase(),
    };
    let factory = {
        let registry = REGISTRY
            .read()
            .map_err(|_| Error::Registration("backend registry poisoned".to_string()))?;
        registry
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::Registration(format!("unknown backend '{backend}'")))?
    };
    debug!(backend = %key, app = %app_name, "Creating backend");
    Ok(factory(app_name, config))
}

/// Names of every registered backend, sorted.
pub fn available_backends() -> Vec<String> {
    let mut names: Vec<String> = REGISTRY
        .read()
        .map(|r| r.keys().cloned().collect())
        .unwrap_or_default();
    names.sort();
    names
}

enum Stopper {
    Coroutine(may::coroutine::JoinHandle<()>),
    Threads {
        shutdown: tokio::sync::watch::Sender<bool>,
        threads: Vec<std::thread::JoinHandle<()>>,
    },
}

/// Handle to a running server.
pub struct ServerHandle {
    addr: SocketAddr,
    kind: BackendKind,
    stopper: Stopper,
}

impl ServerHandle {
    pub(crate) fn coroutine(
        addr: SocketAddr,
        kind: BackendKind,
        handle: may::coroutine::JoinHandle<()>,
    ) -> Self {
        Self {
            addr,
            kind,
            stopper: Stopper::Coroutine(handle),
        }
    }

    pub(crate) fn threads(
        addr: SocketAddr,
        kind: BackendKind,
        shutdown: tokio::sync::watch::Sender<bool>,
        threads: Vec<std::thread::JoinHandle<()>>,
    ) -> Self {
        Self {
            addr,
            kind,
            stopper: Stopper::Threads { shutdown, threads },
        }
    }

    /// Address the server is listening on (useful with port 0).
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    /// Block until the listener accepts connections.
    pub fn wait_ready(&self) -> std::io::Result<()> {
        for _ in 0..100 {
            if TcpStream::connect(self.addr).is_ok() {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "server not ready",
        ))
    }

    /// Stop accepting connections and wait for the server to wind down.
    pub fn stop(self) {
        info!(backend = %self.kind, addr = %self.addr, "Stopping server");
        match self.stopper {
            Stopper::Coroutine(handle) => {
                // SAFETY: the accept loop holds no state that outlives cancellation.
                #[allow(unsafe_code)]
                unsafe {
                    handle.coroutine().cancel();
                }
                if handle.join().is_err() {
                    debug!("Server coroutine ended by cancellation");
                }
            }
            Stopper::Threads { shutdown, threads } => {
                if shutdown.send(true).is_err() {
                    debug!("Server already shut down");
                }
                join_threads(threads);
            }
        }
    }

    /// Block until the server exits on its own.
    pub fn join(self) {
        match self.stopper {
            Stopper::Coroutine(handle) => {
                if handle.join().is_err() {
                    debug!("Server coroutine ended by cancellation");
                }
            }
            Stopper::Threads { threads, .. } => join_threads(threads),
        }
    }
}

fn join_threads(threads: Vec<std::thread::JoinHandle<()>>) {
    for t in threads {
        if t.join().is_err() {
            tracing::error!("Server worker thread panicked");
        }
    }
}

impl fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandle")
            .field("addr", &self.addr)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Resolve `host:port`, binding a std listener so port 0 gets a real port.
pub(crate) fn bind_listener(host: &str, port: u16) -> Result<std::net::TcpListener> {
    let listener = std::net::TcpListener::bind((host, port))?;
    Ok(listener)
}

/// Largest request body the async variants buffer.
pub const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Resolves once `stop` has been signalled on the watch channel.
pub(crate) async fn shutdown_signal(mut stop: tokio::sync::watch::Receiver<bool>) {
    loop {
        let stopped = *stop.borrow();
        if stopped || stop.changed().await.is_err() {
            return;
        }
    }
}

/// Regex route table of a frozen app, patterns rendered for `kind`.
pub(crate) fn build_router(app: &App, kind: BackendKind) -> Result<Router> {
    let mut router = Router::new();
    for route in app.routes() {
        router.insert(
            &route.pattern.render(kind),
            &route.methods,
            Arc::clone(&route.handler),
            &route.endpoint,
        )?;
    }
    router.log_table();
    Ok(router)
}

/// Runtime settings, with `workers` from the run configuration taking
/// precedence over the environment.
pub(crate) fn runtime_config(config: &RunConfig) -> RuntimeConfig {
    let mut runtime = RuntimeConfig::from_env();
    if let Some(workers) = config.get("workers").and_then(Value::as_u64) {
        if workers > 0 {
            runtime.workers = workers as usize;
        }
    }
    runtime
}

/// Record the run arguments in the adapter's configuration map.
pub(crate) fn record_run_config(config: &mut RunConfig, debug: bool, extra: RunConfig) {
    config.insert("debug".to_string(), Value::Bool(debug));
    config.extend(extra);
}

/// Setup-phase methods of [`Backend`], identical for every variant. The
/// implementing type keeps its registrations in a `builder: AppBuilder`.
macro_rules! delegate_setup {
    () => {
        fn name(&self) -> &str {
            self.builder.name()
        }

        fn config(&self) -> &$crate::backend::RunConfig {
            self.builder.config()
        }

        fn config_mut(&mut self) -> &mut $crate::backend::RunConfig {
            self.builder.config_mut()
        }

        fn add_route(
            &mut self,
            pattern: $crate::backend::RoutePattern,
            handler: $crate::backend::RouteHandler,
            methods: &[http::Method],
            endpoint: &str,
        ) -> $crate::error::Result<()> {
            self.add_route_with_schema(pattern, handler, methods, endpoint, true)
        }

        fn add_route_with_schema(
            &mut self,
            pattern: $crate::backend::RoutePattern,
            handler: $crate::backend::RouteHandler,
            methods: &[http::Method],
            endpoint: &str,
            include_in_schema: bool,
        ) -> $crate::error::Result<()> {
            self.builder.add_route($crate::backend::RouteRegistration {
                pattern,
                handler,
                methods: methods.to_vec(),
                endpoint: endpoint.to_string(),
                include_in_schema,
            })
        }

        fn register_static_mount(
            &mut self,
            name: &str,
            url_prefix: &str,
            directory: &std::path::Path,
        ) -> $crate::error::Result<()> {
            self.builder.add_static_mount(name, url_prefix, directory)
        }

        fn register_error_translators(&mut self) {
            self.builder.register_error_translators();
        }

        fn register_unhandled_exception_handler(
            &mut self,
            secret: Option<String>,
            renderer: $crate::traceback::TracebackRenderer,
        ) {
            self.builder.register_unhandled_exception_handler(secret, renderer);
        }

        fn before_request(&mut self, hook: $crate::backend::BeforeHook) {
            self.builder.before_request(hook);
        }

        fn after_request(&mut self, hook: $crate::backend::AfterHook) {
            self.builder.after_request(hook);
        }

        fn install_timing(&mut self) -> bool {
            self.builder.install_timing()
        }

        fn routes(&self) -> &[$crate::backend::RouteRegistration] {
            self.builder.routes()
        }
    };
}

pub(crate) use delegate_setup;
