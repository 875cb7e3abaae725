//! Async variant A: `axum` on a multi-thread tokio runtime.
//!
//! Routing is axum's own; request hooks, context binding and error
//! translation run in one `from_fn` middleware layer wrapped around every
//! route and the fallback. Route handlers hand their backend-neutral
//! [`Response`] back to that layer through a response extension so that
//! after-hooks see it before it is converted.

use super::app::{log_completion, App, AppBuilder};
use super::{
    bind_listener, delegate_setup, record_run_config, runtime_config, shutdown_signal, Backend,
    BackendKind, ParamVec, RequestCx, RouteHandler, RoutePattern, RunConfig, ServerHandle,
    MAX_BODY_BYTES,
};
use crate::context;
use crate::error::{Error, Result};
use crate::server::{ActiveRequest, Body, Response};
use axum::body::to_bytes;
use axum::extract::{ConnectInfo, RawPathParams, Request, State};
use axum::http::request::Parts;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::routing::{MethodFilter, MethodRouter};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Adapter serving an app with `axum`.
pub struct AxumBackend {
    builder: AppBuilder,
}

impl AxumBackend {
    pub fn new(name: &str, config: RunConfig) -> Self {
        Self {
            builder: AppBuilder::new(name, config),
        }
    }

    /// Freeze the registrations into an axum router without serving it.
    pub fn into_router(&mut self, debug: bool) -> Result<axum::Router> {
        let app = self.builder.freeze(BackendKind::AsyncA, debug);
        router(app)
    }
}

impl Backend for AxumBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::AsyncA
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
        let routes = self.into_router(debug)?;

        let listener = bind_listener(host, port)?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;

        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(runtime.workers)
            .thread_name("backplane-axum")
            .enable_all()
            .build()?;
        let (stop_tx, stop_rx) = watch::channel(false);
        let server = std::thread::Builder::new()
            .name("backplane-axum-server".to_string())
            .spawn(move || {
                rt.block_on(async move {
                    let listener = match tokio::net::TcpListener::from_std(listener) {
                        Ok(listener) => listener,
                        Err(e) => {
                            error!(error = %e, "Failed to register listener");
                            return;
                        }
                    };
                    let service = routes.into_make_service_with_connect_info::<SocketAddr>();
                    if let Err(e) = axum::serve(listener, service)
                        .with_graceful_shutdown(shutdown_signal(stop_rx))
                        .await
                    {
                        error!(error = %e, "Server error");
                    }
                    info!(backend = %BackendKind::AsyncA, "Server stopped");
                });
            })?;
        info!(
            backend = %BackendKind::AsyncA,
            addr = %addr,
            workers = runtime.workers,
            "Server started"
        );
        Ok(ServerHandle::threads(addr, BackendKind::AsyncA, stop_tx, vec![server]))
    }
}

/// Carries a route's neutral response to the pipeline layer.
#[derive(Clone)]
struct Handoff(Arc<Mutex<Option<Response>>>);

fn handoff(resp: Response) -> axum::response::Response {
    let mut out = axum::response::Response::new(axum::body::Body::empty());
    *out.status_mut() =
        StatusCode::from_u16(resp.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    out.extensions_mut()
        .insert(Handoff(Arc::new(Mutex::new(Some(resp)))));
    out
}

/// Build the axum router of a frozen app.
///
/// Registrations sharing a path are merged into one method router. axum
/// rejects some overlapping patterns by panicking; those are reported as
/// [`Error::Registration`].
pub fn router(app: Arc<App>) -> Result<axum::Router> {
    let mut by_path: BTreeMap<String, MethodRouter> = BTreeMap::new();
    let mut order: Vec<String> = Vec::new();
    for route in app.routes() {
        let path = route.pattern.render(BackendKind::AsyncA);
        let mut methods = by_path.remove(&path).unwrap_or_else(|| {
            order.push(path.clone());
            let app = Arc::clone(&app);
            MethodRouter::new().fallback(move |req: Request| {
                let app = Arc::clone(&app);
                let path = req.uri().path().to_string();
                async move { handoff(app.translate(Error::MethodNotAllowed(path))) }
            })
        });
        for method in &route.methods {
            let filter = MethodFilter::try_from(method.clone()).map_err(|_| {
                Error::Registration(format!("method {method} is not routable on {path}"))
            })?;
            methods = methods.on(
                filter,
                endpoint(
                    Arc::clone(&app),
                    Arc::clone(&route.handler),
                    route.pattern.clone(),
                ),
            );
        }
        by_path.insert(path, methods);
    }

    let mut routes = axum::Router::new();
    for path in order {
        let Some(methods) = by_path.remove(&path) else {
            continue;
        };
        routes = panic::catch_unwind(AssertUnwindSafe(move || routes.route(&path, methods)))
            .map_err(|p| {
                Error::Registration(format!(
                    "route rejected by axum: {}",
                    crate::error::panic_message(p.as_ref())
                ))
            })?;
    }

    let fallback_app = Arc::clone(&app);
    Ok(routes
        .fallback(move |req: Request| {
            let app = Arc::clone(&fallback_app);
            async move { handoff(app.translate(Error::NotFound(req.uri().path().to_string()))) }
        })
        .layer(middleware::from_fn_with_state(app, pipeline)))
}

/// An axum handler for one registration. Typed segments are validated
/// here since axum captures them as plain strings.
fn endpoint(
    app: Arc<App>,
    handler: RouteHandler,
    pattern: RoutePattern,
) -> impl Fn(RawPathParams, Request) -> BoxFuture<'static, axum::response::Response>
       + Clone
       + Send
       + Sync
       + 'static {
    move |raw: RawPathParams, req: Request| {
        let params: ParamVec = raw
            .iter()
            .map(|(k, v)| (Arc::from(k), v.to_string()))
            .collect();
        call_route(Arc::clone(&app), Arc::clone(&handler), pattern.clone(), params, req).boxed()
    }
}

async fn call_route(
    app: Arc<App>,
    handler: RouteHandler,
    pattern: RoutePattern,
    params: ParamVec,
    req: Request,
) -> axum::response::Response {
    let Some(active) = req.extensions().get::<Arc<ActiveRequest>>().cloned() else {
        return handoff(Response::text(500, "request not bound"));
    };
    if !pattern.validate(&params) {
        return handoff(app.translate(Error::NotFound(active.path().to_string())));
    }
    let cx = RequestCx {
        request: active,
        params,
        mode: app.mode(),
    };
    let resp = app
        .invoke_async(&handler, cx)
        .await
        .unwrap_or_else(|e| app.translate(e));
    handoff(resp)
}

/// The request pipeline around every route: bind, before-hooks, route,
/// after-hooks, finish.
async fn pipeline(
    State(app): State<Arc<App>>,
    req: Request,
    next: Next,
) -> axum::response::Response {
    let started = Instant::now();
    let (mut parts, body) = req.into_parts();
    let bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "Request body rejected");
            return into_axum(Response::text(413, "Payload Too Large"));
        }
    };
    let active = Arc::new(active_request(&parts, bytes.clone()));
    parts.extensions.insert(Arc::clone(&active));
    let req = Request::from_parts(parts, axum::body::Body::from(bytes));

    let call = async {
        let resp = match app.run_before_async(&active).await {
            Err(e) => app.translate(e),
            Ok(()) => take_handoff(&app, &active, next.run(req).await).await,
        };
        app.run_after_async(&active, resp).await
    };
    let resp = context::scope_async(Arc::clone(&active), call).await;
    log_completion(&active, &resp, started);
    into_axum(app.finish(&active, resp))
}

fn active_request(parts: &Parts, body: Bytes) -> ActiveRequest {
    let target = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let remote = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let mut builder = ActiveRequest::builder(parts.method.clone(), target).remote_addr(remote);
    for (name, value) in &parts.headers {
        builder = builder.header(name.as_str(), &String::from_utf8_lossy(value.as_bytes()));
    }
    builder.body(body).build()
}

/// Recover the neutral response; responses axum produced itself are
/// translated or copied.
async fn take_handoff(
    app: &App,
    active: &ActiveRequest,
    out: axum::response::Response,
) -> Response {
    if let Some(Handoff(slot)) = out.extensions().get::<Handoff>().cloned() {
        if let Some(resp) = slot.lock().ok().and_then(|mut s| s.take()) {
            return resp;
        }
    }
    match out.status() {
        StatusCode::NOT_FOUND => app.translate(Error::NotFound(active.path().to_string())),
        StatusCode::METHOD_NOT_ALLOWED => {
            app.translate(Error::MethodNotAllowed(active.path().to_string()))
        }
        status => {
            let (parts, body) = out.into_parts();
            let bytes = to_bytes(body, MAX_BODY_BYTES).await.unwrap_or_default();
            let mut resp = Response::new(status.as_u16()).with_body(bytes);
            for (name, value) in &parts.headers {
                resp.add_header(name.as_str(), String::from_utf8_lossy(value.as_bytes()));
            }
            resp
        }
    }
}

/// Convert a neutral response into an axum response.
pub(crate) fn into_axum(resp: Response) -> axum::response::Response {
    let body = match resp.body {
        Body::Full(bytes) => axum::body::Body::from(bytes),
        Body::Stream(stream) => {
            axum::body::Body::from_stream(stream.into_byte_stream().map(Ok::<_, Infallible>))
        }
    };
    let mut out = axum::response::Response::new(body);
    *out.status_mut() =
        StatusCode::from_u16(resp.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let headers = out.headers_mut();
    for (name, value) in &resp.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => warn!(header = %name, "Dropping invalid response header"),
        }
    }
    out
}
