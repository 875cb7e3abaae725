//! Async variant B: `hyper` with one single-threaded tokio runtime per
//! worker thread.
//!
//! Every worker accepts on its own clone of the listening socket and serves
//! its connections on a `LocalSet`, so a request never leaves the thread
//! that accepted it. Routing uses the crate's regex route table.

use super::app::{App, AppBuilder};
use super::routes::Router;
use super::{
    bind_listener, build_router, delegate_setup, record_run_config, runtime_config,
    shutdown_signal, Backend, BackendKind, RunConfig, ServerHandle, MAX_BODY_BYTES,
};
use crate::error::Result;
use crate::server::{ActiveRequest, Body, Response};
use bytes::Bytes;
use futures::StreamExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, Limited, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::header::{HeaderName, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::StatusCode;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

type HyperBody = UnsyncBoxBody<Bytes, Infallible>;

/// Adapter serving an app with `hyper`.
pub struct HyperBackend {
    builder: AppBuilder,
}

impl HyperBackend {
    pub fn new(name: &str, config: RunConfig) -> Self {
        Self {
            builder: AppBuilder::new(name, config),
        }
    }
}

impl Backend for HyperBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::AsyncB
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
        let app = self.builder.freeze(BackendKind::AsyncB, debug);
        let router = Arc::new(build_router(&app, BackendKind::AsyncB)?);

        let listener = bind_listener(host, port)?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        let (stop_tx, stop_rx) = watch::channel(false);

        let mut workers = Vec::with_capacity(runtime.workers);
        for worker in 0..runtime.workers {
            let listener = listener.try_clone()?;
            let app = Arc::clone(&app);
            let router = Arc::clone(&router);
            let stop = stop_rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("backplane-hyper-{worker}"))
                .spawn(move || {
                    let rt = match tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                    {
                        Ok(rt) => rt,
                        Err(e) => {
                            error!(worker, error = %e, "Failed to build worker runtime");
                            return;
                        }
                    };
                    let local = tokio::task::LocalSet::new();
                    local.block_on(&rt, accept_loop(worker, listener, app, router, stop));
                    // Let open connections drain before the thread exits.
                    rt.block_on(local);
                })?;
            workers.push(handle);
        }
        info!(
            backend = %BackendKind::AsyncB,
            addr = %addr,
            workers = runtime.workers,
            "Server started"
        );
        Ok(ServerHandle::threads(addr, BackendKind::AsyncB, stop_tx, workers))
    }
}

async fn accept_loop(
    worker: usize,
    listener: std::net::TcpListener,
    app: Arc<App>,
    router: Arc<Router>,
    stop: watch::Receiver<bool>,
) {
    let listener = match TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(e) => {
            error!(worker, error = %e, "Failed to register listener");
            return;
        }
    };
    loop {
        tokio::select! {
            _ = shutdown_signal(stop.clone()) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let app = Arc::clone(&app);
                    let router = Arc::clone(&router);
                    let conn = serve_connection(stream, peer, app, router, stop.clone());
                    tokio::task::spawn_local(conn);
                }
                Err(e) => warn!(worker, error = %e, "Accept failed"),
            },
        }
    }
    debug!(worker, "Worker stopped accepting");
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
    app: Arc<App>,
    router: Arc<Router>,
    stop: watch::Receiver<bool>,
) {
    let service = service_fn(move |req| serve(Arc::clone(&app), Arc::clone(&router), peer, req));
    let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
    tokio::pin!(conn);
    let outcome = tokio::select! {
        outcome = conn.as_mut() => outcome,
        _ = shutdown_signal(stop) => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };
    if let Err(e) = outcome {
        debug!(peer = %peer, error = %e, "Connection closed with error");
    }
}

async fn serve(
    app: Arc<App>,
    router: Arc<Router>,
    peer: SocketAddr,
    req: hyper::Request<Incoming>,
) -> std::result::Result<hyper::Response<HyperBody>, Infallible> {
    let (parts, body) = req.into_parts();
    let bytes = match Limited::new(body, MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(peer = %peer, error = %e, "Request body rejected");
            return Ok(into_hyper(Response::text(413, "Payload Too Large")));
        }
    };
    let target = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut builder = ActiveRequest::builder(parts.method.clone(), target).remote_addr(Some(peer));
    for (name, value) in &parts.headers {
        builder = builder.header(name.as_str(), &String::from_utf8_lossy(value.as_bytes()));
    }
    let active = Arc::new(builder.body(bytes).build());
    let lookup = router.route(active.method(), active.path());
    let resp = app.handle_async(active, lookup).await;
    Ok(into_hyper(resp))
}

fn into_hyper(resp: Response) -> hyper::Response<HyperBody> {
    let body = match resp.body {
        Body::Full(bytes) => Full::new(bytes).boxed_unsync(),
        Body::Stream(stream) => StreamBody::new(
            stream
                .into_byte_stream()
                .map(|chunk| Ok::<_, Infallible>(Frame::data(chunk))),
        )
        .boxed_unsync(),
    };
    let mut out = hyper::Response::new(body);
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
