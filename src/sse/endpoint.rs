//! The streaming route: opens a push channel for a registered callback.

use super::channel::{AsyncStreamEmitter, EventStream, StreamEmitter};
use super::protocol::StreamEntry;
use super::registry::{
    AsyncStreamProducerFn, StreamCallback, StreamProducer, StreamProducerFn, StreamRegistry,
};
use crate::backend::{ExecutionMode, MaybeAsync, RequestCx, RouteHandler};
use crate::context;
use crate::dispatcher::callback_context::{self, CallbackContext};
use crate::error::{panic_message, Error, Result};
use crate::ids::StreamId;
use crate::server::{ActiveRequest, Response};
use futures::FutureExt;
use serde_json::{Map, Value};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Key of the callback id inside the request content.
pub const CALLBACK_ID_KEY: &str = "sse_callback_id";

/// Key of the client-side callback context inside the request content.
pub const CALLBACK_CONTEXT_KEY: &str = "callback_context";

/// Decoded body of a stream request: `{"content": {...}}`.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub callback_id: StreamId,
    pub content: Map<String, Value>,
    pub callback_context: Option<Value>,
}

impl StreamRequest {
    pub fn from_body(body: &Value) -> Result<Self> {
        let content = match body.get("content") {
            Some(Value::Object(map)) => map.clone(),
            Some(_) => {
                return Err(Error::MalformedEnvelope(
                    "stream request 'content' must be an object".to_string(),
                ))
            }
            None => {
                return Err(Error::MalformedEnvelope(
                    "stream request has no 'content'".to_string(),
                ))
            }
        };
        let callback_id = match content.get(CALLBACK_ID_KEY) {
            Some(Value::String(s)) => StreamId::from_wire(s),
            Some(Value::Object(map)) => match map.get("index") {
                Some(Value::String(s)) => StreamId::from(s.as_str()),
                Some(other) => StreamId::from(other.to_string().as_str()),
                None => {
                    return Err(Error::MalformedEnvelope(format!(
                        "'{CALLBACK_ID_KEY}' object has no index"
                    )))
                }
            },
            _ => {
                return Err(Error::MalformedEnvelope(format!(
                    "stream request has no '{CALLBACK_ID_KEY}'"
                )))
            }
        };
        let callback_context = content.get(CALLBACK_CONTEXT_KEY).cloned();
        Ok(Self {
            callback_id,
            content,
            callback_context,
        })
    }
}

/// Open a push stream for the callback named in the request body.
///
/// Unknown callback ids are an [`Error::InvalidResource`]; an async
/// callback on a blocking backend is an [`Error::UnsupportedAsyncCallback`].
pub fn open_stream(
    registry: &StreamRegistry,
    req: &Arc<ActiveRequest>,
    idle_timeout: Duration,
    mode: ExecutionMode,
) -> Result<Response> {
    let request = StreamRequest::from_body(&req.json()?)?;
    let callback = registry.get(&request.callback_id).ok_or_else(|| {
        Error::InvalidResource(format!(
            "stream callback {} is not registered",
            request.callback_id
        ))
    })?;
    if callback.is_async() && mode == ExecutionMode::Blocking {
        return Err(Error::UnsupportedAsyncCallback(callback.name().to_string()));
    }
    let args = callback.select_args(&request.content);
    let ctx = Arc::new(
        request
            .callback_context
            .as_ref()
            .map(CallbackContext::from_client)
            .unwrap_or_default(),
    );
    info!(
        callback_id = %request.callback_id,
        name = %callback.name(),
        request_id = %req.id(),
        "Stream opened"
    );

    let reset_props = callback.reset_props();
    let bound = Arc::clone(req);
    let id = request.callback_id;
    let producer = callback.producer().clone();
    let stream = match producer {
        StreamProducer::Blocking(run) => EventStream::new(id, idle_timeout, move |emitter| {
            context::scope(bound, || {
                callback_context::scope(ctx, || produce(&callback, &run, args, emitter))
            })
        }),
        StreamProducer::Async(run) => EventStream::new_async(id, idle_timeout, move |emitter| {
            let fut = produce_async(callback, run, args, emitter);
            context::scope_async(bound, callback_context::scope_async(ctx, fut))
        }),
    }
    .with_reset_props(reset_props);

    Ok(Response::new(200)
        .with_header("Content-Type", "text/event-stream")
        .with_header("Cache-Control", "no-cache")
        .with_header("X-Accel-Buffering", "no")
        .with_stream(stream))
}

/// Drive one blocking producer: `INIT`, its updates, then `DONE` or `ERROR`.
fn produce(
    callback: &StreamCallback,
    run: &StreamProducerFn,
    args: Map<String, Value>,
    emitter: StreamEmitter,
) {
    if emitter.init().is_err() {
        return;
    }
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| run(args, &emitter)))
        .unwrap_or_else(|p| Err(Error::Panic(panic_message(p.as_ref()))));
    if let Some(entry) = terminal_entry(callback, outcome) {
        if emitter.send(entry).is_err() {
            debug!(name = %callback.name(), "Terminal frame not delivered");
        }
    }
}

async fn produce_async(
    callback: Arc<StreamCallback>,
    run: AsyncStreamProducerFn,
    args: Map<String, Value>,
    emitter: AsyncStreamEmitter,
) {
    if emitter.send(StreamEntry::init()).await.is_err() {
        return;
    }
    let outcome = AssertUnwindSafe(run(args, emitter.clone()))
        .catch_unwind()
        .await
        .unwrap_or_else(|p| Err(Error::Panic(panic_message(p.as_ref()))));
    if let Some(entry) = terminal_entry(&callback, outcome) {
        if emitter.send(entry).await.is_err() {
            debug!(name = %callback.name(), "Terminal frame not delivered");
        }
    }
}

/// The `DONE` or `ERROR` entry that ends a producer run, or `None` when the
/// consumer already went away.
fn terminal_entry(callback: &StreamCallback, outcome: Result<()>) -> Option<StreamEntry> {
    match outcome {
        Ok(()) => Some(StreamEntry::done()),
        Err(Error::StreamClosed) => {
            debug!(name = %callback.name(), "Stream consumer gone, producer stopped");
            None
        }
        Err(err) => {
            warn!(
                name = %callback.name(),
                error_kind = err.kind(),
                error = %err,
                "Stream callback failed"
            );
            let (message, handle_error) = callback.describe_error(&err);
            Some(StreamEntry::error(&message, handle_error, callback.reset_props()))
        }
    }
}

/// Route handler for the streaming endpoint.
pub fn stream_handler(registry: Arc<StreamRegistry>, idle_timeout: Duration) -> RouteHandler {
    Arc::new(move |cx: RequestCx| {
        MaybeAsync::Ready(open_stream(&registry, &cx.request, idle_timeout, cx.mode))
    })
}
