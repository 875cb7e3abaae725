use super::channel::{AsyncStreamEmitter, StreamEmitter};
use crate::error::{Error, Result};
use crate::ids::StreamId;
use futures::future::{BoxFuture, FutureExt};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::info;

/// Generator body of a stream callback.
///
/// Receives the declared parameters (missing ones as `null`) and emits
/// updates until it returns. An `Err` ends the stream with an `ERROR`
/// frame.
pub type StreamProducerFn =
    Arc<dyn Fn(Map<String, Value>, &StreamEmitter) -> Result<()> + Send + Sync>;

/// Async generator body of a stream callback. Each `emit(..).await` waits
/// for the response writer.
pub type AsyncStreamProducerFn = Arc<
    dyn Fn(Map<String, Value>, AsyncStreamEmitter) -> BoxFuture<'static, Result<()>>
        + Send
        + Sync,
>;

#[derive(Clone)]
pub enum StreamProducer {
    Blocking(StreamProducerFn),
    Async(AsyncStreamProducerFn),
}

/// Maps a producer failure to a user-facing message. Returning `Some`
/// asks the client to surface the message.
pub type StreamErrorHandler = Arc<dyn Fn(&Error) -> Option<String> + Send + Sync>;

/// A registered long-running callback.
#[derive(Clone)]
pub struct StreamCallback {
    id: StreamId,
    name: String,
    params: Vec<String>,
    producer: StreamProducer,
    on_error: Option<StreamErrorHandler>,
    reset_props: Map<String, Value>,
}

impl StreamCallback {
    /// `identity` names the callback; together with `dependencies` it
    /// determines the id.
    pub fn new<S, P>(
        identity: &str,
        dependencies: &[S],
        params: &[P],
        producer: StreamProducerFn,
    ) -> Self
    where
        S: AsRef<str>,
        P: AsRef<str>,
    {
        Self::with_producer(identity, dependencies, params, StreamProducer::Blocking(producer))
    }

    /// Like [`StreamCallback::new`] with an async producer. Only the async
    /// backends can serve it.
    pub fn new_async<S, P, F, Fut>(
        identity: &str,
        dependencies: &[S],
        params: &[P],
        f: F,
    ) -> Self
    where
        S: AsRef<str>,
        P: AsRef<str>,
        F: Fn(Map<String, Value>, AsyncStreamEmitter) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let producer: AsyncStreamProducerFn = Arc::new(move |args, em| f(args, em).boxed());
        Self::with_producer(identity, dependencies, params, StreamProducer::Async(producer))
    }

    fn with_producer<S, P>(
        identity: &str,
        dependencies: &[S],
        params: &[P],
        producer: StreamProducer,
    ) -> Self
    where
        S: AsRef<str>,
        P: AsRef<str>,
    {
        Self {
            id: StreamId::derive(identity, dependencies),
            name: identity.to_string(),
            params: params.iter().map(|p| p.as_ref().to_string()).collect(),
            producer,
            on_error: None,
            reset_props: Map::new(),
        }
    }

    pub fn with_on_error(mut self, handler: StreamErrorHandler) -> Self {
        self.on_error = Some(handler);
        self
    }

    /// Props the client restores when the stream fails, keyed by component id.
    pub fn with_reset_props(mut self, reset_props: Map<String, Value>) -> Self {
        self.reset_props = reset_props;
        self
    }

    pub fn id(&self) -> &StreamId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }

    pub fn reset_props(&self) -> Value {
        Value::Object(self.reset_props.clone())
    }

    /// Keep only the declared parameters of `content`.
    pub fn select_args(&self, content: &Map<String, Value>) -> Map<String, Value> {
        self.params
            .iter()
            .map(|p| (p.clone(), content.get(p).cloned().unwrap_or(Value::Null)))
            .collect()
    }

    pub fn producer(&self) -> &StreamProducer {
        &self.producer
    }

    pub fn is_async(&self) -> bool {
        matches!(self.producer, StreamProducer::Async(_))
    }

    /// Message and `handle_error` flag for an `ERROR` frame.
    pub fn describe_error(&self, err: &Error) -> (String, bool) {
        match self.on_error.as_ref().and_then(|h| h(err)) {
            Some(message) => (message, true),
            None => (err.to_string(), false),
        }
    }
}

impl fmt::Debug for StreamCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamCallback")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("params", &self.params)
            .field("is_async", &self.is_async())
            .field("has_on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Registered stream callbacks by id.
#[derive(Debug, Default, Clone)]
pub struct StreamRegistry {
    callbacks: HashMap<StreamId, Arc<StreamCallback>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback; a second registration with the same id fails.
    pub fn register(&mut self, callback: StreamCallback) -> Result<StreamId> {
        let id = callback.id().clone();
        if let Some(existing) = self.callbacks.get(&id) {
            return Err(Error::Registration(format!(
                "stream callback id {id} with name {} is already registered (by {})",
                callback.name(),
                existing.name()
            )));
        }
        info!(
            callback_id = %id,
            name = %callback.name(),
            params = ?callback.params(),
            "Stream callback registered"
        );
        self.callbacks.insert(id.clone(), Arc::new(callback));
        Ok(id)
    }

    pub fn get(&self, id: &StreamId) -> Option<Arc<StreamCallback>> {
        self.callbacks.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}
