//! Push channel between a stream producer and the response body.
//!
//! Frames travel through a bounded channel of [`STREAM_BUFFER`] entries. A
//! producer that runs ahead of the client waits for the downstream write:
//! [`StreamEmitter::emit`] blocks and [`AsyncStreamEmitter::emit`] suspends
//! until the writer has taken a frame.

use super::event::ServerPushEvent;
use super::protocol::StreamEntry;
use crate::error::{Error, Result};
use crate::ids::StreamId;
use bytes::Bytes;
use futures::future::{self, BoxFuture, FutureExt};
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Frames a producer may run ahead of the response writer.
pub const STREAM_BUFFER: usize = 16;

/// Server-side state of one open push channel.
#[derive(Debug)]
pub struct StreamSession {
    callback_id: StreamId,
    sequence: AtomicU64,
    open: AtomicBool,
}

impl StreamSession {
    pub fn new(callback_id: StreamId) -> Self {
        Self {
            callback_id,
            sequence: AtomicU64::new(0),
            open: AtomicBool::new(true),
        }
    }

    pub fn callback_id(&self) -> &StreamId {
        &self.callback_id
    }

    /// Number of frames written so far.
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            debug!(
                callback_id = %self.callback_id,
                frames = self.sequence(),
                "Stream session closed"
            );
        }
    }

    /// Encode an entry as the next event of this session.
    fn frame(&self, entry: &StreamEntry) -> String {
        let id = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        ServerPushEvent::new(entry.encode()).with_id(id).encode()
    }

    fn prepare(&self, entry: &StreamEntry) -> Result<String> {
        if !self.is_open() {
            return Err(Error::StreamClosed);
        }
        Ok(self.frame(entry))
    }

    fn delivered(&self, entry: &StreamEntry) {
        if entry.token.is_terminal() {
            self.close();
        }
    }

    fn consumer_gone(&self) -> Error {
        self.close();
        Error::StreamClosed
    }
}

enum Sink {
    /// Frames gathered for a single-body response.
    Buffer(Arc<Mutex<String>>),
    Channel(mpsc::Sender<String>),
}

/// Producer half of a push channel for blocking producers.
///
/// Every send fails with [`Error::StreamClosed`] once the session is closed
/// or the consumer went away, so a producer stops at its next emission.
/// Sends wait for channel capacity, so the emitter must not be used from an
/// async task; async producers get an [`AsyncStreamEmitter`].
pub struct StreamEmitter {
    sink: Sink,
    session: Arc<StreamSession>,
}

impl StreamEmitter {
    pub fn session(&self) -> &Arc<StreamSession> {
        &self.session
    }

    pub fn is_open(&self) -> bool {
        let connected = match &self.sink {
            Sink::Buffer(_) => true,
            Sink::Channel(tx) => !tx.is_closed(),
        };
        self.session.is_open() && connected
    }

    pub(crate) fn send(&self, entry: StreamEntry) -> Result<()> {
        let frame = self.session.prepare(&entry)?;
        match &self.sink {
            Sink::Buffer(body) => body
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_str(&frame),
            Sink::Channel(tx) => tx
                .blocking_send(frame)
                .map_err(|_| self.session.consumer_gone())?,
        }
        self.session.delivered(&entry);
        Ok(())
    }

    /// Push an update of `props` for component `target`.
    pub fn emit(&self, target: impl Into<Value>, props: Value) -> Result<()> {
        self.send(StreamEntry::running(target.into(), props))
    }

    pub(crate) fn init(&self) -> Result<()> {
        self.send(StreamEntry::init())
    }

}

/// Producer half of a push channel for async producers.
///
/// [`AsyncStreamEmitter::emit`] resolves once the channel has room for the
/// frame; it fails with [`Error::StreamClosed`] like [`StreamEmitter`].
#[derive(Clone)]
pub struct AsyncStreamEmitter {
    tx: mpsc::Sender<String>,
    session: Arc<StreamSession>,
}

impl AsyncStreamEmitter {
    pub fn session(&self) -> &Arc<StreamSession> {
        &self.session
    }

    pub fn is_open(&self) -> bool {
        self.session.is_open() && !self.tx.is_closed()
    }

    pub(crate) async fn send(&self, entry: StreamEntry) -> Result<()> {
        let frame = self.session.prepare(&entry)?;
        self.tx
            .send(frame)
            .await
            .map_err(|_| self.session.consumer_gone())?;
        self.session.delivered(&entry);
        Ok(())
    }

    /// Push an update of `props` for component `target`.
    pub async fn emit(&self, target: impl Into<Value>, props: Value) -> Result<()> {
        let entry = StreamEntry::running(target.into(), props);
        self.send(entry).await
    }
}

type BlockingProducer = Box<dyn FnOnce(StreamEmitter) + Send + 'static>;
type AsyncProducer =
    Box<dyn FnOnce(AsyncStreamEmitter) -> BoxFuture<'static, ()> + Send + 'static>;

enum Producer {
    Blocking(BlockingProducer),
    Async(AsyncProducer),
}

/// A lazily started push stream, carried as a response body.
///
/// The producer does not run until a backend consumes the stream:
/// [`EventStream::collect_blocking`] on the sync-threaded variant,
/// [`EventStream::into_byte_stream`] on the async ones.
pub struct EventStream {
    session: Arc<StreamSession>,
    producer: Producer,
    idle_timeout: Duration,
    reset_props: Value,
}

impl EventStream {
    pub fn new<F>(callback_id: StreamId, idle_timeout: Duration, producer: F) -> Self
    where
        F: FnOnce(StreamEmitter) + Send + 'static,
    {
        let producer = Producer::Blocking(Box::new(producer));
        Self::with_producer(callback_id, idle_timeout, producer)
    }

    /// A stream whose producer is a future, run as a task on async backends.
    pub fn new_async<F, Fut>(callback_id: StreamId, idle_timeout: Duration, producer: F) -> Self
    where
        F: FnOnce(AsyncStreamEmitter) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let producer: AsyncProducer = Box::new(move |emitter| producer(emitter).boxed());
        Self::with_producer(callback_id, idle_timeout, Producer::Async(producer))
    }

    fn with_producer(callback_id: StreamId, idle_timeout: Duration, producer: Producer) -> Self {
        Self {
            session: Arc::new(StreamSession::new(callback_id)),
            producer,
            idle_timeout,
            reset_props: Value::Object(Default::default()),
        }
    }

    /// Props echoed in the `ERROR` frame written on idle timeout.
    pub fn with_reset_props(mut self, reset_props: Value) -> Self {
        self.reset_props = reset_props;
        self
    }

    pub fn session(&self) -> &Arc<StreamSession> {
        &self.session
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn is_async(&self) -> bool {
        matches!(self.producer, Producer::Async(_))
    }

    /// Run the producer on the calling thread and return every frame as
    /// one body.
    pub fn collect_blocking(self) -> Bytes {
        let EventStream {
            session, producer, ..
        } = self;
        let body = match producer {
            Producer::Blocking(run) => {
                let body = Arc::new(Mutex::new(String::new()));
                run(StreamEmitter {
                    sink: Sink::Buffer(Arc::clone(&body)),
                    session: Arc::clone(&session),
                });
                let mut guard = body.lock().unwrap_or_else(PoisonError::into_inner);
                std::mem::take(&mut *guard)
            }
            Producer::Async(run) => {
                // Drained alongside the producer so a full channel never
                // stalls it.
                let (tx, mut rx) = mpsc::channel(STREAM_BUFFER);
                let emitter = AsyncStreamEmitter {
                    tx,
                    session: Arc::clone(&session),
                };
                let drain = async move {
                    let mut body = String::new();
                    while let Some(frame) = rx.recv().await {
                        body.push_str(&frame);
                    }
                    body
                };
                let ((), body) = futures::executor::block_on(future::join(run(emitter), drain));
                body
            }
        };
        session.close();
        Bytes::from(body)
    }

    /// Start the producer and yield frames as they arrive.
    ///
    /// Blocking producers run on the blocking pool, async ones as a task.
    /// Must be called inside a tokio runtime. If no frame arrives within the
    /// idle timeout an `ERROR` frame is written and the stream ends; the
    /// receiver is dropped, so the producer's next send fails.
    pub fn into_byte_stream(self) -> BoxStream<'static, Bytes> {
        let EventStream {
            session,
            producer,
            idle_timeout: idle,
            reset_props,
        } = self;
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        match producer {
            Producer::Blocking(run) => {
                let emitter = StreamEmitter {
                    sink: Sink::Channel(tx),
                    session: Arc::clone(&session),
                };
                tokio::task::spawn_blocking(move || run(emitter));
            }
            Producer::Async(run) => {
                let emitter = AsyncStreamEmitter {
                    tx,
                    session: Arc::clone(&session),
                };
                tokio::spawn(run(emitter));
            }
        }

        struct State {
            rx: Option<mpsc::Receiver<String>>,
            session: Arc<StreamSession>,
            idle: Duration,
            reset_props: Value,
        }

        let state = State {
            rx: Some(rx),
            session,
            idle,
            reset_props,
        };
        stream::unfold(state, |mut st| async move {
            let rx = st.rx.as_mut()?;
            let next = tokio::time::timeout(st.idle, rx.recv()).await;
            match next {
                Ok(Some(frame)) => Some((Bytes::from(frame), st)),
                Ok(None) => {
                    st.session.close();
                    None
                }
                Err(_) => {
                    warn!(
                        callback_id = %st.session.callback_id(),
                        idle_ms = st.idle.as_millis() as u64,
                        "Stream idle timeout, closing session"
                    );
                    let frame = if st.session.is_open() {
                        let entry = StreamEntry::error(
                            "stream idle timeout",
                            false,
                            st.reset_props.clone(),
                        );
                        Some(st.session.frame(&entry))
                    } else {
                        None
                    };
                    st.session.close();
                    st.rx = None;
                    frame.map(|f| (Bytes::from(f), st))
                }
            }
        })
        .boxed()
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("session", &self.session)
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn id() -> StreamId {
        StreamId::from("cb")
    }

    #[test]
    fn test_collect_blocking_orders_frames() {
        let stream = EventStream::new(id(), Duration::from_secs(1), |em| {
            em.init().unwrap();
            em.emit("x", json!({"v": 1})).unwrap();
            em.emit("x", json!({"v": 2})).unwrap();
            em.send(StreamEntry::done()).unwrap();
            assert!(matches!(em.emit("x", json!({})), Err(Error::StreamClosed)));
        });
        let session = Arc::clone(stream.session());
        let body = String::from_utf8(stream.collect_blocking().to_vec()).unwrap();
        let events = ServerPushEvent::parse_stream(&body);
        assert_eq!(events.len(), 4);
        let ids: Vec<u64> = events.iter().filter_map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        assert!(events[1].data.contains("{\"v\":1}"));
        assert!(events[3].data.contains("[DONE]"));
        assert!(!session.is_open());
    }

    #[tokio::test]
    async fn test_byte_stream_delivers_and_ends() {
        let stream = EventStream::new(id(), Duration::from_secs(5), |em| {
            em.init().unwrap();
            em.emit("x", json!(1)).unwrap();
            em.send(StreamEntry::done()).unwrap();
        });
        let chunks: Vec<Bytes> = stream.into_byte_stream().collect().await;
        assert_eq!(chunks.len(), 3);
        assert!(String::from_utf8_lossy(&chunks[2]).contains("[DONE]"));
    }

    #[tokio::test]
    async fn test_idle_timeout_writes_error_and_stops_producer() {
        let (seen_tx, seen_rx) = std::sync::mpsc::channel();
        let stream = EventStream::new(id(), Duration::from_millis(50), move |em| {
            em.init().unwrap();
            std::thread::sleep(Duration::from_millis(300));
            let _ = seen_tx.send(em.emit("x", json!(1)));
        })
        .with_reset_props(json!({"x": {"value": 0}}));
        let chunks: Vec<Bytes> = stream.into_byte_stream().collect().await;
        assert_eq!(chunks.len(), 2);
        let last = String::from_utf8_lossy(&chunks[1]).to_string();
        assert!(last.contains("stream idle timeout"));
        assert!(last.contains("\"reset_props\":{\"x\":{\"value\":0}}"));

        let late = tokio::task::spawn_blocking(move || seen_rx.recv().unwrap())
            .await
            .unwrap();
        assert!(matches!(late, Err(Error::StreamClosed)));
    }

    #[tokio::test]
    async fn test_dropped_consumer_closes_emitter() {
        let (seen_tx, seen_rx) = std::sync::mpsc::channel();
        let stream = EventStream::new(id(), Duration::from_secs(5), move |em| {
            std::thread::sleep(Duration::from_millis(50));
            let _ = seen_tx.send(em.emit("x", json!(1)));
        });
        drop(stream.into_byte_stream());
        let outcome = tokio::task::spawn_blocking(move || seen_rx.recv().unwrap())
            .await
            .unwrap();
        assert!(matches!(outcome, Err(Error::StreamClosed)));
    }

    /// Wait until `counter` stops growing and return its value.
    async fn settled(counter: &AtomicUsize) -> usize {
        let mut last = usize::MAX;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let now = counter.load(Ordering::SeqCst);
            if now == last {
                return now;
            }
            last = now;
        }
        last
    }

    #[tokio::test]
    async fn test_blocking_producer_waits_for_reader() {
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        let stream = EventStream::new(id(), Duration::from_secs(5), move |em| {
            for i in 0..10_000 {
                if em.emit("x", json!({"i": i, "pad": "x".repeat(100)})).is_err() {
                    return;
                }
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        let mut body = stream.into_byte_stream();
        assert_eq!(settled(&accepted).await, STREAM_BUFFER);

        // Reading frees room for exactly as many frames.
        for _ in 0..STREAM_BUFFER {
            assert!(body.next().await.is_some());
        }
        assert_eq!(settled(&accepted).await, 2 * STREAM_BUFFER);
        drop(body);
    }

    #[tokio::test]
    async fn test_async_producer_suspends_until_capacity() {
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        let stream = EventStream::new_async(id(), Duration::from_secs(5), move |em| async move {
            for i in 0..100 {
                if em.emit("x", json!(i)).await.is_err() {
                    return;
                }
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert!(stream.is_async());
        let body = stream.into_byte_stream();
        assert_eq!(settled(&accepted).await, STREAM_BUFFER);

        let chunks: Vec<Bytes> = body.collect().await;
        assert_eq!(chunks.len(), 100);
        assert_eq!(accepted.load(Ordering::SeqCst), 100);
        assert!(String::from_utf8_lossy(&chunks[99]).contains("99"));
    }

    #[test]
    fn test_collect_blocking_drives_async_producer() {
        let stream = EventStream::new_async(id(), Duration::from_secs(1), |em| async move {
            for i in 0..(STREAM_BUFFER * 3) {
                em.emit("x", json!(i)).await.unwrap();
            }
        });
        let body = String::from_utf8(stream.collect_blocking().to_vec()).unwrap();
        assert_eq!(ServerPushEvent::parse_stream(&body).len(), STREAM_BUFFER * 3);
    }
}
