//! # Server-Push Streaming
//!
//! Long-running callbacks emit updates over a `text/event-stream` response
//! instead of returning a single patch.
//!
//! ## Server side
//!
//! - [`StreamRegistry`] holds [`StreamCallback`]s keyed by a deterministic
//!   [`StreamId`](crate::ids::StreamId).
//! - [`endpoint::stream_handler`] serves the streaming route: it decodes
//!   `{"content": {"sse_callback_id": ..., <params>...}}`, starts the
//!   callback with a [`StreamEmitter`] (or an [`AsyncStreamEmitter`] for
//!   async producers) and returns an [`EventStream`] body.
//! - Each emission becomes one [`ServerPushEvent`] whose data is
//!   `[token, target, payload]` plus [`STREAM_SEPARATOR`]
//!   (see [`protocol`]).
//!
//! The sync-threaded backend runs the producer to completion and writes
//! all frames as one body, and refuses async producers. The async backends
//! stream frames as they are emitted through a channel of
//! [`STREAM_BUFFER`] frames, so producers wait for the writer, and enforce
//! an idle timeout.
//!
//! ## Client side
//!
//! [`StreamReducer`] reproduces the reduction the browser performs on the
//! concatenated message.
//!
//! ```rust
//! use backplane::sse::{PropStore, StreamEntry, StreamReducer};
//! use serde_json::json;
//!
//! let mut reducer = StreamReducer::new(json!("stream"));
//! let mut store = PropStore::new();
//! let message = StreamEntry::init().encode()
//!     + &StreamEntry::running(json!("x"), json!({"v": 1})).encode();
//! assert_eq!(reducer.reduce(&message, &mut store), 2);
//! assert_eq!(store.get(&json!("x"), "v"), Some(&json!(1)));
//! ```

pub mod channel;
pub mod endpoint;
pub mod event;
pub mod protocol;
pub mod reducer;
pub mod registry;

pub use channel::{AsyncStreamEmitter, EventStream, StreamEmitter, StreamSession, STREAM_BUFFER};
pub use endpoint::{open_stream, stream_handler, StreamRequest};
pub use event::ServerPushEvent;
pub use protocol::{ControlToken, StreamEntry, STREAM_SEPARATOR};
pub use reducer::{PropSink, PropStore, StreamReducer};
pub use registry::{
    AsyncStreamProducerFn, StreamCallback, StreamErrorHandler, StreamProducer, StreamProducerFn,
    StreamRegistry,
};
