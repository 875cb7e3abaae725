//! # Dispatcher Module
//!
//! The dispatch route receives a client's request to recompute outputs,
//! runs the matching callback and answers with a JSON patch.
//!
//! ## Pipeline
//!
//! Each invocation walks `Received → Decoded → Resolved → Executing →
//! Encoded → Sent`, or ends in `Failed` from any earlier state (see
//! [`DispatchState`]):
//!
//! 1. The body is decoded into a [`DispatchEnvelope`].
//! 2. The [`CallbackGraph`] resolves the callable and its positional
//!    arguments. The dispatcher never inspects the component tree.
//! 3. The callable runs under its own [`CallbackContext`]; an awaitable
//!    result is awaited on async backends and refused on the sync one.
//! 4. The graph encodes the result as a patch, written with
//!    [`to_json_response`](crate::server::to_json_response).
//!
//! Errors are returned to the backend unchanged so that its translators
//! and unhandled-exception handler decide the response.
//!
//! ## Framework Paths
//!
//! All framework routes live under the application's routes prefix:
//!
//! | Path | Method | Purpose |
//! | --- | --- | --- |
//! | [`UPDATE_COMPONENT_PATH`] | POST | callback dispatch |
//! | [`COMPONENT_SUITES_PATH`]`/{package}/{*path}` | GET | component-suite assets |
//! | [`STREAM_PATH`] | POST | server-push streams |
//!
//! Callback API routes ([`ApiRoute`]) are mounted at their own paths with
//! endpoint names starting with [`API_ENDPOINT_PREFIX`].

pub mod api;
pub mod callback_context;
pub mod envelope;
pub mod graph;
pub mod pipeline;

pub use api::{ApiFn, ApiRoute};
pub use callback_context::{CallbackContext, TriggeredInput};
pub use envelope::{DispatchEnvelope, InputSlot, OutputTarget, PropValue};
pub use graph::{
    async_callback, callback, is_no_update, no_update, CallbackFn, CallbackGraph,
    ResolvedCallback, SimpleCallbackGraph,
};
pub use pipeline::{DispatchState, Dispatcher, CACHE_KEY_PARAM};

/// Dispatch route, relative to the routes prefix.
pub const UPDATE_COMPONENT_PATH: &str = "_backplane-update-component";

/// Component-suite asset route, relative to the routes prefix.
pub const COMPONENT_SUITES_PATH: &str = "_backplane-component-suites";

/// Streaming route, relative to the routes prefix.
pub const STREAM_PATH: &str = "_backplane-update-component-sse";

/// Endpoint-name prefix of callback API routes.
pub const API_ENDPOINT_PREFIX: &str = "backplane_callback_api_";
