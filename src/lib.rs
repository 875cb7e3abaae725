//! # backplane
//!
//! **backplane** is the server-side plumbing of a reactive web-application
//! framework: it serves the framework's assets, dispatches client callbacks
//! to user code and streams incremental updates back, on any of three
//! interchangeable HTTP substrates.
//!
//! ## Overview
//!
//! A browser client renders a component tree and, whenever an input
//! changes, POSTs a dispatch envelope describing the inputs, states and
//! outputs involved. The server resolves the callback registered for those
//! outputs, runs it and answers with a JSON patch. Long-running callbacks
//! can instead push a sequence of property updates over a streaming
//! response, which the client folds into its store with a small reducer.
//!
//! ## Architecture
//!
//! - **[`backend`]** - the `Backend` capability interface, the backend
//!   registry and the three variants (`may_minihttp`, `axum`, `hyper`)
//! - **[`context`]** - the per-request [`server::ActiveRequest`] binding
//! - **[`server`]** - backend-neutral request and response values
//! - **[`assets`]** - fingerprinted component-suite assets and static mounts
//! - **[`dispatcher`]** - the callback dispatch pipeline and API routes
//! - **[`sse`]** - server-push streams, their wire protocol and the client
//!   reducer
//! - **[`timing`]** - per-request Server-Timing ledger
//! - **[`background`]** - job-manager contract for background callbacks
//! - **[`traceback`]** - renderers for unhandled errors
//! - **[`application`]** - wires all of the above from an
//!   [`config::AppConfig`]
//!
//! ### Request Handling Flow
//!
//! ```mermaid
//! sequenceDiagram
//!     participant Client
//!     participant Backend as Backend variant
//!     participant Hooks as Before/after hooks
//!     participant Route as Route handler
//!     participant Graph as CallbackGraph
//!
//!     Client->>Backend: POST /_backplane-update-component
//!     Backend->>Backend: Build ActiveRequest, bind context
//!     Backend->>Hooks: before hooks (timing start, ...)
//!     Backend->>Route: dispatch(request)
//!     Route->>Graph: resolve(envelope)
//!     Graph-->>Route: callable + args
//!     Route->>Route: run callable under its CallbackContext
//!     Route->>Graph: encode_patch(result)
//!     Route-->>Backend: Response or Error
//!     Backend->>Backend: translate NoOp→204, InvalidResource→404, other→500
//!     Backend->>Hooks: after hooks (Server-Timing headers, ...)
//!     Backend-->>Client: JSON patch
//! ```
//!
//! ## Runtime Considerations
//!
//! The sync-threaded variant runs on `may` coroutines: handlers must not
//! return futures there, and the coroutine stack size is configurable via
//! `BACKPLANE_STACK_SIZE`. The async variants run on tokio and await
//! async callbacks.
//!
//! ## Quick Start
//!
//! ```no_run
//! use backplane::application::Application;
//! use backplane::config::AppConfig;
//! use backplane::dispatcher::SimpleCallbackGraph;
//! use std::sync::Arc;
//!
//! let config = AppConfig::load("config.yaml").expect("config");
//! let app = Application::new(config, Arc::new(SimpleCallbackGraph::new())).expect("app");
//! let handle = app.run().expect("server");
//! handle.join();
//! ```

pub mod application;
pub mod assets;
pub mod background;
pub mod backend;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod ids;
pub mod logging;
pub mod runtime_config;
pub mod server;
pub mod sse;
pub mod timing;
pub mod traceback;

pub use application::Application;
pub use backend::{create_backend, Backend, BackendKind, ServerHandle};
pub use config::AppConfig;
pub use error::{Error, Result};
pub use server::{ActiveRequest, Response};
