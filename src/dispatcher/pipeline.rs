use super::callback_context::{self, CallbackContext};
use super::envelope::DispatchEnvelope;
use super::graph::{CallbackGraph, ResolvedCallback};
use crate::background::{Job, JobManager, JobStatus};
use crate::backend::{ExecutionMode, MaybeAsync, RequestCx, RouteHandler};
use crate::error::{panic_message, Error, Result};
use crate::ids::RequestId;
use crate::server::{to_json_response, ActiveRequest, Response};
use futures::FutureExt;
use serde_json::{json, Value};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Query parameter a client polls a background callback with.
pub const CACHE_KEY_PARAM: &str = "cacheKey";

/// Per-invocation dispatch state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Received,
    Decoded,
    Resolved,
    Executing,
    Encoded,
    Sent,
    Failed,
}

impl DispatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchState::Received => "received",
            DispatchState::Decoded => "decoded",
            DispatchState::Resolved => "resolved",
            DispatchState::Executing => "executing",
            DispatchState::Encoded => "encoded",
            DispatchState::Sent => "sent",
            DispatchState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DispatchState::Sent | DispatchState::Failed)
    }
}

impl fmt::Display for DispatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks and logs the state transitions of one invocation.
struct Transitions {
    request_id: RequestId,
    state: DispatchState,
    started: Instant,
}

impl Transitions {
    fn new(request_id: RequestId) -> Self {
        Self {
            request_id,
            state: DispatchState::Received,
            started: Instant::now(),
        }
    }

    fn advance(&mut self, next: DispatchState) {
        debug!(
            request_id = %self.request_id,
            from = %self.state,
            to = %next,
            elapsed_us = self.started.elapsed().as_micros() as u64,
            "Dispatch transition"
        );
        self.state = next;
    }

    fn fail(&mut self, err: Error) -> Error {
        debug!(
            request_id = %self.request_id,
            from = %self.state,
            error_kind = err.kind(),
            "Dispatch failed"
        );
        self.state = DispatchState::Failed;
        err
    }
}

/// The dispatch route.
///
/// Decodes the envelope, resolves the callback through the graph, runs it
/// under its own [`CallbackContext`] and encodes the result. Every failure
/// is returned to the backend, which owns the translation to a response.
pub struct Dispatcher {
    graph: Arc<dyn CallbackGraph>,
    jobs: Option<Arc<dyn JobManager>>,
}

impl Dispatcher {
    pub fn new(graph: Arc<dyn CallbackGraph>) -> Self {
        Self { graph, jobs: None }
    }

    /// Run callbacks flagged as background through `jobs`.
    pub fn with_jobs(mut self, jobs: Arc<dyn JobManager>) -> Self {
        self.jobs = Some(jobs);
        self
    }

    /// Dispatch one request.
    ///
    /// In [`ExecutionMode::Blocking`] an awaitable callback result fails with
    /// [`Error::UnsupportedAsyncCallback`]; in async mode it is awaited under
    /// the invocation's callback context.
    pub fn dispatch(self: Arc<Self>, cx: RequestCx) -> MaybeAsync<Result<Response>> {
        let mut transitions = Transitions::new(cx.request.id());

        let envelope = match DispatchEnvelope::parse(cx.request.body()) {
            Ok(envelope) => envelope,
            Err(err) => return MaybeAsync::Ready(Err(transitions.fail(err))),
        };
        transitions.advance(DispatchState::Decoded);

        let resolved = match self.graph.resolve(&envelope) {
            Ok(resolved) => resolved,
            Err(err) => return MaybeAsync::Ready(Err(transitions.fail(err))),
        };
        transitions.advance(DispatchState::Resolved);
        debug!(
            request_id = %cx.request.id(),
            callback = %resolved.name,
            args = resolved.args.len(),
            background = resolved.background,
            "Callback resolved"
        );

        let ctx = Arc::new(CallbackContext::from_envelope(&envelope));
        if resolved.background {
            let outcome = self.background(&cx.request, &resolved, ctx, &mut transitions);
            return MaybeAsync::Ready(outcome);
        }

        transitions.advance(DispatchState::Executing);
        let callable = Arc::clone(&resolved.callable);
        let args = resolved.args.clone();
        let called = callback_context::scope(Arc::clone(&ctx), || {
            panic::catch_unwind(AssertUnwindSafe(|| callable(args)))
        });
        let outcome = match called {
            Ok(outcome) => outcome,
            Err(p) => {
                let err = Error::Panic(panic_message(p.as_ref()));
                return MaybeAsync::Ready(Err(transitions.fail(err)));
            }
        };

        match (outcome, cx.mode) {
            (MaybeAsync::Ready(result), _) => {
                MaybeAsync::Ready(self.encode(&resolved, result, &mut transitions))
            }
            (MaybeAsync::Pending(_), ExecutionMode::Blocking) => {
                let err = Error::UnsupportedAsyncCallback(resolved.name.clone());
                MaybeAsync::Ready(Err(transitions.fail(err)))
            }
            (MaybeAsync::Pending(fut), ExecutionMode::Async) => MaybeAsync::pending(async move {
                let caught = AssertUnwindSafe(fut).catch_unwind();
                let awaited = callback_context::scope_async(ctx, caught)
                    .await
                    .unwrap_or_else(|p| Err(Error::Panic(panic_message(p.as_ref()))));
                self.encode(&resolved, awaited, &mut transitions)
            }),
        }
    }

    fn encode(
        &self,
        resolved: &ResolvedCallback,
        result: Result<Value>,
        transitions: &mut Transitions,
    ) -> Result<Response> {
        let value = result.map_err(|e| transitions.fail(e))?;
        let patch = self
            .graph
            .encode_patch(resolved, value)
            .map_err(|e| transitions.fail(e))?;
        transitions.advance(DispatchState::Encoded);
        let resp = to_json_response(&patch).map_err(|e| transitions.fail(e))?;
        transitions.advance(DispatchState::Sent);
        Ok(resp)
    }

    /// Submit a background callback, or report on one when the request
    /// carries a cache key.
    fn background(
        &self,
        req: &ActiveRequest,
        resolved: &ResolvedCallback,
        ctx: Arc<CallbackContext>,
        transitions: &mut Transitions,
    ) -> Result<Response> {
        let Some(jobs) = self.jobs.as_ref() else {
            return Err(transitions.fail(Error::Registration(format!(
                "callback '{}' runs in the background but no job manager is configured",
                resolved.name
            ))));
        };

        if let Some(key) = req.query_param(CACHE_KEY_PARAM) {
            let status = jobs.poll(key).map_err(|e| transitions.fail(e))?;
            return match status {
                JobStatus::Pending { progress } => {
                    transitions.advance(DispatchState::Encoded);
                    let resp = to_json_response(&json!({"running": true, "progress": progress}))?;
                    transitions.advance(DispatchState::Sent);
                    Ok(resp)
                }
                JobStatus::Done(value) => self.encode(resolved, Ok(value), transitions),
                JobStatus::Failed(message) => {
                    Err(transitions.fail(Error::callback(anyhow::anyhow!(message))))
                }
                JobStatus::Unknown => Err(transitions.fail(Error::callback(anyhow::anyhow!(
                    "no background job for cache key '{key}'"
                )))),
            };
        }

        transitions.advance(DispatchState::Executing);
        let callable = Arc::clone(&resolved.callable);
        let args = resolved.args.clone();
        let job: Job = Box::new(move |_progress| {
            callback_context::scope(ctx, || match callable(args) {
                MaybeAsync::Ready(result) => result,
                MaybeAsync::Pending(fut) => futures::executor::block_on(fut),
            })
        });
        let key = jobs.submit(job).map_err(|e| transitions.fail(e))?;
        info!(
            request_id = %req.id(),
            callback = %resolved.name,
            job = %key,
            "Background callback submitted"
        );
        transitions.advance(DispatchState::Encoded);
        let resp = to_json_response(&json!({"cacheKey": key, "job": key}))?;
        transitions.advance(DispatchState::Sent);
        Ok(resp)
    }

    /// The dispatcher as a route handler.
    pub fn handler(self: Arc<Self>) -> RouteHandler {
        Arc::new(move |cx: RequestCx| Arc::clone(&self).dispatch(cx))
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("background_jobs", &self.jobs.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background::ThreadJobManager;
    use crate::backend::ParamVec;
    use crate::dispatcher::graph::{async_callback, callback, SimpleCallbackGraph};
    use http::Method;
    use std::time::Duration;

    fn dispatcher() -> Arc<Dispatcher> {
        let mut g = SimpleCallbackGraph::new();
        g.register(
            "b.children",
            "set_b",
            callback(|args| {
                let ctx = callback_context::current()?;
                Ok(json!(format!(
                    "{} via {}",
                    args[0].as_str().unwrap_or(""),
                    ctx.triggered_inputs[0].prop_id
                )))
            }),
        )
        .unwrap();
        g.register(
            "c.children",
            "slow",
            async_callback(|args| async move {
                tokio::task::yield_now().await;
                let ctx = callback_context::current()?;
                Ok(json!([args[0].clone(), ctx.triggered_id()]))
            }),
        )
        .unwrap();
        g.register("p.children", "boom", callback(|_| panic!("exploded")))
            .unwrap();
        g.register_background(
            "bg.children",
            "long",
            callback(|args| Ok(json!(format!("bg {}", args[0])))),
        )
        .unwrap();
        Arc::new(Dispatcher::new(Arc::new(g)).with_jobs(Arc::new(ThreadJobManager::new())))
    }

    fn cx(output: &str, mode: ExecutionMode, target: &str) -> RequestCx {
        let body = json!({
            "output": output,
            "inputs": [{"id": "a", "property": "value", "value": "hi"}],
            "changedPropIds": ["a.value"]
        });
        RequestCx {
            request: Arc::new(
                ActiveRequest::builder(Method::POST, target)
                    .header("Content-Type", "application/json")
                    .body(body.to_string())
                    .build(),
            ),
            params: ParamVec::new(),
            mode,
        }
    }

    fn ready(outcome: MaybeAsync<Result<Response>>) -> Result<Response> {
        match outcome {
            MaybeAsync::Ready(r) => r,
            MaybeAsync::Pending(_) => panic!("expected a ready outcome"),
        }
    }

    fn json_body(resp: &Response) -> Value {
        serde_json::from_slice(resp.body_bytes().unwrap()).unwrap()
    }

    #[test]
    fn test_blocking_dispatch_sees_its_context() {
        let d = dispatcher();
        let resp = ready(d.dispatch(cx("b.children", ExecutionMode::Blocking, "/u"))).unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(
            json_body(&resp),
            json!({"response": {"b": {"children": "hi via a.value"}}})
        );
        assert!(callback_context::current().is_err());
    }

    #[test]
    fn test_blocking_refuses_awaitable() {
        let d = dispatcher();
        let err = ready(d.dispatch(cx("c.children", ExecutionMode::Blocking, "/u"))).unwrap_err();
        assert!(matches!(err, Error::UnsupportedAsyncCallback(ref name) if name == "slow"));
    }

    #[tokio::test]
    async fn test_async_dispatch_awaits_under_context() {
        let d = dispatcher();
        let outcome = d.dispatch(cx("c.children", ExecutionMode::Async, "/u"));
        assert!(outcome.is_pending());
        let resp = outcome.resolve().await.unwrap();
        assert_eq!(
            json_body(&resp),
            json!({"response": {"c": {"children": ["hi", "a"]}}})
        );
    }

    #[test]
    fn test_malformed_and_panicking() {
        let d = dispatcher();
        let mut bad = cx("b.children", ExecutionMode::Blocking, "/u");
        bad.request = Arc::new(ActiveRequest::builder(Method::POST, "/u").body("{oops").build());
        assert!(matches!(
            ready(Arc::clone(&d).dispatch(bad)),
            Err(Error::MalformedEnvelope(_))
        ));
        let err = ready(d.dispatch(cx("p.children", ExecutionMode::Blocking, "/u"))).unwrap_err();
        assert!(matches!(err, Error::Panic(ref msg) if msg.contains("exploded")));
        assert!(callback_context::current().is_err());
    }

    #[test]
    fn test_background_submit_then_poll() {
        let d = dispatcher();
        let resp = ready(Arc::clone(&d).dispatch(cx("bg.children", ExecutionMode::Blocking, "/u")))
            .unwrap();
        let submitted = json_body(&resp);
        let key = submitted["cacheKey"].as_str().unwrap().to_string();
        assert_eq!(submitted["job"], json!(key));

        let mut last = Value::Null;
        for _ in 0..200 {
            let target = format!("/u?{CACHE_KEY_PARAM}={key}");
            let resp =
                ready(Arc::clone(&d).dispatch(cx("bg.children", ExecutionMode::Blocking, &target)))
                    .unwrap();
            last = json_body(&resp);
            if last.get("running").is_none() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(last, json!({"response": {"bg": {"children": "bg \"hi\""}}}));

        let target = format!("/u?{CACHE_KEY_PARAM}={key}");
        assert!(ready(d.dispatch(cx("bg.children", ExecutionMode::Blocking, &target))).is_err());
    }

    #[test]
    fn test_background_without_manager() {
        let mut g = SimpleCallbackGraph::new();
        g.register_background("x.y", "orphan", callback(|_| Ok(Value::Null)))
            .unwrap();
        let d = Arc::new(Dispatcher::new(Arc::new(g)));
        assert!(matches!(
            ready(d.dispatch(cx("x.y", ExecutionMode::Blocking, "/u"))),
            Err(Error::Registration(_))
        ));
    }

    #[test]
    fn test_states() {
        assert!(DispatchState::Sent.is_terminal());
        assert!(DispatchState::Failed.is_terminal());
        assert!(!DispatchState::Executing.is_terminal());
        assert_eq!(DispatchState::Encoded.to_string(), "encoded");
    }
}
