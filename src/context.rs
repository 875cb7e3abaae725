//! # Request Context
//!
//! Ambient access to "the request currently being handled" without
//! threading it through every call.
//!
//! Two storage layers back the binding:
//!
//! - **Task-local** (`tokio::task_local!`) for the async backends. A task
//!   is the unit of concurrency there, so two requests interleaved on one
//!   worker thread never see each other's binding. [`scope_async`] is the
//!   only way in.
//! - **Coroutine-local** (`may::coroutine_local!`) for the sync-threaded
//!   backend, which falls back to thread-local storage outside a
//!   coroutine (blocking pools, plain threads, tests). [`bind`] and
//!   [`unbind`] manage a stack of bindings so nested calls restore the
//!   outer request when they finish.
//!
//! [`current`] consults the task-local first and the coroutine-local
//! stack second.
//!
//! ```rust
//! use backplane::context;
//! use backplane::server::ActiveRequest;
//! use std::sync::Arc;
//!
//! let req = Arc::new(ActiveRequest::builder(http::Method::GET, "/x").build());
//! let path = context::scope(req, || context::current().map(|r| r.path().to_string()));
//! assert_eq!(path.unwrap(), "/x");
//! assert!(context::current().is_err());
//! ```

use crate::error::ContextError;
use crate::server::ActiveRequest;
use std::cell::RefCell;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    static TASK_REQUEST: Arc<ActiveRequest>;
}

may::coroutine_local!(
    static LOCAL_REQUESTS: RefCell<Vec<(u64, Arc<ActiveRequest>)>> = RefCell::new(Vec::new())
);

/// Proof of a binding made by [`bind`]; pass it back to [`unbind`].
#[derive(Debug)]
#[must_use = "a binding stays active until its token is passed to unbind"]
pub struct BindToken {
    id: u64,
}

impl BindToken {
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Bind `request` to the current coroutine or thread.
pub fn bind(request: Arc<ActiveRequest>) -> BindToken {
    let id = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
    LOCAL_REQUESTS.with(|stack| stack.borrow_mut().push((id, request)));
    BindToken { id }
}

/// Release the binding created with `token`.
///
/// Only that binding is removed, even if other bindings were pushed on top
/// of it in the meantime.
pub fn unbind(token: BindToken) -> Result<(), ContextError> {
    LOCAL_REQUESTS.with(|stack| {
        let mut stack = stack.borrow_mut();
        match stack.iter().rposition(|(id, _)| *id == token.id) {
            Some(pos) => {
                stack.remove(pos);
                Ok(())
            }
            None => Err(ContextError::ForeignToken { token: token.id }),
        }
    })
}

/// The request bound to the current logical call.
pub fn current() -> Result<Arc<ActiveRequest>, ContextError> {
    if let Ok(req) = TASK_REQUEST.try_with(Arc::clone) {
        return Ok(req);
    }
    LOCAL_REQUESTS.with(|stack| {
        stack
            .borrow()
            .last()
            .map(|(_, req)| Arc::clone(req))
            .ok_or(ContextError::Unbound)
    })
}

/// Whether any request is bound to the current logical call.
pub fn is_bound() -> bool {
    current().is_ok()
}

/// RAII binding: unbinds on drop, including during unwinding.
#[derive(Debug)]
pub struct BindGuard {
    token: Option<BindToken>,
}

impl BindGuard {
    pub fn new(request: Arc<ActiveRequest>) -> Self {
        Self {
            token: Some(bind(request)),
        }
    }
}

impl Drop for BindGuard {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            if let Err(e) = unbind(token) {
                tracing::error!(error = %e, "Request context unbind failed");
            }
        }
    }
}

/// Run `f` with `request` bound, releasing the binding on every exit path.
pub fn scope<R>(request: Arc<ActiveRequest>, f: impl FnOnce() -> R) -> R {
    let _guard = BindGuard::new(request);
    f()
}

/// Run `fut` with `request` bound to the enclosing task.
pub async fn scope_async<F: Future>(request: Arc<ActiveRequest>, fut: F) -> F::Output {
    TASK_REQUEST.scope(request, fut).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;

    fn request(path: &str) -> Arc<ActiveRequest> {
        Arc::new(ActiveRequest::builder(Method::GET, path).build())
    }

    #[test]
    fn test_unbound_is_error() {
        assert_eq!(current().unwrap_err(), ContextError::Unbound);
    }

    #[test]
    fn test_repeated_bind_unbind_leaves_no_residue() {
        for i in 0..50 {
            let token = bind(request(&format!("/r{i}")));
            assert_eq!(current().unwrap().path(), format!("/r{i}"));
            unbind(token).unwrap();
        }
        assert!(!is_bound());
    }

    #[test]
    fn test_nested_binding_restores_outer() {
        let outer = bind(request("/outer"));
        let inner = bind(request("/inner"));
        assert_eq!(current().unwrap().path(), "/inner");
        unbind(inner).unwrap();
        assert_eq!(current().unwrap().path(), "/outer");
        unbind(outer).unwrap();
        assert!(!is_bound());
    }

    #[test]
    fn test_unbind_only_clears_own_binding() {
        let first = bind(request("/first"));
        let second = bind(request("/second"));
        unbind(first).unwrap();
        assert_eq!(current().unwrap().path(), "/second");
        unbind(second).unwrap();
    }

    #[test]
    fn test_foreign_token_is_rejected() {
        let token = bind(request("/a"));
        let id = token.id();
        unbind(token).unwrap();
        let err = unbind(BindToken { id }).unwrap_err();
        assert_eq!(err, ContextError::ForeignToken { token: id });
    }

    #[test]
    fn test_scope_releases_on_panic() {
        let result = std::panic::catch_unwind(|| {
            scope(request("/boom"), || {
                panic!("handler failed");
            })
        });
        assert!(result.is_err());
        assert!(!is_bound());
    }

    #[test]
    fn test_threads_do_not_share_bindings() {
        let handles: Vec<_> = (0..8)
            .map(|i| {
                std::thread::spawn(move || {
                    scope(request(&format!("/t{i}")), || {
                        std::thread::yield_now();
                        current().unwrap().path().to_string()
                    })
                })
            })
            .collect();
        for (i, h) in handles.into_iter().enumerate() {
            assert_eq!(h.join().unwrap(), format!("/t{i}"));
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_interleaved_tasks_on_one_thread() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let tasks: Vec<_> = (0..16)
                    .map(|i| {
                        let req = request(&format!("/task{i}"));
                        tokio::task::spawn_local(scope_async(req, async move {
                            tokio::task::yield_now().await;
                            let seen = current().unwrap().path().to_string();
                            tokio::task::yield_now().await;
                            (i, seen)
                        }))
                    })
                    .collect();
                for t in tasks {
                    let (i, seen) = t.await.unwrap();
                    assert_eq!(seen, format!("/task{i}"));
                }
            })
            .await;
        assert!(!is_bound());
    }
}
