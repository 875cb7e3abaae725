//! Callback API routes: plain JSON endpoints backed by a callback.

use super::API_ENDPOINT_PREFIX;
use crate::backend::{
    ExecutionMode, MaybeAsync, RequestCx, RouteHandler, RoutePattern, RouteRegistration,
};
use crate::error::{Error, Result};
use crate::server::{to_json_response, Response};
use http::Method;
use serde_json::{Map, Value};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

pub type ApiFn = Arc<dyn Fn(Map<String, Value>) -> MaybeAsync<Result<Value>> + Send + Sync>;

/// A POST endpoint whose JSON body is passed to a callback as named
/// arguments.
#[derive(Clone)]
pub struct ApiRoute {
    path: String,
    params: Vec<String>,
    handler: ApiFn,
}

impl ApiRoute {
    pub fn new<P: AsRef<str>>(path: &str, params: &[P], handler: ApiFn) -> Self {
        Self {
            path: path.to_string(),
            params: params.iter().map(|p| p.as_ref().to_string()).collect(),
            handler,
        }
    }

    /// Route backed by a synchronous closure.
    pub fn sync<P, F>(path: &str, params: &[P], f: F) -> Self
    where
        P: AsRef<str>,
        F: Fn(Map<String, Value>) -> Result<Value> + Send + Sync + 'static,
    {
        Self::new(path, params, Arc::new(move |args| MaybeAsync::Ready(f(args))))
    }

    /// Route backed by an async closure.
    pub fn asynchronous<P, F, Fut>(path: &str, params: &[P], f: F) -> Self
    where
        P: AsRef<str>,
        F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self::new(path, params, Arc::new(move |args| MaybeAsync::pending(f(args))))
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }

    pub fn endpoint(&self) -> String {
        format!("{API_ENDPOINT_PREFIX}{}", self.path)
    }

    /// Declared parameters present in `body`; `null` values are dropped.
    pub fn select_args(&self, body: &Value) -> Result<Map<String, Value>> {
        let object = match body {
            Value::Object(map) => map,
            Value::Null => return Ok(Map::new()),
            _ => {
                return Err(Error::MalformedEnvelope(format!(
                    "body of {} must be a JSON object",
                    self.path
                )))
            }
        };
        Ok(self
            .params
            .iter()
            .filter_map(|name| match object.get(name) {
                None | Some(Value::Null) => None,
                Some(v) => Some((name.clone(), v.clone())),
            })
            .collect())
    }

    fn invoke(&self, cx: RequestCx) -> MaybeAsync<Result<Response>> {
        let body = if cx.request.body().is_empty() {
            Value::Null
        } else {
            match serde_json::from_slice(cx.request.body()) {
                Ok(v) => v,
                Err(e) => return MaybeAsync::Ready(Err(Error::MalformedEnvelope(e.to_string()))),
            }
        };
        let args = match self.select_args(&body) {
            Ok(args) => args,
            Err(e) => return MaybeAsync::Ready(Err(e)),
        };
        debug!(path = %self.path, args = args.len(), "API callback invoked");
        match ((self.handler)(args), cx.mode) {
            (MaybeAsync::Ready(result), _) => {
                MaybeAsync::Ready(result.and_then(|v| to_json_response(&v)))
            }
            (MaybeAsync::Pending(_), ExecutionMode::Blocking) => {
                MaybeAsync::Ready(Err(Error::UnsupportedAsyncCallback(self.endpoint())))
            }
            (MaybeAsync::Pending(fut), ExecutionMode::Async) => {
                MaybeAsync::pending(async move { to_json_response(&fut.await?) })
            }
        }
    }

    pub fn handler(&self) -> RouteHandler {
        let route = self.clone();
        Arc::new(move |cx: RequestCx| route.invoke(cx))
    }

    /// The route registration: POST only, listed in schemas.
    pub fn registration(&self) -> RouteRegistration {
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        RouteRegistration {
            pattern: RoutePattern::new(&path),
            handler: self.handler(),
            methods: vec![Method::POST],
            endpoint: self.endpoint(),
            include_in_schema: true,
        }
    }
}

impl fmt::Debug for ApiRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiRoute")
            .field("path", &self.path)
            .field("params", &self.params)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ParamVec;
    use crate::server::ActiveRequest;
    use serde_json::json;

    fn route() -> ApiRoute {
        ApiRoute::sync("/api/sum", &["a", "b"], |args| {
            let a = args.get("a").and_then(Value::as_i64).unwrap_or(0);
            let b = args.get("b").and_then(Value::as_i64).unwrap_or(100);
            Ok(json!({"sum": a + b}))
        })
    }

    fn cx(body: &str, mode: ExecutionMode) -> RequestCx {
        RequestCx {
            request: Arc::new(
                ActiveRequest::builder(Method::POST, "/api/sum")
                    .header("Content-Type", "application/json")
                    .body(body.to_string())
                    .build(),
            ),
            params: ParamVec::new(),
            mode,
        }
    }

    fn call(route: &ApiRoute, body: &str, mode: ExecutionMode) -> Result<Response> {
        match route.handler()(cx(body, mode)) {
            MaybeAsync::Ready(r) => r,
            MaybeAsync::Pending(fut) => futures::executor::block_on(fut),
        }
    }

    #[test]
    fn test_filters_undeclared_and_null() {
        let body = r#"{"a": 2, "b": null, "c": 7}"#;
        let resp = call(&route(), body, ExecutionMode::Blocking).unwrap();
        let body: Value = serde_json::from_slice(resp.body_bytes().unwrap()).unwrap();
        assert_eq!(body, json!({"sum": 102}));
        assert_eq!(resp.content_type(), Some("application/json"));
    }

    #[test]
    fn test_non_object_body() {
        assert!(matches!(
            call(&route(), "[1, 2]", ExecutionMode::Blocking),
            Err(Error::MalformedEnvelope(_))
        ));
        let resp = call(&route(), "", ExecutionMode::Blocking).unwrap();
        assert_eq!(resp.status, 200);
    }

    #[test]
    fn test_async_route_modes() {
        let r = ApiRoute::asynchronous("/api/echo", &["x"], |args| async move {
            Ok(Value::Object(args))
        });
        assert!(matches!(
            call(&r, r#"{"x": 1}"#, ExecutionMode::Blocking),
            Err(Error::UnsupportedAsyncCallback(_))
        ));
        let resp = call(&r, r#"{"x": 1}"#, ExecutionMode::Async).unwrap();
        assert_eq!(resp.body_bytes().unwrap().as_ref(), br#"{"x":1}"#);
    }

    #[test]
    fn test_registration() {
        let reg = ApiRoute::sync("api/ping", &[] as &[&str], |_| Ok(json!("pong"))).registration();
        assert_eq!(reg.methods, vec![Method::POST]);
        assert_eq!(reg.endpoint, "backplane_callback_api_api/ping");
        assert!(reg.include_in_schema);
        assert_eq!(reg.pattern.to_string(), "/api/ping");
    }
}
