//! # Application
//!
//! [`Application`] assembles a runnable server from an [`AppConfig`]: it
//! creates the configured backend, registers the framework routes under the
//! routes prefix and installs the error handlers and dev tools the
//! configuration asks for.
//!
//! ```rust,no_run
//! use backplane::application::Application;
//! use backplane::config::AppConfig;
//! use backplane::dispatcher::{callback, SimpleCallbackGraph};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let mut graph = SimpleCallbackGraph::new();
//! graph
//!     .register(
//!         "greeting.children",
//!         "greet",
//!         callback(|args| Ok(json!(format!("Hello {}", args[0])))),
//!     )
//!     .unwrap();
//! let app = Application::new(AppConfig::default(), Arc::new(graph)).unwrap();
//! let handle = app.run().unwrap();
//! handle.join();
//! ```

use crate::assets::{serve_component_suite, PackageRegistry};
use crate::background::{JobManager, JobPoolConfig, ThreadJobManager};
use crate::backend::{
    create_backend, Backend, MaybeAsync, RequestCx, RouteHandler, RoutePattern, RunConfig,
    ServerHandle,
};
use crate::config::AppConfig;
use crate::dispatcher::{
    ApiRoute, CallbackGraph, Dispatcher, COMPONENT_SUITES_PATH, STREAM_PATH,
    UPDATE_COMPONENT_PATH,
};
use crate::error::{Error, Result};
use crate::ids::StreamId;
use crate::sse::{stream_handler, StreamCallback, StreamRegistry};
use crate::traceback;
use http::Method;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Endpoint names of the framework routes.
const UPDATE_COMPONENT_ENDPOINT: &str = "backplane_update_component";
const COMPONENT_SUITES_ENDPOINT: &str = "backplane_component_suites";
const STREAM_ENDPOINT: &str = "backplane_update_component_sse";

/// A configured application waiting to be served.
pub struct Application {
    config: AppConfig,
    backend: Box<dyn Backend>,
    graph: Arc<dyn CallbackGraph>,
    packages: PackageRegistry,
    streams: StreamRegistry,
    api_routes: Vec<ApiRoute>,
    jobs: Option<Arc<dyn JobManager>>,
}

impl Application {
    /// Create the backend named by `config.backend` for `graph`.
    ///
    /// Background callbacks get a [`ThreadJobManager`] sized by
    /// [`JobPoolConfig::from_env`] unless [`Application::with_jobs`]
    /// replaces it.
    pub fn new(config: AppConfig, graph: Arc<dyn CallbackGraph>) -> Result<Self> {
        let mut run_config = RunConfig::new();
        if let Some(workers) = config.workers {
            run_config.insert("workers".to_string(), Value::from(workers));
        }
        let backend = create_backend(&config.backend, &config.name, run_config)?;
        info!(
            app = %config.name,
            backend = %backend.kind(),
            prefix = %config.normalized_prefix(),
            "Application created"
        );
        Ok(Self {
            config,
            backend,
            graph,
            packages: PackageRegistry::new(),
            streams: StreamRegistry::new(),
            api_routes: Vec::new(),
            jobs: Some(Arc::new(ThreadJobManager::with_config(JobPoolConfig::from_env()))),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// The backend, for registering extra routes and hooks.
    pub fn backend_mut(&mut self) -> &mut dyn Backend {
        self.backend.as_mut()
    }

    pub fn packages_mut(&mut self) -> &mut PackageRegistry {
        &mut self.packages
    }

    /// Register a streaming callback and return its id.
    pub fn register_stream(&mut self, callback: StreamCallback) -> Result<StreamId> {
        self.streams.register(callback)
    }

    pub fn add_api_route(&mut self, route: ApiRoute) {
        self.api_routes.push(route);
    }

    /// Replace the job manager used for background callbacks.
    pub fn with_jobs(mut self, jobs: Arc<dyn JobManager>) -> Self {
        self.jobs = Some(jobs);
        self
    }

    /// Disable background callbacks; flagged callbacks then fail to
    /// dispatch.
    pub fn without_jobs(mut self) -> Self {
        self.jobs = None;
        self
    }

    /// Register every framework route on the backend.
    ///
    /// [`Application::run`] calls this; it is public so that the routes can
    /// be inspected (or driven in-process) before serving.
    pub fn setup(&mut self) -> Result<()> {
        let prefix = self.config.normalized_prefix();
        self.install_error_handling();
        if self.config.dev_tools.serve_timing && self.backend.install_timing() {
            debug!("Server-Timing enabled");
        }

        let assets = self.config.assets.clone();
        self.backend
            .register_static_mount("assets", &assets.url_path, &assets.folder)?;

        let mut dispatcher = Dispatcher::new(Arc::clone(&self.graph));
        if let Some(jobs) = &self.jobs {
            dispatcher = dispatcher.with_jobs(Arc::clone(jobs));
        }
        self.backend.add_route_with_schema(
            RoutePattern::new(&prefix).literal(UPDATE_COMPONENT_PATH),
            Arc::new(dispatcher).handler(),
            &[Method::POST],
            UPDATE_COMPONENT_ENDPOINT,
            false,
        )?;

        let packages = Arc::new(std::mem::take(&mut self.packages));
        self.backend.add_route_with_schema(
            RoutePattern::new(&prefix)
                .literal(COMPONENT_SUITES_PATH)
                .param("package_name")
                .catch_all("fingerprinted_path"),
            suites_handler(packages),
            &[Method::GET],
            COMPONENT_SUITES_ENDPOINT,
            false,
        )?;

        let idle = Duration::from_millis(self.config.stream.idle_timeout_ms);
        let streams = Arc::new(std::mem::take(&mut self.streams));
        self.backend.add_route_with_schema(
            RoutePattern::new(&prefix).literal(STREAM_PATH),
            stream_handler(streams, idle),
            &[Method::POST],
            STREAM_ENDPOINT,
            false,
        )?;

        for route in std::mem::take(&mut self.api_routes) {
            let reg = route.registration();
            self.backend.add_route_with_schema(
                reg.pattern,
                reg.handler,
                &reg.methods,
                &reg.endpoint,
                reg.include_in_schema,
            )?;
        }
        debug!(routes = self.backend.routes().len(), "Framework routes registered");
        Ok(())
    }

    fn install_error_handling(&mut self) {
        self.backend.register_error_translators();
        let renderer = if self.config.dev_tools.prune_errors || self.config.error_secret.is_some()
        {
            traceback::secret_gated()
        } else if self.config.debug {
            traceback::detailed()
        } else {
            traceback::generic()
        };
        self.backend
            .register_unhandled_exception_handler(self.config.error_secret.clone(), renderer);
    }

    /// Register the framework routes and start serving on the configured
    /// host and port.
    pub fn run(mut self) -> Result<ServerHandle> {
        self.setup()?;
        let host = self.config.host.clone();
        self.backend
            .run(&host, self.config.port, self.config.debug, RunConfig::new())
    }
}

fn suites_handler(packages: Arc<PackageRegistry>) -> RouteHandler {
    Arc::new(move |cx: RequestCx| {
        let result = match (cx.param("package_name"), cx.param("fingerprinted_path")) {
            (Some(package), Some(path)) => {
                serve_component_suite(&packages, &cx.request, package, path)
            }
            _ => Err(Error::InvalidResource(
                "component suite route without package or path".to_string(),
            )),
        };
        MaybeAsync::Ready(result)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::SimpleCallbackGraph;

    fn app(backend: &str) -> Application {
        let config = AppConfig {
            backend: backend.to_string(),
            routes_prefix: "/app".to_string(),
            ..AppConfig::default()
        };
        Application::new(config, Arc::new(SimpleCallbackGraph::new())).unwrap()
    }

    #[test]
    fn test_setup_registers_framework_routes() {
        let mut app = app("axum");
        app.add_api_route(ApiRoute::sync("/api/ping", &[] as &[&str], |_| Ok(Value::Null)));
        app.setup().unwrap();
        let endpoints: Vec<_> = app
            .backend_mut()
            .routes()
            .iter()
            .map(|r| (r.endpoint.clone(), r.pattern.to_string(), r.include_in_schema))
            .collect();
        assert!(endpoints.contains(&(
            UPDATE_COMPONENT_ENDPOINT.to_string(),
            "/app/_backplane-update-component".to_string(),
            false
        )));
        assert!(endpoints.contains(&(
            COMPONENT_SUITES_ENDPOINT.to_string(),
            "/app/_backplane-component-suites/{package_name}/{fingerprinted_path:path}"
                .to_string(),
            false
        )));
        assert!(endpoints.contains(&(
            "backplane_callback_api_/api/ping".to_string(),
            "/api/ping".to_string(),
            true
        )));
    }

    #[test]
    fn test_unknown_backend() {
        let config = AppConfig {
            backend: "carrier-pigeon".to_string(),
            ..AppConfig::default()
        };
        assert!(matches!(
            Application::new(config, Arc::new(SimpleCallbackGraph::new())),
            Err(Error::Registration(_))
        ));
    }
}
