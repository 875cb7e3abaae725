use anyhow::{Context, Result};
use backplane::application::Application;
use backplane::background::set_progress;
use backplane::config::AppConfig;
use backplane::dispatcher::{async_callback, callback, no_update, ApiRoute, SimpleCallbackGraph};
use backplane::logging::{init_logging, LogConfig};
use backplane::sse::StreamCallback;
use backplane::{timing, ServerHandle};
use clap::Parser;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Parser)]
#[command(name = "backplane")]
#[command(about = "Serve the backplane demo application", long_about = None)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "BACKPLANE_CONFIG")]
    config: Option<PathBuf>,

    /// Backend variant: threaded, axum or hyper
    #[arg(short, long)]
    backend: Option<String>,

    #[arg(long)]
    host: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long, default_value_t = false)]
    debug: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&LogConfig::from_env()).context("failed to initialise logging")?;

    let mut config = match &cli.config {
        Some(path) => AppConfig::load(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => {
            let mut config = AppConfig::default();
            config.apply_env().context("invalid environment override")?;
            config
        }
    };
    if let Some(backend) = cli.backend {
        config.backend = backend;
    }
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    config.debug |= cli.debug;

    let app = demo_app(config).context("failed to build the demo application")?;
    let handle = app.run().context("failed to start the server")?;
    info!(addr = %handle.addr(), backend = %handle.kind(), "Listening");
    wait_for_shutdown(handle)
}

fn demo_app(config: AppConfig) -> backplane::Result<Application> {
    let mut graph = SimpleCallbackGraph::new();
    graph.register(
        "greeting.children",
        "greet",
        callback(|args| {
            let name = args.first().and_then(Value::as_str).unwrap_or("");
            if name.is_empty() {
                return Ok(no_update());
            }
            Ok(json!(format!("Hello, {name}!")))
        }),
    )?;
    graph.register(
        "..celsius.value...fahrenheit.value..",
        "convert",
        callback(|args| {
            let started = Instant::now();
            let c = args.first().and_then(Value::as_f64).unwrap_or(0.0);
            let converted = json!([c, c * 9.0 / 5.0 + 32.0]);
            timing::record(
                "convert",
                Some(started.elapsed().as_secs_f64() * 1000.0),
                Some("temperature conversion"),
            )?;
            Ok(converted)
        }),
    )?;
    graph.register(
        "clock.children",
        "clock",
        async_callback(|_args| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(json!(format!("{:?}", std::time::SystemTime::now())))
        }),
    )?;
    graph.register_background(
        "report.children",
        "report",
        callback(|_args| {
            for step in 1..=5 {
                set_progress(json!(step * 20));
                std::thread::sleep(Duration::from_millis(200));
            }
            Ok(json!("report ready"))
        }),
    )?;

    let mut app = Application::new(config, Arc::new(graph))?;
    app.register_stream(StreamCallback::new(
        "demo.progress",
        &["Input(start.n_clicks)"],
        &["steps"],
        Arc::new(|args, emitter| {
            let steps = args.get("steps").and_then(Value::as_u64).unwrap_or(5);
            for step in 1..=steps {
                emitter.emit("progress", json!({ "value": step, "max": steps }))?;
                std::thread::sleep(Duration::from_millis(100));
            }
            Ok(())
        }),
    ))?;
    app.add_api_route(ApiRoute::sync("/api/add", &["a", "b"], |args| {
        let a = args.get("a").and_then(Value::as_f64).unwrap_or(0.0);
        let b = args.get("b").and_then(Value::as_f64).unwrap_or(0.0);
        Ok(json!({ "sum": a + b }))
    }));
    Ok(app)
}

#[cfg(unix)]
fn wait_for_shutdown(handle: ServerHandle) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals =
        Signals::new([SIGINT, SIGTERM]).context("failed to register signal handlers")?;
    if let Some(signal) = signals.forever().next() {
        info!(signal, "Shutdown requested");
    }
    handle.stop();
    Ok(())
}

#[cfg(not(unix))]
fn wait_for_shutdown(handle: ServerHandle) -> Result<()> {
    handle.join();
    Ok(())
}
