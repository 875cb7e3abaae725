//! # Logging
//!
//! Structured logging for every backend, built on `tracing` and
//! `tracing-subscriber`.
//!
//! ## Environment Variables
//!
//! - `BACKPLANE_LOG_LEVEL` - base level (default `info`)
//! - `BACKPLANE_LOG_FORMAT` - `json` (default) or `pretty`
//! - `BACKPLANE_LOG_TARGETS` - extra `EnvFilter` directives, comma separated
//!   (for example `backplane::sse=debug,hyper=warn`)
//! - `BACKPLANE_LOG_LOCATION` - include file and line (default `false`)
//!
//! ```rust,no_run
//! use backplane::logging::{init_logging, LogConfig};
//!
//! init_logging(&LogConfig::from_env()).unwrap();
//! tracing::info!(backend = "axum", "Server starting");
//! ```

use anyhow::{Context, Result};
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

static INITIALIZED: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            _ => LogFormat::Json,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub log_level: String,
    pub format: LogFormat,
    pub target_filter: Option<String>,
    pub include_location: bool,
}

impl LogConfig {
    pub fn from_env() -> Self {
        Self {
            log_level: env::var("BACKPLANE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: LogFormat::parse(
                &env::var("BACKPLANE_LOG_FORMAT").unwrap_or_else(|_| "json".to_string()),
            ),
            target_filter: env::var("BACKPLANE_LOG_TARGETS")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            include_location: env::var("BACKPLANE_LOG_LOCATION")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(false),
        }
    }

    /// Verbose human-readable output for local development.
    pub fn default_dev() -> Self {
        Self {
            log_level: "debug".to_string(),
            format: LogFormat::Pretty,
            target_filter: None,
            include_location: true,
        }
    }

    /// Build the `EnvFilter` directive string.
    fn directives(&self) -> String {
        match &self.target_filter {
            Some(extra) => format!("{},{}", self.log_level, extra),
            None => self.log_level.clone(),
        }
    }
}

/// Install the global subscriber.
///
/// Returns `Ok(true)` when this call installed it and `Ok(false)` when a
/// previous call already did, so tests and binaries can call it freely.
pub fn init_logging(config: &LogConfig) -> Result<bool> {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return Ok(false);
    }

    let env_filter = EnvFilter::try_new(config.directives())
        .with_context(|| format!("invalid log filter '{}'", config.directives()))?;

    let fmt_layer = match config.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(config.include_location)
            .with_line_number(config.include_location)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .pretty()
            .with_target(true)
            .with_file(config.include_location)
            .with_line_number(config.include_location)
            .boxed(),
    };

    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init();
    if let Err(e) = installed {
        // Another subscriber (a test harness, the host binary) owns the slot.
        tracing::debug!(error = %e, "Global subscriber already set");
        return Ok(false);
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse("PRETTY"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("invalid"), LogFormat::Json);
    }

    #[test]
    fn test_directives_include_targets() {
        let mut cfg = LogConfig::default_dev();
        assert_eq!(cfg.directives(), "debug");
        cfg.target_filter = Some("hyper=warn".to_string());
        assert_eq!(cfg.directives(), "debug,hyper=warn");
    }

    #[test]
    fn test_init_is_idempotent() {
        let cfg = LogConfig::default_dev();
        let _first = init_logging(&cfg).unwrap();
        assert!(!init_logging(&cfg).unwrap());
    }
}
