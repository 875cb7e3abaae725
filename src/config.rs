//! Application configuration.
//!
//! [`AppConfig`] is loaded from YAML and then overridden by `BACKPLANE_*`
//! environment variables. Every field has a default, so an empty file (or
//! no file at all) yields a runnable configuration.
//!
//! ```yaml
//! name: demo
//! backend: axum
//! port: 8050
//! assets:
//!   url_path: /assets
//!   folder: ./assets
//! stream:
//!   idle_timeout_ms: 30000
//! dev_tools:
//!   serve_timing: true
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::{env, fs};

/// Default idle timeout of a streaming channel in milliseconds.
pub const DEFAULT_STREAM_IDLE_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetsConfig {
    /// URL prefix the assets folder is mounted under
    pub url_path: String,
    /// Directory holding the assets; missing directories are ignored
    pub folder: PathBuf,
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            url_path: "/assets".to_string(),
            folder: PathBuf::from("assets"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Close a channel when no frame was produced for this long
    pub idle_timeout_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: DEFAULT_STREAM_IDLE_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DevToolsConfig {
    /// Emit `Server-Timing` headers
    pub serve_timing: bool,
    /// Route unhandled errors through the secret-gated traceback renderer
    pub prune_errors: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub name: String,
    /// Backend variant name or alias, see [`crate::backend::BackendKind`]
    pub backend: String,
    pub host: String,
    pub port: u16,
    pub debug: bool,
    /// Worker threads; `None` falls back to [`crate::runtime_config::RuntimeConfig`]
    pub workers: Option<usize>,
    /// Prefix applied to every framework route
    pub routes_prefix: String,
    pub assets: AssetsConfig,
    pub stream: StreamConfig,
    pub dev_tools: DevToolsConfig,
    /// Secret that unlocks detailed tracebacks in 500 responses
    pub error_secret: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "backplane".to_string(),
            backend: "threaded".to_string(),
            host: "127.0.0.1".to_string(),
            port: 8050,
            debug: false,
            workers: None,
            routes_prefix: "/".to_string(),
            assets: AssetsConfig::default(),
            stream: StreamConfig::default(),
            dev_tools: DevToolsConfig::default(),
            error_secret: None,
        }
    }
}

impl AppConfig {
    /// Parse a YAML document.
    pub fn from_yaml(source: &str) -> Result<Self> {
        if source.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(source).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load from a YAML file and apply environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let source = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        let mut config = Self::from_yaml(&source)?;
        config.apply_env()?;
        Ok(config)
    }

    /// Override fields from `BACKPLANE_*` environment variables.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("BACKPLANE_BACKEND") {
            self.backend = v;
        }
        if let Some(v) = lookup("BACKPLANE_HOST") {
            self.host = v;
        }
        if let Some(v) = lookup("BACKPLANE_PORT") {
            self.port = parse_env("BACKPLANE_PORT", &v)?;
        }
        if let Some(v) = lookup("BACKPLANE_DEBUG") {
            self.debug = parse_bool(&v);
        }
        if let Some(v) = lookup("BACKPLANE_WORKERS") {
            self.workers = Some(parse_env("BACKPLANE_WORKERS", &v)?);
        }
        if let Some(v) = lookup("BACKPLANE_STREAM_IDLE_TIMEOUT_MS") {
            self.stream.idle_timeout_ms = parse_env("BACKPLANE_STREAM_IDLE_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("BACKPLANE_ERROR_SECRET") {
            self.error_secret = Some(v);
        }
        Ok(())
    }

    /// The routes prefix normalised to start and end with `/`.
    pub fn normalized_prefix(&self) -> String {
        let trimmed = self.routes_prefix.trim_matches('/');
        if trimmed.is_empty() {
            "/".to_string()
        } else {
            format!("/{trimmed}/")
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| Error::Config(format!("{key}={raw:?} is not a valid value")))
}

fn parse_bool(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_from_empty_yaml() {
        let cfg = AppConfig::from_yaml("").unwrap();
        assert_eq!(cfg, AppConfig::default());
        assert_eq!(cfg.stream.idle_timeout_ms, DEFAULT_STREAM_IDLE_TIMEOUT_MS);
    }

    #[test]
    fn test_partial_yaml() {
        let cfg = AppConfig::from_yaml(
            "name: demo\nbackend: hyper\nport: 9000\ndev_tools:\n  serve_timing: true\n",
        )
        .unwrap();
        assert_eq!(cfg.name, "demo");
        assert_eq!(cfg.backend, "hyper");
        assert_eq!(cfg.port, 9000);
        assert!(cfg.dev_tools.serve_timing);
        assert!(!cfg.dev_tools.prune_errors);
        assert_eq!(cfg.assets.url_path, "/assets");
    }

    #[test]
    fn test_invalid_yaml_is_config_error() {
        let err = AppConfig::from_yaml("port: [nope").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("BACKPLANE_BACKEND", "axum"),
            ("BACKPLANE_PORT", "0"),
            ("BACKPLANE_DEBUG", "yes"),
            ("BACKPLANE_STREAM_IDLE_TIMEOUT_MS", "250"),
        ]
        .into_iter()
        .collect();
        let mut cfg = AppConfig::default();
        cfg.apply_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(cfg.backend, "axum");
        assert_eq!(cfg.port, 0);
        assert!(cfg.debug);
        assert_eq!(cfg.stream.idle_timeout_ms, 250);
    }

    #[test]
    fn test_bad_env_value() {
        let mut cfg = AppConfig::default();
        let err = cfg
            .apply_overrides(|k| (k == "BACKPLANE_PORT").then(|| "eighty".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("BACKPLANE_PORT"));
    }

    #[test]
    fn test_normalized_prefix() {
        let mut cfg = AppConfig::default();
        assert_eq!(cfg.normalized_prefix(), "/");
        cfg.routes_prefix = "app".to_string();
        assert_eq!(cfg.normalized_prefix(), "/app/");
        cfg.routes_prefix = "/app/".to_string();
        assert_eq!(cfg.normalized_prefix(), "/app/");
    }
}
