//! # Runtime Configuration
//!
//! Process-level knobs read from the environment before any backend starts.
//!
//! ## Environment Variables
//!
//! ### `BACKPLANE_STACK_SIZE`
//!
//! Stack size for the coroutines of the sync-threaded backend. Accepts
//! decimal (`32768`) or hexadecimal (`0x8000`). Default: `0x8000` (32 KB).
//!
//! ### `BACKPLANE_WORKERS`
//!
//! Number of worker threads for every backend variant: coroutine
//! schedulers for the sync-threaded backend, tokio workers for the axum
//! backend, single-threaded runtimes for the hyper backend. Default: the
//! number of available CPUs.
//!
//! ```rust
//! use backplane::runtime_config::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_env();
//! assert!(config.workers > 0);
//! ```

use std::env;

const DEFAULT_STACK_SIZE: usize = 0x8000;

/// Runtime configuration loaded from environment variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Coroutine stack size in bytes
    pub stack_size: usize,
    /// Worker threads per backend
    pub workers: usize,
}

impl RuntimeConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let stack_size = env::var("BACKPLANE_STACK_SIZE")
            .ok()
            .and_then(|v| parse_size(&v))
            .unwrap_or(DEFAULT_STACK_SIZE);
        let workers = env::var("BACKPLANE_WORKERS")
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or_else(default_workers);
        RuntimeConfig {
            stack_size,
            workers,
        }
    }

    /// Apply the coroutine settings to the global `may` scheduler.
    ///
    /// Must run before the first coroutine is spawned to take effect.
    pub fn apply_to_may(&self) {
        may::config()
            .set_stack_size(self.stack_size)
            .set_workers(self.workers);
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            stack_size: DEFAULT_STACK_SIZE,
            workers: default_workers(),
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Parse a size given in decimal or `0x`-prefixed hexadecimal.
pub fn parse_size(raw: &str) -> Option<usize> {
    let raw = raw.trim();
    match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16).ok(),
        None => raw.parse().ok(),
    }
}
