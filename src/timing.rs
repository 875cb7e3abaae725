//! Server-Timing instrumentation.
//!
//! Each [`ActiveRequest`](crate::server::ActiveRequest) carries a
//! [`TimingLedger`]. A before-hook stamps the start of the request under
//! [`TOTAL_KEY`]; any stage (or user callback, through [`record`]) may add
//! named entries; an after-hook turns every entry into one `Server-Timing`
//! header token `name[;desc="..."][;dur=<ms>]`.

use crate::backend::{AfterHook, BeforeHook, MaybeAsync};
use crate::context;
use crate::error::Result;
use crate::server::ActiveRequest;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

/// Ledger key holding the total server-side duration.
pub const TOTAL_KEY: &str = "__server";

/// Response header the ledger is flushed into.
pub const HEADER: &str = "Server-Timing";

#[derive(Debug, Clone, PartialEq)]
pub struct TimingEntry {
    pub duration_ms: Option<f64>,
    pub description: Option<String>,
}

impl TimingEntry {
    /// Render as one header token.
    pub fn format(&self, name: &str) -> String {
        let mut value = name.to_string();
        if let Some(desc) = &self.description {
            value.push_str(&format!(";desc=\"{desc}\""));
        }
        if let Some(dur) = self.duration_ms {
            value.push_str(&format!(";dur={dur}"));
        }
        value
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    started: Option<Instant>,
    entries: Vec<(String, TimingEntry)>,
}

/// Request-scoped mapping of name to timing entry, in insertion order.
#[derive(Debug, Default)]
pub struct TimingLedger {
    state: Mutex<LedgerState>,
}

impl TimingLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut LedgerState) -> R) -> R {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Stamp the request start and open the total-duration entry.
    pub fn start(&self) {
        self.with_state(|s| {
            s.started = Some(Instant::now());
            upsert(
                &mut s.entries,
                TOTAL_KEY,
                TimingEntry {
                    duration_ms: None,
                    description: None,
                },
            );
        });
    }

    pub fn is_started(&self) -> bool {
        self.with_state(|s| s.started.is_some())
    }

    /// Add or replace an entry.
    pub fn record(&self, name: &str, duration_ms: Option<f64>, description: Option<&str>) {
        self.with_state(|s| {
            upsert(
                &mut s.entries,
                name,
                TimingEntry {
                    duration_ms,
                    description: description.map(str::to_string),
                },
            );
        });
    }

    pub fn get(&self, name: &str) -> Option<TimingEntry> {
        self.with_state(|s| {
            s.entries
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, e)| e.clone())
        })
    }

    /// Close the total entry (whole milliseconds) and render every entry.
    pub fn finish(&self) -> Vec<String> {
        self.with_state(|s| {
            if let Some(started) = s.started.take() {
                let elapsed = started.elapsed().as_secs_f64() * 1000.0;
                upsert(
                    &mut s.entries,
                    TOTAL_KEY,
                    TimingEntry {
                        duration_ms: Some(elapsed.round()),
                        description: None,
                    },
                );
            }
            s.entries.iter().map(|(n, e)| e.format(n)).collect()
        })
    }
}

fn upsert(entries: &mut Vec<(String, TimingEntry)>, name: &str, entry: TimingEntry) {
    match entries.iter_mut().find(|(n, _)| n == name) {
        Some((_, existing)) => *existing = entry,
        None => entries.push((name.to_string(), entry)),
    }
}

/// Record a timing entry on the current request.
///
/// Fails with a context error when called outside a request.
pub fn record(name: &str, duration_ms: Option<f64>, description: Option<&str>) -> Result<()> {
    let req = context::current()?;
    req.timing().record(name, duration_ms, description);
    Ok(())
}

/// The before/after hook pair that implements Server-Timing.
pub fn hooks() -> (BeforeHook, AfterHook) {
    let before: BeforeHook = Arc::new(|req: Arc<ActiveRequest>| {
        req.timing().start();
        MaybeAsync::Ready(Ok(()))
    });
    let after: AfterHook = Arc::new(|req: Arc<ActiveRequest>, mut resp| {
        // Requests rejected before the start hook ran carry no ledger.
        if req.timing().is_started() {
            for token in req.timing().finish() {
                resp.add_header(HEADER, token);
            }
        }
        MaybeAsync::Ready(Ok(resp))
    });
    (before, after)
}
