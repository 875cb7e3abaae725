//! # Background Jobs
//!
//! Callbacks flagged as background run through a [`JobManager`] instead of
//! inline. The dispatch layer only relies on [`JobManager::submit`] and
//! [`JobManager::poll`]; queuing and result storage belong to the manager.
//!
//! [`ThreadJobManager`] is an in-process reference manager: a fixed pool of
//! named worker threads fed by a bounded queue. Results stay in memory
//! until they are polled once or outlive the result TTL.
//!
//! ## Configuration
//!
//! - `BACKPLANE_JOB_WORKERS`: worker threads (default: 4)
//! - `BACKPLANE_JOB_QUEUE_BOUND`: jobs waiting for a worker before
//!   submissions are refused (default: 1024)
//! - `BACKPLANE_JOB_RESULT_TTL_SECS`: how long a finished result waits for
//!   its poll (default: 300)

use crate::error::{panic_message, Error, Result};
use crate::ids::RequestId;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use serde_json::Value;
use std::cell::RefCell;
use std::env;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

thread_local! {
    static CURRENT_PROGRESS: RefCell<Option<Progress>> = const { RefCell::new(None) };
}

/// Report progress from inside a job running on a [`ThreadJobManager`].
/// Returns `false` outside of a job.
pub fn set_progress(progress: Value) -> bool {
    CURRENT_PROGRESS.with(|current| match current.borrow().as_ref() {
        Some(handle) => {
            handle.set(progress);
            true
        }
        None => false,
    })
}

/// Work submitted to a manager. The [`Progress`] handle reports partial
/// progress to pollers.
pub type Job = Box<dyn FnOnce(Progress) -> Result<Value> + Send + 'static>;

/// State of a submitted job as seen by a poller.
#[derive(Debug, Clone, PartialEq)]
pub enum JobStatus {
    Pending { progress: Option<Value> },
    Done(Value),
    Failed(String),
    Unknown,
}

/// Invocation contract of a background-job manager.
pub trait JobManager: Send + Sync {
    /// Queue a job; returns the key to poll with.
    fn submit(&self, job: Job) -> Result<String>;

    /// Current status of `key`. Finished results may be handed out once.
    fn poll(&self, key: &str) -> Result<JobStatus>;
}

#[derive(Debug)]
struct JobEntry {
    status: JobStatus,
    finished_at: Option<Instant>,
}

impl JobEntry {
    fn pending() -> Self {
        Self {
            status: JobStatus::Pending { progress: None },
            finished_at: None,
        }
    }

    fn finished(status: JobStatus) -> Self {
        Self {
            status,
            finished_at: Some(Instant::now()),
        }
    }
}

type JobTable = Arc<DashMap<String, JobEntry>>;

/// Progress reporter handed to a running job.
#[derive(Clone)]
pub struct Progress {
    key: String,
    jobs: JobTable,
}

impl Progress {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Publish a progress value to pollers.
    pub fn set(&self, progress: Value) {
        if let Some(mut entry) = self.jobs.get_mut(&self.key) {
            if let JobStatus::Pending { progress: p } = &mut entry.status {
                *p = Some(progress);
            }
        }
    }
}

impl fmt::Debug for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Progress").field("key", &self.key).finish()
    }
}

/// Sizing of a [`ThreadJobManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPoolConfig {
    pub workers: usize,
    pub queue_bound: usize,
    pub result_ttl: Duration,
}

impl Default for JobPoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_bound: 1024,
            result_ttl: Duration::from_secs(300),
        }
    }
}

impl JobPoolConfig {
    /// Load from the `BACKPLANE_JOB_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let workers = env::var("BACKPLANE_JOB_WORKERS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|n: &usize| *n > 0)
            .unwrap_or(defaults.workers);
        let queue_bound = env::var("BACKPLANE_JOB_QUEUE_BOUND")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.queue_bound);
        let result_ttl = env::var("BACKPLANE_JOB_RESULT_TTL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.result_ttl);
        Self {
            workers,
            queue_bound,
            result_ttl,
        }
    }
}

struct QueuedJob {
    key: String,
    job: Job,
}

struct Pool {
    config: JobPoolConfig,
    jobs: JobTable,
    queued: Arc<AtomicUsize>,
    sender: OnceCell<SyncSender<QueuedJob>>,
}

/// Runs jobs on a fixed pool of worker threads.
///
/// Workers start on the first submission. A submission that finds the
/// queue full fails with an [`Error::Io`] of kind `WouldBlock`.
#[derive(Clone)]
pub struct ThreadJobManager {
    pool: Arc<Pool>,
}

impl Default for ThreadJobManager {
    fn default() -> Self {
        Self::with_config(JobPoolConfig::default())
    }
}

impl fmt::Debug for ThreadJobManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadJobManager")
            .field("config", &self.pool.config)
            .field("jobs", &self.pool.jobs.len())
            .field("queued", &self.queued())
            .finish()
    }
}

impl ThreadJobManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: JobPoolConfig) -> Self {
        Self {
            pool: Arc::new(Pool {
                config,
                jobs: Arc::new(DashMap::new()),
                queued: Arc::new(AtomicUsize::new(0)),
                sender: OnceCell::new(),
            }),
        }
    }

    pub fn config(&self) -> &JobPoolConfig {
        &self.pool.config
    }

    /// Jobs not yet handed out.
    pub fn len(&self) -> usize {
        self.pool.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.jobs.is_empty()
    }

    /// Jobs waiting for a worker.
    pub fn queued(&self) -> usize {
        self.pool.queued.load(Ordering::SeqCst)
    }

    /// Finished results still waiting for their poll.
    pub fn finished(&self) -> usize {
        self.pool
            .jobs
            .iter()
            .filter(|e| e.finished_at.is_some())
            .count()
    }

    /// Drop finished results older than the result TTL. Returns how many
    /// were dropped.
    pub fn evict_expired(&self) -> usize {
        let ttl = self.pool.config.result_ttl;
        let before = self.pool.jobs.len();
        self.pool
            .jobs
            .retain(|_, e| e.finished_at.map_or(true, |t| t.elapsed() < ttl));
        let evicted = before.saturating_sub(self.pool.jobs.len());
        if evicted > 0 {
            debug!(evicted, "Expired background results dropped");
        }
        evicted
    }

    fn sender(&self) -> Result<&SyncSender<QueuedJob>> {
        self.pool.sender.get_or_try_init(|| {
            let (tx, rx) = mpsc::sync_channel(self.pool.config.queue_bound);
            let rx = Arc::new(Mutex::new(rx));
            for i in 0..self.pool.config.workers {
                let rx = Arc::clone(&rx);
                let jobs = Arc::clone(&self.pool.jobs);
                let queued = Arc::clone(&self.pool.queued);
                std::thread::Builder::new()
                    .name(format!("backplane-job-{i}"))
                    .spawn(move || worker_loop(rx, jobs, queued))
                    .map_err(Error::Io)?;
            }
            info!(
                workers = self.pool.config.workers,
                queue_bound = self.pool.config.queue_bound,
                "Background job pool started"
            );
            Ok(tx)
        })
    }
}

fn worker_loop(rx: Arc<Mutex<Receiver<QueuedJob>>>, jobs: JobTable, queued: Arc<AtomicUsize>) {
    loop {
        let next = rx.lock().unwrap_or_else(PoisonError::into_inner).recv();
        let Ok(QueuedJob { key, job }) = next else {
            // Manager dropped.
            return;
        };
        queued.fetch_sub(1, Ordering::SeqCst);
        run_job(key, job, &jobs);
    }
}

fn run_job(key: String, job: Job, jobs: &JobTable) {
    debug!(job = %key, "Background job started");
    let progress = Progress {
        key: key.clone(),
        jobs: Arc::clone(jobs),
    };
    CURRENT_PROGRESS.with(|current| *current.borrow_mut() = Some(progress.clone()));
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| job(progress)))
        .unwrap_or_else(|p| Err(Error::Panic(panic_message(p.as_ref()))));
    CURRENT_PROGRESS.with(|current| *current.borrow_mut() = None);
    let status = match outcome {
        Ok(value) => {
            info!(job = %key, "Background job finished");
            JobStatus::Done(value)
        }
        Err(err) => {
            error!(job = %key, error = %err, "Background job failed");
            JobStatus::Failed(err.to_string())
        }
    };
    jobs.insert(key, JobEntry::finished(status));
}

impl JobManager for ThreadJobManager {
    fn submit(&self, job: Job) -> Result<String> {
        self.evict_expired();
        let sender = self.sender()?;
        let key = RequestId::new().to_string();
        self.pool.jobs.insert(key.clone(), JobEntry::pending());
        self.pool.queued.fetch_add(1, Ordering::SeqCst);
        let queued = QueuedJob {
            key: key.clone(),
            job,
        };
        match sender.try_send(queued) {
            Ok(()) => Ok(key),
            Err(e) => {
                self.pool.queued.fetch_sub(1, Ordering::SeqCst);
                self.pool.jobs.remove(&key);
                let (kind, reason) = match e {
                    TrySendError::Full(_) => {
                        warn!(
                            queue_bound = self.pool.config.queue_bound,
                            "Background job queue full, submission refused"
                        );
                        (io::ErrorKind::WouldBlock, "background job queue is full")
                    }
                    TrySendError::Disconnected(_) => {
                        (io::ErrorKind::BrokenPipe, "background job workers are gone")
                    }
                };
                Err(Error::Io(io::Error::new(kind, reason)))
            }
        }
    }

    fn poll(&self, key: &str) -> Result<JobStatus> {
        self.evict_expired();
        let pending = match self.pool.jobs.get(key) {
            None => return Ok(JobStatus::Unknown),
            Some(entry) => entry.finished_at.is_none().then(|| entry.status.clone()),
        };
        if let Some(status) = pending {
            return Ok(status);
        }
        Ok(self
            .pool
            .jobs
            .remove(key)
            .map(|(_, entry)| entry.status)
            .unwrap_or(JobStatus::Unknown))
    }
}
