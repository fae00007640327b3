//! Upload Coalescer - asynchronous promotion of staged artifacts
//!
//! Holds the set of artifacts that are staged locally but not yet durable.
//! A single background loop wakes on a fixed tick and promotes every pending
//! artifact into the object store, at most one upload per key.
//!
//! # Task lifecycle
//!
//! ```text
//!   claim()          commit()            tick              success
//! ─────────► Staging ────────► Pending ────────► Uploading ─────────► (dropped)
//!              │                  ▲                  │
//!              │ drop             │  transient error │ permanent error
//!              ▼                  └──────────────────┤
//!          (released)                                ▼
//!                                                (dropped, file deleted)
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use super::staging::StagedFile;
use crate::domain::ObjectStore;
use crate::error::Error;
use crate::metrics::ProxyMetrics;
use crate::retry::RetryPolicy;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the upload coalescer
#[derive(Debug, Clone)]
pub struct UploaderConfig {
    /// How often pending artifacts are scheduled
    pub tick_interval: Duration,

    /// Upper bound on concurrent promotions
    pub max_concurrent_uploads: usize,

    /// How long `stop` waits for in-flight uploads before cancelling them
    pub shutdown_grace: Duration,

    /// Retry policy for backend stat and put
    pub retry: RetryPolicy,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            max_concurrent_uploads: 16,
            shutdown_grace: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

// =============================================================================
// Task State
// =============================================================================

#[derive(Debug)]
enum TaskState {
    /// Claimed, content still being written locally
    Staging,
    /// Fully staged, waiting for the next tick
    Pending(StagedFile),
    /// Promotion in flight
    Uploading,
}

/// Snapshot of the pending set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UploaderStats {
    pub staging: usize,
    pub pending: usize,
    pub uploading: usize,
}

/// Exclusive right to stage one artifact name.
///
/// Dropping an uncommitted claim releases the name.
#[derive(Debug)]
pub struct Claim {
    tasks: Arc<DashMap<String, TaskState>>,
    name: String,
    committed: bool,
}

impl Claim {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hand the staged file to the coalescer; it now owns the file.
    pub fn commit(mut self, staged: StagedFile) {
        self.tasks
            .insert(self.name.clone(), TaskState::Pending(staged));
        self.committed = true;
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        if !self.committed {
            self.tasks
                .remove_if(&self.name, |_, state| matches!(state, TaskState::Staging));
        }
    }
}

/// Outcome of one promotion attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Promotion {
    Uploaded,
    AlreadyDurable,
    Missing,
    Retry,
    Failed,
}

impl Promotion {
    fn label(&self) -> &'static str {
        match self {
            Self::Uploaded => "uploaded",
            Self::AlreadyDurable => "exists",
            Self::Missing => "missing",
            Self::Retry => "retry",
            Self::Failed => "failed",
        }
    }
}

// =============================================================================
// Coalescer
// =============================================================================

/// Background promoter of staged artifacts
pub struct UploadCoalescer {
    store: Arc<dyn ObjectStore>,
    config: UploaderConfig,
    metrics: ProxyMetrics,
    tasks: Arc<DashMap<String, TaskState>>,
    permits: Arc<Semaphore>,
    /// Stops scheduling
    stop: CancellationToken,
    /// Cancels in-flight uploads once the grace period has passed
    uploads: CancellationToken,
    tracker: TaskTracker,
    started: AtomicBool,
    run_handle: Mutex<Option<JoinHandle<()>>>,
}

impl UploadCoalescer {
    pub fn new(store: Arc<dyn ObjectStore>, config: UploaderConfig, metrics: ProxyMetrics) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_uploads.max(1)));
        Self {
            store,
            config,
            metrics,
            tasks: Arc::new(DashMap::new()),
            permits,
            stop: CancellationToken::new(),
            uploads: CancellationToken::new(),
            tracker: TaskTracker::new(),
            started: AtomicBool::new(false),
            run_handle: Mutex::new(None),
        }
    }

    /// Atomically claim `name`. Returns `None` if another writer holds it or
    /// it is still awaiting promotion.
    pub fn claim(&self, name: &str) -> Option<Claim> {
        match self.tasks.entry(name.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(TaskState::Staging);
                Some(Claim {
                    tasks: self.tasks.clone(),
                    name: name.to_string(),
                    committed: false,
                })
            }
        }
    }

    pub fn is_tracked(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    pub fn stats(&self) -> UploaderStats {
        let mut stats = UploaderStats::default();
        for entry in self.tasks.iter() {
            match entry.value() {
                TaskState::Staging => stats.staging += 1,
                TaskState::Pending(_) => stats.pending += 1,
                TaskState::Uploading => stats.uploading += 1,
            }
        }
        stats
    }

    /// Spawn the background loop. Subsequent calls are no-ops.
    ///
    /// The loop runs until [`stop`](Self::stop); it does not follow the
    /// process shutdown signal, so artifacts committed while the front door
    /// drains are still promoted.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.run().await });
        *self.run_handle.lock() = Some(handle);
    }

    /// Stop scheduling, promote whatever is still pending, wait up to the
    /// grace period for in-flight uploads, then cancel whatever is left.
    pub async fn stop(self: &Arc<Self>) {
        self.stop.cancel();
        let handle = self.run_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Upload loop terminated abnormally: {}", e);
            }
        }

        self.schedule();
        self.tracker.close();
        if tokio::time::timeout(self.config.shutdown_grace, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                grace_secs = self.config.shutdown_grace.as_secs(),
                "In-flight uploads exceeded shutdown grace, cancelling"
            );
            self.uploads.cancel();
            self.tracker.wait().await;
        }

        let left = self.stats();
        if left.pending + left.uploading > 0 {
            warn!(
                pending = left.pending,
                uploading = left.uploading,
                "Upload coalescer stopped with unpromoted artifacts"
            );
        } else {
            info!("Upload coalescer stopped");
        }
    }

    #[instrument(skip(self))]
    async fn run(self: Arc<Self>) {
        info!("Starting upload coalescer with {:?}", self.config);

        let mut tick = interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = tick.tick() => self.schedule(),
            }
        }
        debug!("Upload loop exited");
    }

    /// Move every pending task to uploading and spawn its promotion.
    fn schedule(self: &Arc<Self>) {
        let mut ready = Vec::new();
        for mut entry in self.tasks.iter_mut() {
            if matches!(entry.value(), TaskState::Pending(_)) {
                if let TaskState::Pending(staged) =
                    std::mem::replace(entry.value_mut(), TaskState::Uploading)
                {
                    ready.push((entry.key().clone(), staged));
                }
            }
        }
        self.metrics.set_pending_uploads(self.tasks.len());

        if ready.is_empty() {
            return;
        }
        debug!(count = ready.len(), "Scheduling promotions");

        for (name, staged) in ready {
            let this = Arc::clone(self);
            self.tracker.spawn(async move {
                let Ok(_permit) = this.permits.clone().acquire_owned().await else {
                    this.requeue(name, staged);
                    return;
                };
                let outcome = this.promote(&name, staged).await;
                this.metrics.record_upload(outcome.label());
            });
        }
    }

    fn requeue(&self, name: String, staged: StagedFile) {
        self.tasks.insert(name, TaskState::Pending(staged));
    }

    async fn finish(&self, name: &str, mut staged: StagedFile) {
        if let Err(e) = staged.remove().await {
            warn!(name, error = %e, "Failed to delete staged file");
        }
        self.tasks.remove(name);
    }

    #[instrument(skip(self, staged))]
    async fn promote(&self, name: &str, staged: StagedFile) -> Promotion {
        let cx = &self.uploads;

        if !staged.exists().await {
            debug!("Staged file vanished, dropping task");
            self.tasks.remove(name);
            return Promotion::Missing;
        }

        match self
            .config
            .retry
            .run(cx, "stat", || self.store.stat(name))
            .await
        {
            Ok(_) => {
                debug!("Artifact already durable");
                self.finish(name, staged).await;
                return Promotion::AlreadyDurable;
            }
            Err(Error::CacheNotFound) => {}
            Err(e) if is_transient(&e) => {
                debug!(error = %e, "Stat failed transiently, will retry next tick");
                self.requeue(name.to_string(), staged);
                return Promotion::Retry;
            }
            Err(e) => {
                error!(error = %e, "Stat failed permanently, dropping staged artifact");
                self.finish(name, staged).await;
                return Promotion::Failed;
            }
        }

        let artifact = &staged.artifact;
        let result = self
            .config
            .retry
            .run(cx, "put", || {
                self.store
                    .put_file(name, &artifact.mime_type, &staged.path, artifact.size)
            })
            .await;

        match result {
            Ok(()) => {
                info!(size = artifact.size, "Promoted artifact to durable storage");
                self.finish(name, staged).await;
                Promotion::Uploaded
            }
            Err(e) if is_transient(&e) => {
                warn!(error = %e, "Upload failed transiently, will retry next tick");
                self.requeue(name.to_string(), staged);
                Promotion::Retry
            }
            Err(e) => {
                error!(error = %e, "Upload failed permanently, dropping staged artifact");
                self.finish(name, staged).await;
                Promotion::Failed
            }
        }
    }
}

/// Transient errors leave the task pending for the next tick.
fn is_transient(e: &Error) -> bool {
    e.is_retryable() || matches!(e, Error::Cancelled | Error::Transport(_))
}

// =============================================================================
// Tests
// =============================================================================
