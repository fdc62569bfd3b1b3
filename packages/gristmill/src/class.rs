//! Job class contract and the execution context handed to user code.
//!
//! A job class supplies metadata defaults (retry budget, defer/error delays,
//! wall/zombie thresholds, progress throttle) and an async `execute`. The
//! [`JobContext`] is the only channel user code gets: typed argument access,
//! throttled progress reporting, a cooperative `defer`, and a cancellation
//! signal for graceful termination.

use std::sync::Arc;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::clock;
use crate::job::Job;
use crate::logs::{log_event, LogLevel};
use crate::store::QueueStore;

/// User-supplied job implementation plus its configuration defaults.
///
/// Defaults are copied onto the job document at enqueue time and can be
/// overridden per enqueue. All durations are float seconds.
#[async_trait]
pub trait JobClass: Send + Sync {
    /// Maintainer tag; required and enforced when the class is registered.
    fn author(&self) -> &str;

    fn attempts(&self) -> i64 {
        1
    }

    /// Re-query delay after a defer.
    fn defer_time(&self) -> f64 {
        300.0
    }

    /// Total waiting budget since the first trial before the job turns
    /// `inactive`.
    fn defer_max(&self) -> f64 {
        3600.0
    }

    /// Re-query delay after a failure with attempts left.
    fn error_time(&self) -> f64 {
        600.0
    }

    /// Runtime after which the job is flagged non-stop (marker only).
    fn wall_time(&self) -> Option<f64> {
        None
    }

    /// Heartbeat staleness after which the job is flagged zombie.
    fn zombie_time(&self) -> f64 {
        1800.0
    }

    /// Minimum seconds between persisted progress records.
    fn progress_interval(&self) -> f64 {
        5.0
    }

    fn priority(&self) -> i64 {
        0
    }

    /// Argument names that must be present for execution to start; a missing
    /// one ends the job in `error` at start, not at enqueue.
    fn required_args(&self) -> &'static [&'static str] {
        &[]
    }

    async fn execute(&self, ctx: &JobContext) -> Result<()>;
}

/// Configuration scalars resolved from a job class (or global defaults for
/// unknown class names, which fail later at dispatch).
#[derive(Debug, Clone)]
pub struct JobDefaults {
    pub attempts: i64,
    pub defer_time: f64,
    pub defer_max: f64,
    pub error_time: f64,
    pub wall_time: Option<f64>,
    pub zombie_time: f64,
    pub progress_interval: f64,
    pub priority: i64,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            attempts: 1,
            defer_time: 300.0,
            defer_max: 3600.0,
            error_time: 600.0,
            wall_time: None,
            zombie_time: 1800.0,
            progress_interval: 5.0,
            priority: 0,
        }
    }
}

impl JobDefaults {
    pub fn from_class(class: &dyn JobClass) -> Self {
        Self {
            attempts: class.attempts().max(1),
            defer_time: class.defer_time(),
            defer_max: class.defer_max(),
            error_time: class.error_time(),
            wall_time: class.wall_time(),
            zombie_time: class.zombie_time(),
            progress_interval: class.progress_interval(),
            priority: class.priority(),
        }
    }
}

/// Execution context for one trial of one job.
///
/// Created by the launcher right before `execute` runs; there is no way to
/// report progress for a job that has not been dispatched.
pub struct JobContext {
    job_id: Uuid,
    name: String,
    trial: i64,
    parent_id: Option<Uuid>,
    args: Map<String, Value>,
    progress_interval: f64,
    worker: String,
    store: Arc<dyn QueueStore>,
    cancel: CancellationToken,
    deferred: Mutex<Option<String>>,
    last_progress: Mutex<Option<DateTime<Utc>>>,
    pending_progress: Mutex<Option<(f64, String)>>,
}

impl JobContext {
    pub(crate) fn new(
        job: &Job,
        store: Arc<dyn QueueStore>,
        worker: String,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            job_id: job.id,
            name: job.name.clone(),
            trial: job.trial,
            parent_id: job.enqueued.parent_id,
            args: job.args.clone(),
            progress_interval: job.progress_interval,
            worker,
            store,
            cancel,
            deferred: Mutex::new(None),
            last_progress: Mutex::new(None),
            pending_progress: Mutex::new(None),
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dequeue count of this id; 1 on the first run.
    pub fn trial(&self) -> i64 {
        self.trial
    }

    /// Set iff this job was created by restarting a terminal job.
    pub fn parent_id(&self) -> Option<Uuid> {
        self.parent_id
    }

    pub fn args(&self) -> &Map<String, Value> {
        &self.args
    }

    /// Typed access to a single argument.
    pub fn arg<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        self.args
            .get(name)
            .cloned()
            .and_then(|value| serde_json::from_value(value).ok())
    }

    /// Report progress. Always refreshes the lock heartbeat; the progress
    /// record itself is persisted at most once per `progress_interval`, and
    /// the last unpersisted observation is flushed at termination.
    pub async fn progress(&self, value: f64, message: &str) -> Result<()> {
        let now = clock::now();
        let due = {
            let last = self.lock_last_progress();
            match *last {
                None => true,
                Some(at) => now - at >= clock::secs(self.progress_interval),
            }
        };
        if due {
            *self.lock_last_progress() = Some(now);
            *self.lock_pending() = None;
            self.persist_progress(now, value, message).await?;
        } else {
            self.store.update_heartbeat(self.job_id, now).await?;
            *self.lock_pending() = Some((value, message.to_string()));
        }
        Ok(())
    }

    /// Cooperative "not ready" signal: sets a flag and returns. The current
    /// trial finishes normally and the job is re-queried after `defer_time`.
    pub fn defer(&self, message: impl Into<String>) {
        *self
            .deferred
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(message.into());
    }

    /// Resolves when the supervisor asks this job to stop.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn take_deferred(&self) -> Option<String> {
        self.deferred.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Persist the last throttled-away progress observation, if any.
    pub(crate) async fn flush_progress(&self) -> Result<()> {
        let pending = self.lock_pending().take();
        if let Some((value, message)) = pending {
            self.persist_progress(clock::now(), value, &message).await?;
        }
        Ok(())
    }

    async fn persist_progress(&self, now: DateTime<Utc>, value: f64, message: &str) -> Result<()> {
        self.store
            .record_progress(self.job_id, now, value, message)
            .await?;
        log_event(
            &self.store,
            LogLevel::Debug,
            Some(self.job_id),
            Some(&self.worker),
            format!("progress [{}] at {:.3}", message, value),
        )
        .await;
        Ok(())
    }

    fn lock_last_progress(&self) -> std::sync::MutexGuard<'_, Option<DateTime<Utc>>> {
        self.last_progress.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Option<(f64, String)>> {
        self.pending_progress
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}
