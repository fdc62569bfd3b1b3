//! Queue controller: enqueue, find, remove, kill, restart, global flags.
//!
//! Everything here is an update against the shared store; the controller
//! never talks to workers directly. Cancellation (`kill_job`, `remove_job`)
//! is asynchronous: the marker lands on the document and the owning worker
//! acts on it at its next flagging pass. Callers poll state to observe the
//! outcome.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::clock;
use crate::job::{Enqueued, Job, JobState};
use crate::registry::JobRegistry;
use crate::store::QueueStore;

/// Per-enqueue overrides for the class defaults.
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct EnqueueOptions {
    #[builder(default)]
    pub args: Map<String, Value>,
    #[builder(default, setter(strip_option))]
    pub priority: Option<i64>,
    #[builder(default, setter(strip_option))]
    pub attempts: Option<i64>,
    #[builder(default, setter(strip_option))]
    pub defer_time: Option<f64>,
    #[builder(default, setter(strip_option))]
    pub defer_max: Option<f64>,
    #[builder(default, setter(strip_option))]
    pub error_time: Option<f64>,
    #[builder(default, setter(strip_option))]
    pub wall_time: Option<f64>,
    #[builder(default, setter(strip_option))]
    pub zombie_time: Option<f64>,
    #[builder(default, setter(strip_option))]
    pub progress_interval: Option<f64>,
}

fn enqueued_by() -> String {
    std::env::var("USER").unwrap_or_else(|_| "unknown".to_string())
}

pub struct Queue {
    store: Arc<dyn QueueStore>,
    registry: Arc<JobRegistry>,
}

impl Queue {
    pub fn new(store: Arc<dyn QueueStore>, registry: Arc<JobRegistry>) -> Self {
        Self { store, registry }
    }

    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    /// Create a `pending` job for `name`.
    ///
    /// Enqueue permits any args and any class name; argument validation and
    /// class resolution happen at dispatch. Configuration scalars come from
    /// the class defaults, overridden by `options`.
    pub async fn enqueue(&self, name: &str, options: EnqueueOptions) -> Result<Job> {
        let defaults = self.registry.defaults(name);
        let attempts = options.attempts.unwrap_or(defaults.attempts).max(1);
        let now = clock::now();
        let job = Job {
            id: clock::new_id(),
            name: name.to_string(),
            args: options.args,
            priority: options.priority.unwrap_or(defaults.priority),
            state: JobState::Pending,
            attempts,
            attempts_left: attempts,
            trial: 0,
            enqueued_at: now,
            started_at: None,
            finished_at: None,
            query_at: None,
            wall_at: None,
            zombie_at: None,
            killed_at: None,
            removed_at: None,
            inactive_at: None,
            runtime: None,
            locked: None,
            enqueued: Enqueued {
                by: enqueued_by(),
                at: now,
                parent_id: None,
            },
            defer_time: options.defer_time.unwrap_or(defaults.defer_time),
            defer_max: options.defer_max.unwrap_or(defaults.defer_max),
            error_time: options.error_time.unwrap_or(defaults.error_time),
            wall_time: options.wall_time.or(defaults.wall_time),
            zombie_time: options.zombie_time.unwrap_or(defaults.zombie_time),
            progress_interval: options
                .progress_interval
                .unwrap_or(defaults.progress_interval),
            last_error: None,
            exec_result: None,
        };
        self.store
            .insert_queue(&job)
            .await
            .context("failed to enqueue job")?;
        tracing::debug!(job_id = %job.id, name = %job.name, "enqueued job");
        Ok(job)
    }

    /// Look a job up in the queue, then in the journal.
    pub async fn find_job(&self, id: Uuid) -> Result<Option<Job>> {
        if let Some(job) = self.store.find_queue(id).await? {
            return Ok(Some(job));
        }
        Ok(self.store.find_journal(id).await?)
    }

    /// Apply the removal marker. A non-running job is journalled by the next
    /// `remove_jobs` duty; a running one is terminated by its supervisor.
    /// Idempotent.
    pub async fn remove_job(&self, id: Uuid) -> Result<bool> {
        Ok(self.store.set_removed_at(id, clock::now()).await?)
    }

    /// Request termination of a running job. Returns false unless the job is
    /// currently `running`.
    pub async fn kill_job(&self, id: Uuid) -> Result<bool> {
        Ok(self.store.set_killed_at(id, clock::now()).await?)
    }

    /// Restart a job.
    ///
    /// - `deferred`/`failed`: promoted back to `pending` with `query_at`
    ///   cleared; returns the same id.
    /// - terminal (in the journal): a new job is created copying args and
    ///   configuration, with a fresh attempt budget and
    ///   `enqueued.parent_id` linking back; returns the new id. The parent
    ///   stays in the journal untouched.
    /// - `pending`/`running`: no-op; returns the same id.
    pub async fn restart_job(&self, id: Uuid) -> Result<Uuid> {
        if let Some(job) = self.store.find_queue(id).await? {
            return match job.state {
                JobState::Deferred | JobState::Failed => {
                    self.store.promote_job(id).await?;
                    Ok(id)
                }
                _ => Ok(id),
            };
        }
        let Some(parent) = self.store.find_journal(id).await? else {
            bail!("job [{}] not found", id);
        };
        if !parent.state.is_terminal() {
            // Journal only ever holds terminal or removed documents; a
            // removed non-terminal job cannot be restarted.
            return Ok(id);
        }
        let now = clock::now();
        let child = Job {
            id: clock::new_id(),
            name: parent.name.clone(),
            args: parent.args.clone(),
            priority: parent.priority,
            state: JobState::Pending,
            attempts: parent.attempts,
            attempts_left: parent.attempts,
            trial: 0,
            enqueued_at: now,
            started_at: None,
            finished_at: None,
            query_at: None,
            wall_at: None,
            zombie_at: None,
            killed_at: None,
            removed_at: None,
            inactive_at: None,
            runtime: None,
            locked: None,
            enqueued: Enqueued {
                by: enqueued_by(),
                at: now,
                parent_id: Some(parent.id),
            },
            defer_time: parent.defer_time,
            defer_max: parent.defer_max,
            error_time: parent.error_time,
            wall_time: parent.wall_time,
            zombie_time: parent.zombie_time,
            progress_interval: parent.progress_interval,
            last_error: None,
            exec_result: None,
        };
        self.store
            .insert_queue(&child)
            .await
            .context("failed to enqueue restarted job")?;
        tracing::info!(parent_id = %parent.id, job_id = %child.id, "restarted job");
        Ok(child.id)
    }

    /// While in maintenance, workers stop dequeuing; running jobs continue.
    pub async fn enter_maintenance(&self) -> Result<()> {
        Ok(self.store.set_maintenance(true).await?)
    }

    pub async fn leave_maintenance(&self) -> Result<()> {
        Ok(self.store.set_maintenance(false).await?)
    }

    /// Set the global halt marker. Workers started before the marker exit at
    /// their next loop boundary.
    pub async fn halt(&self) -> Result<DateTime<Utc>> {
        let at = clock::now();
        self.store.set_halt(at).await?;
        Ok(at)
    }

    /// Acquire the transition lock for a job on behalf of `worker`; false if
    /// a lock already exists.
    pub async fn lock_job(&self, id: Uuid, worker: &str) -> Result<bool> {
        Ok(self.store.insert_lock(id, worker).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_builder_defaults() {
        let options = EnqueueOptions::builder().build();
        assert!(options.args.is_empty());
        assert!(options.priority.is_none());
        assert!(options.attempts.is_none());
    }

    #[test]
    fn options_builder_overrides() {
        let mut args = Map::new();
        args.insert("i".to_string(), Value::from(3));
        let options = EnqueueOptions::builder()
            .args(args)
            .priority(10i64)
            .attempts(5i64)
            .wall_time(2.5)
            .build();
        assert_eq!(options.priority, Some(10));
        assert_eq!(options.attempts, Some(5));
        assert_eq!(options.wall_time, Some(2.5));
        assert_eq!(options.args.get("i"), Some(&Value::from(3)));
    }
}
