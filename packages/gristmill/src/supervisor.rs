//! Per-job supervision.
//!
//! The supervisor launches children, tracks them in a running map, and acts
//! on what the store says about them: wall-time and zombie flags, kill and
//! removal markers, and orphans left behind by dead workers. Child exit is
//! observed by a monitor task per job, which hands the outcome to the
//! finalizer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::clock;
use crate::finalize;
use crate::job::Job;
use crate::launch::{Child, ChildExit, LaunchContext, Launcher};
use crate::logs::{log_event, LogBuffer, LogLevel};
use crate::registry::JobRegistry;
use crate::store::QueueStore;

const EXIT_POLL: Duration = Duration::from_millis(50);

struct RunningJob {
    stop: CancellationToken,
}

pub struct Supervisor {
    store: Arc<dyn QueueStore>,
    registry: Arc<JobRegistry>,
    launcher: Arc<dyn Launcher>,
    identifier: String,
    kill_grace: Duration,
    buffer: Arc<LogBuffer>,
    running: Arc<RwLock<HashMap<Uuid, RunningJob>>>,
}

impl Supervisor {
    pub fn new(
        store: Arc<dyn QueueStore>,
        registry: Arc<JobRegistry>,
        launcher: Arc<dyn Launcher>,
        identifier: String,
        kill_grace: Duration,
        buffer: Arc<LogBuffer>,
    ) -> Self {
        Self {
            store,
            registry,
            launcher,
            identifier,
            kill_grace,
            buffer,
            running: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn running_count(&self) -> usize {
        self.running.read().await.len()
    }

    /// Launch a freshly claimed job and monitor it to completion.
    pub async fn dispatch(&self, job: Job) -> Result<()> {
        log_event(
            &self.store,
            LogLevel::Info,
            Some(job.id),
            Some(&self.identifier),
            "start execution",
        )
        .await;
        let launched = self
            .launcher
            .launch(
                &job,
                LaunchContext {
                    registry: &self.registry,
                    store: &self.store,
                    worker: &self.identifier,
                    buffer: &self.buffer,
                },
            )
            .await;
        let child = match launched {
            Ok(child) => child,
            Err(e) => {
                // The claim and lock are ours; fail the trial instead of
                // leaving a running document behind.
                finalize::finalize_exit(
                    &self.store,
                    &self.buffer,
                    job.id,
                    &self.identifier,
                    ChildExit::Crashed(format!("failed to launch child: {e:#}")),
                    false,
                )
                .await?;
                return Ok(());
            }
        };
        self.store.set_locked_pid(job.id, child.pid()).await?;

        let stop = CancellationToken::new();
        self.running
            .write()
            .await
            .insert(job.id, RunningJob { stop: stop.clone() });

        let store = self.store.clone();
        let buffer = self.buffer.clone();
        let running = self.running.clone();
        let identifier = self.identifier.clone();
        let grace = self.kill_grace;
        let job_id = job.id;
        tokio::spawn(async move {
            let (exit, kill_requested) = supervise_child(child, stop, grace).await;
            if let Err(e) =
                finalize::finalize_exit(&store, &buffer, job_id, &identifier, exit, kill_requested)
                    .await
            {
                tracing::error!(job_id = %job_id, error = %e, "failed to finalize job");
            }
            running.write().await.remove(&job_id);
        });
        Ok(())
    }

    /// One flagging pass over all running documents: wall/zombie markers and
    /// kill propagation for own jobs, reaping for orphans.
    pub async fn flag_jobs(&self, now: DateTime<Utc>) -> Result<()> {
        for doc in self.store.running_jobs().await? {
            let Some(locked) = doc.locked.clone() else {
                continue;
            };
            if locked.worker == self.identifier {
                self.flag_own(&doc, locked.heartbeat, now).await?;
            } else if now - locked.heartbeat > clock::secs(doc.zombie_time * 2.0) {
                // The owning worker stopped heartbeating long ago; break the
                // lock and put the job out of its misery.
                tracing::warn!(job_id = %doc.id, owner = %locked.worker, "reaping orphaned job");
                finalize::finalize_orphan(&self.store, &self.buffer, doc, &self.identifier, now)
                    .await?;
            }
        }
        Ok(())
    }

    async fn flag_own(&self, doc: &Job, heartbeat: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
        if let (Some(wall_time), Some(started_at)) = (doc.wall_time, doc.started_at) {
            if doc.wall_at.is_none()
                && now - started_at >= clock::secs(wall_time)
                && self.store.set_wall_at(doc.id, now).await?
            {
                log_event(
                    &self.store,
                    LogLevel::Info,
                    Some(doc.id),
                    Some(&self.identifier),
                    format!("successfully set non-stop job [{}]", doc.id),
                )
                .await;
            }
        }
        if doc.zombie_at.is_none()
            && now - heartbeat > clock::secs(doc.zombie_time)
            && self.store.set_zombie_at(doc.id, now).await?
        {
            log_event(
                &self.store,
                LogLevel::Info,
                Some(doc.id),
                Some(&self.identifier),
                format!("successfully set zombie job [{}]", doc.id),
            )
            .await;
        }
        if doc.killed_at.is_some() || doc.removed_at.is_some() {
            if let Some(entry) = self.running.read().await.get(&doc.id) {
                entry.stop.cancel();
            }
        }
        Ok(())
    }

    /// Wait for running jobs to finish, up to `timeout`.
    pub async fn drain(&self, timeout: Duration) {
        let started = std::time::Instant::now();
        loop {
            let count = self.running_count().await;
            if count == 0 {
                return;
            }
            if started.elapsed() >= timeout {
                tracing::warn!(count, "drain timed out with jobs still running");
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

/// Wait for the child while honouring termination requests: cooperative stop
/// first, hard kill after the grace period.
async fn supervise_child(
    mut child: Child,
    stop: CancellationToken,
    grace: Duration,
) -> (ChildExit, bool) {
    let exit = loop {
        match tokio::time::timeout(EXIT_POLL, child.wait()).await {
            Ok(exit) => break exit,
            Err(_) => {
                if stop.is_cancelled() {
                    child.request_stop();
                    match tokio::time::timeout(grace, child.wait()).await {
                        Ok(exit) => break exit,
                        Err(_) => {
                            child.force_kill();
                            break child.wait().await;
                        }
                    }
                }
            }
        }
    };
    (exit, stop.is_cancelled())
}
