//! In-memory store backend.
//!
//! All collections live behind a single mutex, which makes every operation
//! trivially atomic. This is the backend for single-process deployments and
//! for the test suites; the semantics mirror the Postgres backend exactly.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::clock;
use crate::job::{ExecResult, Job, JobState};
use crate::logs::LogRecord;

use super::{QueueStore, StoreResult};

#[derive(Default)]
struct WorkerStat {
    heartbeat: Option<DateTime<Utc>>,
    cycles: u64,
}

#[derive(Default)]
struct Inner {
    queue: HashMap<Uuid, Job>,
    journal: HashMap<Uuid, Job>,
    locks: HashMap<Uuid, String>,
    logs: Vec<LogRecord>,
    maintenance: bool,
    halt_at: Option<DateTime<Utc>>,
    workers: HashMap<String, WorkerStat>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn claimable(job: &Job, now: DateTime<Utc>) -> bool {
    job.state == JobState::Pending
        && job.removed_at.is_none()
        && job.query_at.map(|q| q <= now).unwrap_or(true)
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn insert_queue(&self, job: &Job) -> StoreResult<()> {
        self.lock().queue.insert(job.id, job.clone());
        Ok(())
    }

    async fn claim_next(&self, worker: &str, now: DateTime<Utc>) -> StoreResult<Option<Job>> {
        let mut inner = self.lock();
        let next = inner
            .queue
            .values()
            .filter(|job| claimable(job, now))
            .min_by_key(|job| (Reverse(job.priority), job.enqueued_at, job.id))
            .map(|job| job.id);
        let Some(id) = next else {
            return Ok(None);
        };
        let Some(job) = inner.queue.get_mut(&id) else {
            return Ok(None);
        };
        job.state = JobState::Running;
        job.locked = Some(crate::job::Locked::new(worker, now));
        job.started_at = Some(now);
        job.trial += 1;
        job.attempts_left -= 1;
        if job.inactive_at.is_none() {
            job.inactive_at = Some(now + clock::secs(job.defer_max));
        }
        Ok(Some(job.clone()))
    }

    async fn release_claim(&self, id: Uuid) -> StoreResult<bool> {
        let mut inner = self.lock();
        let Some(job) = inner.queue.get_mut(&id) else {
            return Ok(false);
        };
        if job.state != JobState::Running {
            return Ok(false);
        }
        job.state = JobState::Pending;
        job.locked = None;
        job.trial -= 1;
        job.attempts_left += 1;
        Ok(true)
    }

    async fn promote_due(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let mut promoted = 0;
        for job in self.lock().queue.values_mut() {
            let waiting = matches!(job.state, JobState::Deferred | JobState::Failed);
            if waiting && job.query_at.map(|q| q <= now).unwrap_or(true) {
                job.state = JobState::Pending;
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    async fn promote_job(&self, id: Uuid) -> StoreResult<bool> {
        let mut inner = self.lock();
        let Some(job) = inner.queue.get_mut(&id) else {
            return Ok(false);
        };
        if !matches!(job.state, JobState::Deferred | JobState::Failed) {
            return Ok(false);
        }
        job.state = JobState::Pending;
        job.query_at = None;
        Ok(true)
    }

    async fn next_inactive(&self, now: DateTime<Utc>) -> StoreResult<Option<Job>> {
        let mut inner = self.lock();
        let overdue = inner
            .queue
            .values()
            .find(|job| {
                matches!(
                    job.state,
                    JobState::Pending | JobState::Deferred | JobState::Failed
                ) && job.removed_at.is_none()
                    && job.inactive_at.map(|t| t <= now).unwrap_or(false)
            })
            .map(|job| job.id);
        let Some(id) = overdue else {
            return Ok(None);
        };
        let Some(job) = inner.queue.get_mut(&id) else {
            return Ok(None);
        };
        job.state = JobState::Inactive;
        job.finished_at = Some(now);
        job.query_at = None;
        job.runtime = job
            .started_at
            .map(|s| (now - s).num_milliseconds() as f64 / 1000.0);
        Ok(Some(job.clone()))
    }

    async fn next_removed(&self) -> StoreResult<Option<Job>> {
        Ok(self
            .lock()
            .queue
            .values()
            .find(|job| job.removed_at.is_some() && job.state != JobState::Running)
            .cloned())
    }

    async fn set_locked_pid(&self, id: Uuid, pid: i32) -> StoreResult<bool> {
        let mut inner = self.lock();
        match inner.queue.get_mut(&id).and_then(|j| j.locked.as_mut()) {
            Some(locked) => {
                locked.pid = Some(pid);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn update_heartbeat(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<bool> {
        let mut inner = self.lock();
        match inner.queue.get_mut(&id).and_then(|j| j.locked.as_mut()) {
            Some(locked) => {
                locked.heartbeat = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn record_progress(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        value: f64,
        message: &str,
    ) -> StoreResult<bool> {
        let mut inner = self.lock();
        match inner.queue.get_mut(&id).and_then(|j| j.locked.as_mut()) {
            Some(locked) => {
                locked.heartbeat = now;
                locked.progress = Some(now);
                locked.progress_value = Some(value);
                locked.progress_message = Some(message.to_string());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_wall_at(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<bool> {
        let mut inner = self.lock();
        let Some(job) = inner.queue.get_mut(&id) else {
            return Ok(false);
        };
        if job.state != JobState::Running || job.wall_at.is_some() {
            return Ok(false);
        }
        job.wall_at = Some(now);
        Ok(true)
    }

    async fn set_zombie_at(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<bool> {
        let mut inner = self.lock();
        let Some(job) = inner.queue.get_mut(&id) else {
            return Ok(false);
        };
        if job.state != JobState::Running || job.zombie_at.is_some() {
            return Ok(false);
        }
        job.zombie_at = Some(now);
        Ok(true)
    }

    async fn set_killed_at(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<bool> {
        let mut inner = self.lock();
        let Some(job) = inner.queue.get_mut(&id) else {
            return Ok(false);
        };
        if job.state != JobState::Running || job.killed_at.is_some() {
            return Ok(false);
        }
        job.killed_at = Some(now);
        Ok(true)
    }

    async fn set_removed_at(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<bool> {
        let mut inner = self.lock();
        let Some(job) = inner.queue.get_mut(&id) else {
            return Ok(false);
        };
        if job.removed_at.is_none() {
            job.removed_at = Some(now);
        }
        Ok(true)
    }

    async fn set_exec_result(&self, id: Uuid, result: &ExecResult) -> StoreResult<bool> {
        let mut inner = self.lock();
        match inner.queue.get_mut(&id) {
            Some(job) => {
                job.exec_result = Some(result.clone());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn save(&self, job: &Job) -> StoreResult<bool> {
        let mut inner = self.lock();
        match inner.queue.get_mut(&job.id) {
            Some(slot) => {
                *slot = job.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn move_to_journal(&self, id: Uuid) -> StoreResult<bool> {
        let mut inner = self.lock();
        match inner.queue.remove(&id) {
            Some(job) => {
                inner.journal.insert(id, job);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn find_queue(&self, id: Uuid) -> StoreResult<Option<Job>> {
        Ok(self.lock().queue.get(&id).cloned())
    }

    async fn find_journal(&self, id: Uuid) -> StoreResult<Option<Job>> {
        Ok(self.lock().journal.get(&id).cloned())
    }

    async fn queue_count(&self, state: Option<JobState>) -> StoreResult<u64> {
        let inner = self.lock();
        Ok(match state {
            Some(state) => inner.queue.values().filter(|j| j.state == state).count() as u64,
            None => inner.queue.len() as u64,
        })
    }

    async fn journal_count(&self) -> StoreResult<u64> {
        Ok(self.lock().journal.len() as u64)
    }

    async fn running_jobs(&self) -> StoreResult<Vec<Job>> {
        Ok(self
            .lock()
            .queue
            .values()
            .filter(|j| j.state == JobState::Running)
            .cloned()
            .collect())
    }

    async fn insert_lock(&self, job_id: Uuid, worker: &str) -> StoreResult<bool> {
        let mut inner = self.lock();
        if inner.locks.contains_key(&job_id) {
            return Ok(false);
        }
        inner.locks.insert(job_id, worker.to_string());
        Ok(true)
    }

    async fn delete_lock(&self, job_id: Uuid) -> StoreResult<bool> {
        Ok(self.lock().locks.remove(&job_id).is_some())
    }

    async fn lock_count(&self) -> StoreResult<u64> {
        Ok(self.lock().locks.len() as u64)
    }

    async fn append_log(&self, record: &LogRecord) -> StoreResult<()> {
        self.lock().logs.push(record.clone());
        Ok(())
    }

    async fn find_logs(&self, job_id: Option<Uuid>) -> StoreResult<Vec<LogRecord>> {
        let inner = self.lock();
        Ok(inner
            .logs
            .iter()
            .filter(|r| job_id.is_none() || r.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn set_maintenance(&self, on: bool) -> StoreResult<()> {
        self.lock().maintenance = on;
        Ok(())
    }

    async fn maintenance(&self) -> StoreResult<bool> {
        Ok(self.lock().maintenance)
    }

    async fn set_halt(&self, at: DateTime<Utc>) -> StoreResult<()> {
        self.lock().halt_at = Some(at);
        Ok(())
    }

    async fn halt_at(&self) -> StoreResult<Option<DateTime<Utc>>> {
        Ok(self.lock().halt_at)
    }

    async fn register_worker(&self, name: &str, now: DateTime<Utc>) -> StoreResult<()> {
        let mut inner = self.lock();
        let stat = inner.workers.entry(name.to_string()).or_default();
        stat.heartbeat = Some(now);
        Ok(())
    }

    async fn worker_heartbeat(
        &self,
        name: &str,
        now: DateTime<Utc>,
        cycles: u64,
    ) -> StoreResult<()> {
        let mut inner = self.lock();
        let stat = inner.workers.entry(name.to_string()).or_default();
        stat.heartbeat = Some(now);
        stat.cycles = cycles;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Enqueued, Locked};
    use serde_json::Map;

    fn pending_job(priority: i64) -> Job {
        let now = clock::now();
        Job {
            id: clock::new_id(),
            name: "tests.Sample".to_string(),
            args: Map::new(),
            priority,
            state: JobState::Pending,
            attempts: 1,
            attempts_left: 1,
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
                by: "tests".to_string(),
                at: now,
                parent_id: None,
            },
            defer_time: 1.0,
            defer_max: 10.0,
            error_time: 1.0,
            wall_time: None,
            zombie_time: 30.0,
            progress_interval: 5.0,
            last_error: None,
            exec_result: None,
        }
    }

    #[tokio::test]
    async fn claim_updates_counters_and_lock_record() {
        let store = MemoryStore::new();
        let job = pending_job(0);
        store.insert_queue(&job).await.unwrap();

        let claimed = store
            .claim_next("host.1.w", clock::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.state, JobState::Running);
        assert_eq!(claimed.trial, 1);
        assert_eq!(claimed.attempts_left, 0);
        assert!(claimed.inactive_at.is_some());
        assert_eq!(claimed.locked_worker(), Some("host.1.w"));

        assert!(store
            .claim_next("host.1.w", clock::now())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn claim_respects_priority_then_fifo() {
        let store = MemoryStore::new();
        let first = pending_job(0);
        let second = pending_job(0);
        let urgent = pending_job(10);
        store.insert_queue(&first).await.unwrap();
        store.insert_queue(&second).await.unwrap();
        store.insert_queue(&urgent).await.unwrap();

        let now = clock::now();
        let a = store.claim_next("w", now).await.unwrap().unwrap();
        let b = store.claim_next("w", now).await.unwrap().unwrap();
        let c = store.claim_next("w", now).await.unwrap().unwrap();
        assert_eq!(a.id, urgent.id);
        assert_eq!(b.id, first.id);
        assert_eq!(c.id, second.id);
    }

    #[tokio::test]
    async fn claim_skips_future_query_at_and_removed() {
        let store = MemoryStore::new();
        let mut delayed = pending_job(0);
        delayed.query_at = Some(clock::now() + clock::secs(60.0));
        let mut removed = pending_job(0);
        removed.removed_at = Some(clock::now());
        store.insert_queue(&delayed).await.unwrap();
        store.insert_queue(&removed).await.unwrap();

        assert!(store.claim_next("w", clock::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn release_claim_restores_pending() {
        let store = MemoryStore::new();
        let job = pending_job(0);
        store.insert_queue(&job).await.unwrap();
        let claimed = store
            .claim_next("w", clock::now())
            .await
            .unwrap()
            .unwrap();

        assert!(store.release_claim(claimed.id).await.unwrap());
        let back = store.find_queue(claimed.id).await.unwrap().unwrap();
        assert_eq!(back.state, JobState::Pending);
        assert_eq!(back.trial, 0);
        assert_eq!(back.attempts_left, 1);
        assert!(back.locked.is_none());
    }

    #[tokio::test]
    async fn lock_uniqueness() {
        let store = MemoryStore::new();
        let id = clock::new_id();
        assert!(store.insert_lock(id, "a").await.unwrap());
        assert!(!store.insert_lock(id, "b").await.unwrap());
        assert_eq!(store.lock_count().await.unwrap(), 1);
        assert!(store.delete_lock(id).await.unwrap());
        assert!(!store.delete_lock(id).await.unwrap());
    }

    #[tokio::test]
    async fn wall_and_zombie_set_exactly_once() {
        let store = MemoryStore::new();
        let mut job = pending_job(0);
        job.state = JobState::Running;
        job.locked = Some(Locked::new("w", clock::now()));
        job.trial = 1;
        job.attempts_left = 0;
        store.insert_queue(&job).await.unwrap();

        let now = clock::now();
        assert!(store.set_wall_at(job.id, now).await.unwrap());
        assert!(!store.set_wall_at(job.id, now).await.unwrap());
        assert!(store.set_zombie_at(job.id, now).await.unwrap());
        assert!(!store.set_zombie_at(job.id, now).await.unwrap());
    }

    #[tokio::test]
    async fn kill_marker_requires_running() {
        let store = MemoryStore::new();
        let job = pending_job(0);
        store.insert_queue(&job).await.unwrap();
        assert!(!store.set_killed_at(job.id, clock::now()).await.unwrap());
    }

    #[tokio::test]
    async fn journal_move_is_exclusive() {
        let store = MemoryStore::new();
        let job = pending_job(0);
        store.insert_queue(&job).await.unwrap();

        assert!(store.move_to_journal(job.id).await.unwrap());
        assert!(!store.move_to_journal(job.id).await.unwrap());
        assert!(store.find_queue(job.id).await.unwrap().is_none());
        assert!(store.find_journal(job.id).await.unwrap().is_some());
        assert_eq!(store.queue_count(None).await.unwrap(), 0);
        assert_eq!(store.journal_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn promote_due_returns_waiting_jobs() {
        let store = MemoryStore::new();
        let mut job = pending_job(0);
        job.state = JobState::Failed;
        job.query_at = Some(clock::now() - clock::secs(1.0));
        store.insert_queue(&job).await.unwrap();

        assert_eq!(store.promote_due(clock::now()).await.unwrap(), 1);
        let back = store.find_queue(job.id).await.unwrap().unwrap();
        assert_eq!(back.state, JobState::Pending);
    }

    #[tokio::test]
    async fn next_inactive_flips_overdue_jobs() {
        let store = MemoryStore::new();
        let mut job = pending_job(0);
        job.inactive_at = Some(clock::now() - clock::secs(1.0));
        store.insert_queue(&job).await.unwrap();

        let flipped = store.next_inactive(clock::now()).await.unwrap().unwrap();
        assert_eq!(flipped.state, JobState::Inactive);
        assert!(flipped.finished_at.is_some());
        assert!(store.next_inactive(clock::now()).await.unwrap().is_none());
    }
}
