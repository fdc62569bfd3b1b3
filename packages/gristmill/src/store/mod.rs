//! Store gateway.
//!
//! Workers never talk to each other; all coordination goes through the four
//! collections behind this trait (queue, journal, locks, logs) plus a small
//! control document. Every operation is atomic on a single document or on
//! the lock table's unique key — there are no multi-document transactions,
//! and all races are resolved by conditional updates.
//!
//! Operations are typed rather than a generic filter/update language: the
//! engine's state machine is a closed set of transitions, and each one maps
//! to exactly one conditional update here. Backends: [`MemoryStore`] for
//! in-process deployments and tests, [`PostgresStore`] for shared clusters.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::job::{ExecResult, Job, JobState};
use crate::logs::LogRecord;

/// Store backend failure. The engine treats these as transient: the current
/// duty aborts and the next cycle retries.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(#[from] sqlx::Error),
    #[error("store codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Typed, atomic operations over the queue/journal/locks/logs collections.
///
/// Conditional updates return `false` when their condition did not hold
/// (document missing, wrong state, flag already set); callers decide whether
/// that is an error or an expected race outcome.
#[async_trait]
pub trait QueueStore: Send + Sync {
    // -- queue ------------------------------------------------------------

    async fn insert_queue(&self, job: &Job) -> StoreResult<()>;

    /// Atomically claim the next runnable job for `worker`.
    ///
    /// Filter: `state == pending`, `query_at` null or past, no removal
    /// marker. Sort: priority desc, enqueued_at asc, id asc. Update: state
    /// running, fresh lock record with heartbeat `now`, `started_at = now`,
    /// `trial += 1`, `attempts_left -= 1`, and `inactive_at` pinned to
    /// `now + defer_max` on the first trial.
    async fn claim_next(&self, worker: &str, now: DateTime<Utc>) -> StoreResult<Option<Job>>;

    /// Roll back a claim whose lock insert lost the race: state back to
    /// pending, counters reversed, lock record cleared.
    async fn release_claim(&self, id: Uuid) -> StoreResult<bool>;

    /// Return mature `deferred`/`failed` jobs (`query_at <= now`) to
    /// `pending`. Returns the number of promoted documents.
    async fn promote_due(&self, now: DateTime<Utc>) -> StoreResult<u64>;

    /// Promote one specific `deferred`/`failed` job to `pending`, clearing
    /// `query_at` (the restart path).
    async fn promote_job(&self, id: Uuid) -> StoreResult<bool>;

    /// Atomically flip one waiting job whose `inactive_at` deadline passed
    /// to `inactive` (with `finished_at`/`runtime` filled in) and return it.
    async fn next_inactive(&self, now: DateTime<Utc>) -> StoreResult<Option<Job>>;

    /// One non-running queue document carrying a removal marker, if any.
    async fn next_removed(&self) -> StoreResult<Option<Job>>;

    async fn set_locked_pid(&self, id: Uuid, pid: i32) -> StoreResult<bool>;

    /// Refresh `locked.heartbeat`; only while running.
    async fn update_heartbeat(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<bool>;

    /// Persist a progress observation: heartbeat, progress timestamp, value
    /// and message in one write.
    async fn record_progress(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        value: f64,
        message: &str,
    ) -> StoreResult<bool>;

    /// Set `wall_at` once per running lifetime; false if already set.
    async fn set_wall_at(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<bool>;

    /// Set `zombie_at` once per running lifetime; false if already set.
    async fn set_zombie_at(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<bool>;

    /// Set `killed_at`; only while running.
    async fn set_killed_at(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<bool>;

    /// Apply the removal marker. Idempotent; true while the document exists
    /// in the queue.
    async fn set_removed_at(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<bool>;

    /// Record the child's typed outcome on the queue document.
    async fn set_exec_result(&self, id: Uuid, result: &ExecResult) -> StoreResult<bool>;

    /// Full-document replace by id. Reserved for the lock owner's finalize
    /// transition; ownership makes the blanket write race-free.
    async fn save(&self, job: &Job) -> StoreResult<bool>;

    /// Move a queue document to the journal. Atomic: the job is never in
    /// both collections and never in neither.
    async fn move_to_journal(&self, id: Uuid) -> StoreResult<bool>;

    async fn find_queue(&self, id: Uuid) -> StoreResult<Option<Job>>;
    async fn find_journal(&self, id: Uuid) -> StoreResult<Option<Job>>;
    async fn queue_count(&self, state: Option<JobState>) -> StoreResult<u64>;
    async fn journal_count(&self) -> StoreResult<u64>;
    async fn running_jobs(&self) -> StoreResult<Vec<Job>>;

    // -- locks ------------------------------------------------------------

    /// Insert a lock row; false on duplicate `job_id`. This uniqueness is
    /// the claim protocol's atomic primitive.
    async fn insert_lock(&self, job_id: Uuid, worker: &str) -> StoreResult<bool>;
    async fn delete_lock(&self, job_id: Uuid) -> StoreResult<bool>;
    async fn lock_count(&self) -> StoreResult<u64>;

    // -- logs -------------------------------------------------------------

    async fn append_log(&self, record: &LogRecord) -> StoreResult<()>;
    async fn find_logs(&self, job_id: Option<Uuid>) -> StoreResult<Vec<LogRecord>>;

    // -- control ----------------------------------------------------------

    async fn set_maintenance(&self, on: bool) -> StoreResult<()>;
    async fn maintenance(&self) -> StoreResult<bool>;
    async fn set_halt(&self, at: DateTime<Utc>) -> StoreResult<()>;
    async fn halt_at(&self) -> StoreResult<Option<DateTime<Utc>>>;

    // -- workers ----------------------------------------------------------

    async fn register_worker(&self, name: &str, now: DateTime<Utc>) -> StoreResult<()>;
    async fn worker_heartbeat(&self, name: &str, now: DateTime<Utc>, cycles: u64)
        -> StoreResult<()>;
}
