//! Postgres store backend.
//!
//! Each trait operation is a single statement; the claim protocol uses a
//! `FOR UPDATE SKIP LOCKED` CTE so concurrent workers racing for the head of
//! the queue resolve without retry storms, and the journal move is a
//! `DELETE ... RETURNING` feeding an `INSERT` in one statement so a job is
//! never visible in both collections.
//!
//! All queries are runtime-checked (`sqlx::query`); the schema lives in
//! `migrations/` and is applied by the worker binary at startup.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::job::{ExecResult, Job, JobState};
use crate::logs::{LogLevel, LogRecord};

use super::{QueueStore, StoreResult};

const JOB_COLUMNS: &str = "id, name, args, priority, state, attempts, attempts_left, trial, \
     enqueued_at, started_at, finished_at, query_at, wall_at, zombie_at, killed_at, \
     removed_at, inactive_at, runtime, locked, enqueued, defer_time, defer_max, \
     error_time, wall_time, zombie_time, progress_interval, last_error, exec_result";

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn job_from_row(row: &PgRow) -> StoreResult<Job> {
    let state: String = row.try_get("state")?;
    let args: Value = row.try_get("args")?;
    let locked: Option<Value> = row.try_get("locked")?;
    let enqueued: Value = row.try_get("enqueued")?;
    let exec_result: Option<Value> = row.try_get("exec_result")?;

    Ok(Job {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        args: serde_json::from_value(args)?,
        priority: row.try_get("priority")?,
        state: serde_json::from_value(Value::String(state))?,
        attempts: row.try_get("attempts")?,
        attempts_left: row.try_get("attempts_left")?,
        trial: row.try_get("trial")?,
        enqueued_at: row.try_get("enqueued_at")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        query_at: row.try_get("query_at")?,
        wall_at: row.try_get("wall_at")?,
        zombie_at: row.try_get("zombie_at")?,
        killed_at: row.try_get("killed_at")?,
        removed_at: row.try_get("removed_at")?,
        inactive_at: row.try_get("inactive_at")?,
        runtime: row.try_get("runtime")?,
        locked: locked.map(serde_json::from_value).transpose()?,
        enqueued: serde_json::from_value(enqueued)?,
        defer_time: row.try_get("defer_time")?,
        defer_max: row.try_get("defer_max")?,
        error_time: row.try_get("error_time")?,
        wall_time: row.try_get("wall_time")?,
        zombie_time: row.try_get("zombie_time")?,
        progress_interval: row.try_get("progress_interval")?,
        last_error: row.try_get("last_error")?,
        exec_result: exec_result.map(serde_json::from_value).transpose()?,
    })
}

fn log_from_row(row: &PgRow) -> StoreResult<LogRecord> {
    let level: String = row.try_get("level")?;
    Ok(LogRecord {
        id: row.try_get("id")?,
        job_id: row.try_get("job_id")?,
        worker: row.try_get("worker")?,
        level: LogLevel::parse(&level).unwrap_or(LogLevel::Info),
        message: row.try_get("message")?,
        created: row.try_get("created")?,
    })
}

#[async_trait]
impl QueueStore for PostgresStore {
    async fn insert_queue(&self, job: &Job) -> StoreResult<()> {
        let sql = format!(
            "INSERT INTO queue ({JOB_COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, \
              $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28)"
        );
        sqlx::query(&sql)
            .bind(job.id)
            .bind(&job.name)
            .bind(Value::Object(job.args.clone()))
            .bind(job.priority)
            .bind(job.state.to_string())
            .bind(job.attempts)
            .bind(job.attempts_left)
            .bind(job.trial)
            .bind(job.enqueued_at)
            .bind(job.started_at)
            .bind(job.finished_at)
            .bind(job.query_at)
            .bind(job.wall_at)
            .bind(job.zombie_at)
            .bind(job.killed_at)
            .bind(job.removed_at)
            .bind(job.inactive_at)
            .bind(job.runtime)
            .bind(job.locked.as_ref().map(serde_json::to_value).transpose()?)
            .bind(serde_json::to_value(&job.enqueued)?)
            .bind(job.defer_time)
            .bind(job.defer_max)
            .bind(job.error_time)
            .bind(job.wall_time)
            .bind(job.zombie_time)
            .bind(job.progress_interval)
            .bind(&job.last_error)
            .bind(
                job.exec_result
                    .as_ref()
                    .map(serde_json::to_value)
                    .transpose()?,
            )
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn claim_next(&self, worker: &str, now: DateTime<Utc>) -> StoreResult<Option<Job>> {
        let locked = serde_json::to_value(crate::job::Locked::new(worker, now))?;
        let sql = format!(
            "WITH next AS (
                SELECT id FROM queue
                WHERE state = 'pending'
                  AND removed_at IS NULL
                  AND (query_at IS NULL OR query_at <= $1)
                ORDER BY priority DESC, enqueued_at ASC, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE queue SET
                state = 'running',
                locked = $2,
                started_at = $1,
                trial = trial + 1,
                attempts_left = attempts_left - 1,
                inactive_at = COALESCE(inactive_at, $1 + make_interval(secs => defer_max))
            WHERE id IN (SELECT id FROM next)
            RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(now)
            .bind(locked)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| job_from_row(&r)).transpose()
    }

    async fn release_claim(&self, id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE queue SET
                state = 'pending',
                locked = NULL,
                trial = trial - 1,
                attempts_left = attempts_left + 1
             WHERE id = $1 AND state = 'running'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn promote_due(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE queue SET state = 'pending'
             WHERE state IN ('deferred', 'failed')
               AND (query_at IS NULL OR query_at <= $1)",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn promote_job(&self, id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE queue SET state = 'pending', query_at = NULL
             WHERE id = $1 AND state IN ('deferred', 'failed')",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn next_inactive(&self, now: DateTime<Utc>) -> StoreResult<Option<Job>> {
        let sql = format!(
            "WITH overdue AS (
                SELECT id FROM queue
                WHERE state IN ('pending', 'deferred', 'failed')
                  AND removed_at IS NULL
                  AND inactive_at IS NOT NULL
                  AND inactive_at <= $1
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE queue SET
                state = 'inactive',
                finished_at = $1,
                query_at = NULL,
                runtime = CASE
                    WHEN started_at IS NOT NULL
                    THEN EXTRACT(EPOCH FROM ($1 - started_at))::float8
                END
            WHERE id IN (SELECT id FROM overdue)
            RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query(&sql).bind(now).fetch_optional(&self.pool).await?;
        row.map(|r| job_from_row(&r)).transpose()
    }

    async fn next_removed(&self) -> StoreResult<Option<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM queue
             WHERE removed_at IS NOT NULL AND state <> 'running'
             LIMIT 1"
        );
        let row = sqlx::query(&sql).fetch_optional(&self.pool).await?;
        row.map(|r| job_from_row(&r)).transpose()
    }

    async fn set_locked_pid(&self, id: Uuid, pid: i32) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE queue SET locked = jsonb_set(locked, '{pid}', to_jsonb($2::int4))
             WHERE id = $1 AND state = 'running' AND locked IS NOT NULL",
        )
        .bind(id)
        .bind(pid)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_heartbeat(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE queue
             SET locked = jsonb_set(locked, '{heartbeat}', to_jsonb($2::timestamptz))
             WHERE id = $1 AND state = 'running' AND locked IS NOT NULL",
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_progress(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        value: f64,
        message: &str,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE queue
             SET locked = locked || jsonb_build_object(
                'heartbeat', to_jsonb($2::timestamptz),
                'progress', to_jsonb($2::timestamptz),
                'progress_value', to_jsonb($3::float8),
                'progress_message', to_jsonb($4::text))
             WHERE id = $1 AND state = 'running' AND locked IS NOT NULL",
        )
        .bind(id)
        .bind(now)
        .bind(value)
        .bind(message)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_wall_at(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE queue SET wall_at = $2
             WHERE id = $1 AND state = 'running' AND wall_at IS NULL",
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_zombie_at(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE queue SET zombie_at = $2
             WHERE id = $1 AND state = 'running' AND zombie_at IS NULL",
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_killed_at(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE queue SET killed_at = $2
             WHERE id = $1 AND state = 'running' AND killed_at IS NULL",
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_removed_at(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE queue SET removed_at = COALESCE(removed_at, $2) WHERE id = $1",
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_exec_result(&self, id: Uuid, result: &ExecResult) -> StoreResult<bool> {
        let outcome = serde_json::to_value(result)?;
        let updated = sqlx::query("UPDATE queue SET exec_result = $2 WHERE id = $1")
            .bind(id)
            .bind(outcome)
            .execute(&self.pool)
            .await?;
        Ok(updated.rows_affected() > 0)
    }

    async fn save(&self, job: &Job) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE queue SET
                name = $2, args = $3, priority = $4, state = $5, attempts = $6,
                attempts_left = $7, trial = $8, enqueued_at = $9, started_at = $10,
                finished_at = $11, query_at = $12, wall_at = $13, zombie_at = $14,
                killed_at = $15, removed_at = $16, inactive_at = $17, runtime = $18,
                locked = $19, enqueued = $20, defer_time = $21, defer_max = $22,
                error_time = $23, wall_time = $24, zombie_time = $25,
                progress_interval = $26, last_error = $27, exec_result = $28
             WHERE id = $1",
        )
        .bind(job.id)
        .bind(&job.name)
        .bind(Value::Object(job.args.clone()))
        .bind(job.priority)
        .bind(job.state.to_string())
        .bind(job.attempts)
        .bind(job.attempts_left)
        .bind(job.trial)
        .bind(job.enqueued_at)
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(job.query_at)
        .bind(job.wall_at)
        .bind(job.zombie_at)
        .bind(job.killed_at)
        .bind(job.removed_at)
        .bind(job.inactive_at)
        .bind(job.runtime)
        .bind(job.locked.as_ref().map(serde_json::to_value).transpose()?)
        .bind(serde_json::to_value(&job.enqueued)?)
        .bind(job.defer_time)
        .bind(job.defer_max)
        .bind(job.error_time)
        .bind(job.wall_time)
        .bind(job.zombie_time)
        .bind(job.progress_interval)
        .bind(&job.last_error)
        .bind(
            job.exec_result
                .as_ref()
                .map(serde_json::to_value)
                .transpose()?,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn move_to_journal(&self, id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query(
            "WITH moved AS (DELETE FROM queue WHERE id = $1 RETURNING *)
             INSERT INTO journal SELECT * FROM moved",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_queue(&self, id: Uuid) -> StoreResult<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM queue WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.map(|r| job_from_row(&r)).transpose()
    }

    async fn find_journal(&self, id: Uuid) -> StoreResult<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM journal WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.map(|r| job_from_row(&r)).transpose()
    }

    async fn queue_count(&self, state: Option<JobState>) -> StoreResult<u64> {
        let count: i64 = match state {
            Some(state) => {
                sqlx::query_scalar("SELECT COUNT(*) FROM queue WHERE state = $1")
                    .bind(state.to_string())
                    .fetch_one(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(*) FROM queue")
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(count as u64)
    }

    async fn journal_count(&self) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM journal")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn running_jobs(&self) -> StoreResult<Vec<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM queue WHERE state = 'running'");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn insert_lock(&self, job_id: Uuid, worker: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            "INSERT INTO locks (job_id, worker, acquired_at) VALUES ($1, $2, now())
             ON CONFLICT (job_id) DO NOTHING",
        )
        .bind(job_id)
        .bind(worker)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_lock(&self, job_id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM locks WHERE job_id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn lock_count(&self) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM locks")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn append_log(&self, record: &LogRecord) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO logs (id, job_id, worker, level, message, created)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(record.id)
        .bind(record.job_id)
        .bind(&record.worker)
        .bind(record.level.as_str())
        .bind(&record.message)
        .bind(record.created)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_logs(&self, job_id: Option<Uuid>) -> StoreResult<Vec<LogRecord>> {
        let rows = match job_id {
            Some(job_id) => {
                sqlx::query(
                    "SELECT id, job_id, worker, level, message, created
                     FROM logs WHERE job_id = $1 ORDER BY created ASC",
                )
                .bind(job_id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT id, job_id, worker, level, message, created
                     FROM logs ORDER BY created ASC",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(log_from_row).collect()
    }

    async fn set_maintenance(&self, on: bool) -> StoreResult<()> {
        sqlx::query("UPDATE control SET maintenance = $1 WHERE id = TRUE")
            .bind(on)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn maintenance(&self) -> StoreResult<bool> {
        let on: Option<bool> =
            sqlx::query_scalar("SELECT maintenance FROM control WHERE id = TRUE")
                .fetch_optional(&self.pool)
                .await?;
        Ok(on.unwrap_or(false))
    }

    async fn set_halt(&self, at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query("UPDATE control SET halt_at = $1 WHERE id = TRUE")
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn halt_at(&self) -> StoreResult<Option<DateTime<Utc>>> {
        let at: Option<Option<DateTime<Utc>>> =
            sqlx::query_scalar("SELECT halt_at FROM control WHERE id = TRUE")
                .fetch_optional(&self.pool)
                .await?;
        Ok(at.flatten())
    }

    async fn register_worker(&self, name: &str, now: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO workers (name, heartbeat, cycles) VALUES ($1, $2, 0)
             ON CONFLICT (name) DO UPDATE SET heartbeat = EXCLUDED.heartbeat",
        )
        .bind(name)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn worker_heartbeat(
        &self,
        name: &str,
        now: DateTime<Utc>,
        cycles: u64,
    ) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO workers (name, heartbeat, cycles) VALUES ($1, $2, $3)
             ON CONFLICT (name) DO UPDATE
             SET heartbeat = EXCLUDED.heartbeat, cycles = EXCLUDED.cycles",
        )
        .bind(name)
        .bind(now)
        .bind(cycles as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
