//! Exit-path state transitions.
//!
//! The finalizer is the sole mutator of terminal fields. It reads the typed
//! result the child recorded on the document, decides the next state, writes
//! the transition and the `done execution` record, releases the lock and
//! moves terminal documents to the journal in the same window.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::clock;
use crate::job::{ExecResult, Job, JobState};
use crate::launch::ChildExit;
use crate::logs::{log_event, LogBuffer, LogLevel, LogRecord};
use crate::store::QueueStore;

/// Finalize a supervised execution.
pub(crate) async fn finalize_exit(
    store: &Arc<dyn QueueStore>,
    buffer: &Arc<LogBuffer>,
    job_id: Uuid,
    worker: &str,
    exit: ChildExit,
    kill_requested: bool,
) -> Result<()> {
    let now = clock::now();
    let Some(mut job) = store.find_queue(job_id).await? else {
        // Already finalized elsewhere (e.g. reaped as an orphan).
        return Ok(());
    };
    let result = job.exec_result.take();
    let state = decide(&mut job, &exit, kill_requested, result, now);
    apply(store, buffer, job, state, now, worker).await
}

/// Finalize a running job whose owner is gone: the lock is broken and the
/// job ends `killed`.
pub(crate) async fn finalize_orphan(
    store: &Arc<dyn QueueStore>,
    buffer: &Arc<LogBuffer>,
    mut job: Job,
    worker: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    job.exec_result = None;
    job.killed_at.get_or_insert(now);
    apply(store, buffer, job, JobState::Killed, now, worker).await
}

fn decide(
    job: &mut Job,
    exit: &ChildExit,
    kill_requested: bool,
    result: Option<ExecResult>,
    now: DateTime<Utc>,
) -> JobState {
    if kill_requested {
        job.killed_at.get_or_insert(now);
        return JobState::Killed;
    }
    // The store is the source of truth: a recorded result wins over however
    // the process went down afterwards.
    match result {
        Some(ExecResult::Finished) => JobState::Complete,
        Some(ExecResult::Deferred { message }) => {
            if job.inactive_at.map(|t| now >= t).unwrap_or(false) {
                job.last_error = Some(message);
                JobState::Inactive
            } else {
                job.query_at = Some(now + clock::secs(job.defer_time));
                job.last_error = Some(message);
                JobState::Deferred
            }
        }
        Some(ExecResult::Failed { error }) => fail_state(job, now, error),
        None => match exit {
            ChildExit::Killed => {
                job.killed_at.get_or_insert(now);
                JobState::Killed
            }
            ChildExit::Crashed(error) => fail_state(job, now, error.clone()),
            ChildExit::Finished => {
                fail_state(job, now, "child finished without reporting a result".to_string())
            }
        },
    }
}

fn fail_state(job: &mut Job, now: DateTime<Utc>, error: String) -> JobState {
    job.last_error = Some(error);
    if job.attempts_left > 0 {
        job.query_at = Some(now + clock::secs(job.error_time));
        JobState::Failed
    } else {
        JobState::Error
    }
}

async fn apply(
    store: &Arc<dyn QueueStore>,
    buffer: &Arc<LogBuffer>,
    mut job: Job,
    state: JobState,
    now: DateTime<Utc>,
    worker: &str,
) -> Result<()> {
    job.state = state;
    job.finished_at = Some(now);
    job.runtime = job
        .started_at
        .map(|s| (now - s).num_milliseconds() as f64 / 1000.0);
    job.locked = None;
    store.save(&job).await?;
    store.delete_lock(job.id).await?;
    log_event(
        store,
        LogLevel::Info,
        Some(job.id),
        Some(worker),
        format!("done execution with [{}]", state),
    )
    .await;
    if state == JobState::Error {
        if let Some(error) = &job.last_error {
            buffer
                .push(LogRecord::new(
                    LogLevel::Critical,
                    Some(job.id),
                    Some(worker),
                    format!("job failed terminally: {error}"),
                ))
                .await;
        }
    }
    if state.is_terminal() {
        store.move_to_journal(job.id).await?;
    }
    Ok(())
}
