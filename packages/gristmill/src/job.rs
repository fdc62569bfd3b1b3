//! Job document model.
//!
//! A [`Job`] is the persistent unit of work. It lives in exactly one of the
//! queue or journal collections; the queue holds active jobs, the journal is
//! the append-only archive of terminal ones. All state transitions go through
//! conditional single-document updates on the store, so the document carries
//! everything the state machine needs: counters, deadlines, the lock record
//! and the typed execution result the child reports back.

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Job lifecycle states.
///
/// `pending → running → {complete | failed | error | deferred | inactive |
/// killed}`, with `deferred → pending` on `query_at` maturity and
/// `failed → pending` while attempts remain. Terminal states move the
/// document to the journal in the same update window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    #[default]
    Pending,
    Running,
    Deferred,
    Failed,
    Complete,
    Error,
    Inactive,
    Killed,
}

impl JobState {
    /// Terminal states archive to the journal and never run again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Complete | JobState::Error | JobState::Inactive | JobState::Killed
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Deferred => "deferred",
            JobState::Failed => "failed",
            JobState::Complete => "complete",
            JobState::Error => "error",
            JobState::Inactive => "inactive",
            JobState::Killed => "killed",
        };
        f.write_str(name)
    }
}

impl FromStr for JobState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "pending" => JobState::Pending,
            "running" => JobState::Running,
            "deferred" => JobState::Deferred,
            "failed" => JobState::Failed,
            "complete" => JobState::Complete,
            "error" => JobState::Error,
            "inactive" => JobState::Inactive,
            "killed" => JobState::Killed,
            other => bail!("unknown job state [{}]", other),
        })
    }
}

/// Lock record embedded in a running job document.
///
/// Presence of `locked` plus a row in the lock collection is what "running"
/// means; only the worker named here may transition the job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Locked {
    pub worker: String,
    pub pid: Option<i32>,
    pub heartbeat: DateTime<Utc>,
    /// Time of the last persisted progress record.
    pub progress: Option<DateTime<Utc>>,
    pub progress_value: Option<f64>,
    pub progress_message: Option<String>,
}

impl Locked {
    pub fn new(worker: impl Into<String>, heartbeat: DateTime<Utc>) -> Self {
        Self {
            worker: worker.into(),
            pid: None,
            heartbeat,
            progress: None,
            progress_value: None,
            progress_message: None,
        }
    }
}

/// Enqueue provenance. `parent_id` is set iff this job descends from a
/// restart of a terminal job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enqueued {
    pub by: String,
    pub at: DateTime<Utc>,
    pub parent_id: Option<Uuid>,
}

/// Typed outcome message from the child to the supervisor.
///
/// Defer is a cooperative "not ready" signal, not an error; it is recorded
/// here instead of unwinding user code. The store, not the parent pipe, is
/// the channel: the child writes this into the queue document before it
/// exits, and the finalizer reads it back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecResult {
    Finished,
    Deferred { message: String },
    Failed { error: String },
}

/// The persistent job document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    /// Fully qualified job class name, resolved through the registry.
    pub name: String,
    #[serde(default)]
    pub args: Map<String, Value>,
    /// Higher runs first.
    pub priority: i64,
    pub state: JobState,
    /// Total attempt budget; restored only by a restart that creates a new id.
    pub attempts: i64,
    pub attempts_left: i64,
    /// Number of distinct dequeues of this id; 0 until first dispatch.
    pub trial: i64,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// While set and in the future, dequeue is forbidden.
    pub query_at: Option<DateTime<Utc>>,
    pub wall_at: Option<DateTime<Utc>>,
    pub zombie_at: Option<DateTime<Utc>>,
    pub killed_at: Option<DateTime<Utc>>,
    pub removed_at: Option<DateTime<Utc>>,
    /// Deadline after which a still-waiting job turns `inactive`; pinned at
    /// the first dequeue as `started_at + defer_max`.
    pub inactive_at: Option<DateTime<Utc>>,
    /// Seconds of the last execution.
    pub runtime: Option<f64>,
    pub locked: Option<Locked>,
    pub enqueued: Enqueued,
    pub defer_time: f64,
    pub defer_max: f64,
    pub error_time: f64,
    pub wall_time: Option<f64>,
    pub zombie_time: f64,
    pub progress_interval: f64,
    pub last_error: Option<String>,
    pub exec_result: Option<ExecResult>,
}

impl Job {
    /// Serialise the job into a store document. Lossless for every field.
    pub fn serialise(&self) -> Result<Value> {
        serde_json::to_value(self).context("failed to serialise job document")
    }

    /// Deserialise a store document back into a job, validating the closed
    /// state set and counter invariants. Required execute arguments are NOT
    /// checked here; a missing argument is an execution-time `error`.
    pub fn deserialise(doc: Value) -> Result<Job> {
        let job: Job =
            serde_json::from_value(doc).context("failed to deserialise job document")?;
        job.validate()?;
        Ok(job)
    }

    fn validate(&self) -> Result<()> {
        if self.attempts < 1 {
            bail!("job [{}] has a non-positive attempt budget", self.id);
        }
        if self.attempts_left < 0 || self.trial < 0 {
            bail!("job [{}] has negative counters", self.id);
        }
        if self.attempts_left + (self.trial - 1).max(0) > self.attempts {
            bail!(
                "job [{}] violates attempt accounting: {} left after trial {} of {}",
                self.id,
                self.attempts_left,
                self.trial,
                self.attempts
            );
        }
        if self.state == JobState::Running && self.locked.is_none() {
            bail!("job [{}] is running without a lock record", self.id);
        }
        Ok(())
    }

    /// Worker name in the embedded lock record, if any.
    pub fn locked_worker(&self) -> Option<&str> {
        self.locked.as_ref().map(|l| l.worker.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock;

    fn sample_job() -> Job {
        Job {
            id: clock::new_id(),
            name: "tests.Sample".to_string(),
            args: Map::new(),
            priority: 0,
            state: JobState::Pending,
            attempts: 3,
            attempts_left: 3,
            trial: 0,
            enqueued_at: clock::now(),
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
                at: clock::now(),
                parent_id: None,
            },
            defer_time: 300.0,
            defer_max: 3600.0,
            error_time: 600.0,
            wall_time: None,
            zombie_time: 1800.0,
            progress_interval: 5.0,
            last_error: None,
            exec_result: None,
        }
    }

    #[test]
    fn state_roundtrips_through_strings() {
        for state in [
            JobState::Pending,
            JobState::Running,
            JobState::Deferred,
            JobState::Failed,
            JobState::Complete,
            JobState::Error,
            JobState::Inactive,
            JobState::Killed,
        ] {
            assert_eq!(state.to_string().parse::<JobState>().unwrap(), state);
        }
        assert!("limbo".parse::<JobState>().is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(JobState::Complete.is_terminal());
        assert!(JobState::Error.is_terminal());
        assert!(JobState::Inactive.is_terminal());
        assert!(JobState::Killed.is_terminal());
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::Deferred.is_terminal());
        assert!(!JobState::Failed.is_terminal());
        assert!(!JobState::Running.is_terminal());
    }

    #[test]
    fn serialise_roundtrip_is_lossless() {
        let mut job = sample_job();
        job.args
            .insert("i".to_string(), Value::Number(serde_json::Number::from(7)));
        job.trial = 2;
        job.attempts_left = 1;
        job.started_at = Some(clock::now());
        job.locked = Some(Locked::new("host.1.worker", clock::now()));
        job.state = JobState::Running;
        job.exec_result = Some(ExecResult::Deferred {
            message: "not ready".to_string(),
        });

        let doc = job.serialise().unwrap();
        let back = Job::deserialise(doc).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn deserialise_rejects_unknown_state() {
        let mut doc = sample_job().serialise().unwrap();
        doc["state"] = Value::String("limbo".to_string());
        assert!(Job::deserialise(doc).is_err());
    }

    #[test]
    fn deserialise_rejects_negative_counters() {
        let mut doc = sample_job().serialise().unwrap();
        doc["attempts_left"] = Value::Number(serde_json::Number::from(-1));
        assert!(Job::deserialise(doc).is_err());
    }

    #[test]
    fn deserialise_rejects_broken_attempt_accounting() {
        let mut job = sample_job();
        job.trial = 1;
        job.attempts_left = 4;
        let doc = job.serialise().unwrap();
        assert!(Job::deserialise(doc).is_err());
    }

    #[test]
    fn running_requires_lock_record() {
        let mut job = sample_job();
        job.state = JobState::Running;
        job.trial = 1;
        job.attempts_left = 2;
        let doc = job.serialise().unwrap();
        assert!(Job::deserialise(doc).is_err());
    }
}
