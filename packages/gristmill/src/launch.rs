//! Child launch and the shared execution path.
//!
//! User code runs isolated from the worker loop: either on a spawned task
//! (single-process mode, used by the test suites) or in a separate OS
//! process re-executing the worker binary (so CPU-bound code, panics and
//! native crashes cannot poison the worker). Both paths funnel through
//! [`run_execution`], which validates the job, runs `execute` and writes the
//! typed [`ExecResult`] back through the store — the store, not the parent
//! pipe, is the source of truth for the outcome.

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::class::JobContext;
use crate::clock;
use crate::job::{ExecResult, Job};
use crate::logs::{LogBuffer, LogLevel, LogRecord};
use crate::registry::JobRegistry;
use crate::store::QueueStore;

/// Environment variable carrying the job id when the worker binary is
/// re-executed as a job child.
pub const CHILD_JOB_ENV: &str = "GRISTMILL_CHILD_JOB";

/// How the child went down, as observed by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildExit {
    /// Clean exit; the recorded `ExecResult` decides the state.
    Finished,
    /// Terminated by a signal or aborted; implies `killed` unless the store
    /// already holds a result.
    Killed,
    /// Abnormal exit (panic, nonzero status) with a synthetic message.
    Crashed(String),
}

enum ChildInner {
    Task {
        handle: JoinHandle<()>,
        cancel: CancellationToken,
    },
    Process {
        child: tokio::process::Child,
    },
}

/// Handle to one running job child.
pub struct Child {
    pid: i32,
    inner: ChildInner,
}

impl Child {
    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        match &self.inner {
            ChildInner::Task { handle, .. } => !handle.is_finished(),
            ChildInner::Process { .. } => kill(Pid::from_raw(self.pid), None).is_ok(),
        }
    }

    /// Cooperative termination: cancellation token for tasks, SIGTERM for
    /// processes.
    pub fn request_stop(&self) {
        match &self.inner {
            ChildInner::Task { cancel, .. } => cancel.cancel(),
            ChildInner::Process { .. } => {
                let _ = kill(Pid::from_raw(self.pid), Signal::SIGTERM);
            }
        }
    }

    /// Hard termination after the grace period: task abort or SIGKILL.
    pub fn force_kill(&mut self) {
        match &mut self.inner {
            ChildInner::Task { handle, .. } => handle.abort(),
            ChildInner::Process { child } => {
                let _ = child.start_kill();
            }
        }
    }

    /// Wait for the child to exit. Cancel-safe.
    pub async fn wait(&mut self) -> ChildExit {
        match &mut self.inner {
            ChildInner::Task { handle, .. } => match (&mut *handle).await {
                Ok(()) => ChildExit::Finished,
                Err(e) if e.is_cancelled() => ChildExit::Killed,
                Err(e) => ChildExit::Crashed(format!("job task panicked: {e}")),
            },
            ChildInner::Process { child } => match child.wait().await {
                Ok(status) if status.success() => ChildExit::Finished,
                Ok(status) => match status.signal() {
                    Some(_) => ChildExit::Killed,
                    None => ChildExit::Crashed(format!("child exited with {status}")),
                },
                Err(e) => ChildExit::Crashed(format!("failed to wait on child: {e}")),
            },
        }
    }
}

/// Everything a launcher needs besides the job itself.
pub struct LaunchContext<'a> {
    pub registry: &'a Arc<JobRegistry>,
    pub store: &'a Arc<dyn QueueStore>,
    pub worker: &'a str,
    pub buffer: &'a Arc<LogBuffer>,
}

#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, job: &Job, ctx: LaunchContext<'_>) -> Result<Child>;
}

/// Runs `execute` on a spawned task inside the worker process.
///
/// The pid recorded on the lock is the worker's own. Termination is a
/// cancellation token first, task abort after the grace period.
#[derive(Default)]
pub struct TaskLauncher;

impl TaskLauncher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Launcher for TaskLauncher {
    async fn launch(&self, job: &Job, ctx: LaunchContext<'_>) -> Result<Child> {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let job = job.clone();
        let registry = ctx.registry.clone();
        let store = ctx.store.clone();
        let worker = ctx.worker.to_string();
        let handle =
            tokio::spawn(async move { run_execution(job, registry, store, worker, token).await });
        Ok(Child {
            pid: clock::pid(),
            inner: ChildInner::Task { handle, cancel },
        })
    }
}

/// Spawns the job as a separate OS process by re-executing `program` with
/// [`CHILD_JOB_ENV`] set. The child reconnects to the store from its own
/// configuration, runs the same execution path and reports through the
/// store; its std streams are captured here as job-tagged debug records.
pub struct ProcessLauncher {
    program: PathBuf,
}

impl ProcessLauncher {
    pub fn new(program: PathBuf) -> Self {
        Self { program }
    }

    pub fn current_exe() -> Result<Self> {
        Ok(Self::new(
            std::env::current_exe().context("cannot resolve current executable")?,
        ))
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, job: &Job, ctx: LaunchContext<'_>) -> Result<Child> {
        let mut child = tokio::process::Command::new(&self.program)
            .env(CHILD_JOB_ENV, job.id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn job child for [{}]", job.id))?;
        let pid = child
            .id()
            .map(|p| p as i32)
            .context("spawned job child has no pid")?;
        if let Some(stdout) = child.stdout.take() {
            capture_stream(stdout, job.id, ctx.buffer.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            capture_stream(stderr, job.id, ctx.buffer.clone());
        }
        Ok(Child {
            pid,
            inner: ChildInner::Process { child },
        })
    }
}

fn capture_stream<R>(stream: R, job_id: Uuid, buffer: Arc<LogBuffer>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            buffer
                .push(LogRecord::new(LogLevel::Debug, Some(job_id), None, line))
                .await;
        }
    });
}

/// Entry point for a re-executed job child. Returns `Ok(false)` when the
/// process was not started in child mode.
pub async fn child_main(registry: Arc<JobRegistry>, store: Arc<dyn QueueStore>) -> Result<bool> {
    let Ok(raw) = std::env::var(CHILD_JOB_ENV) else {
        return Ok(false);
    };
    let id: Uuid = raw
        .parse()
        .with_context(|| format!("invalid job id in {CHILD_JOB_ENV}: {raw}"))?;
    let Some(job) = store.find_queue(id).await? else {
        bail!("job [{}] is not in the queue", id);
    };
    let worker = job.locked_worker().unwrap_or("child").to_string();
    run_execution(job, registry, store, worker, CancellationToken::new()).await;
    Ok(true)
}

/// Validate, execute and record the outcome for one trial.
pub(crate) async fn run_execution(
    job: Job,
    registry: Arc<JobRegistry>,
    store: Arc<dyn QueueStore>,
    worker: String,
    cancel: CancellationToken,
) {
    let id = job.id;
    let result = execute_to_result(job, registry, store.clone(), worker, cancel).await;
    if let Err(e) = store.set_exec_result(id, &result).await {
        tracing::error!(job_id = %id, error = %e, "failed to record execution result");
    }
}

async fn execute_to_result(
    job: Job,
    registry: Arc<JobRegistry>,
    store: Arc<dyn QueueStore>,
    worker: String,
    cancel: CancellationToken,
) -> ExecResult {
    let Some(class) = registry.get(&job.name) else {
        return ExecResult::Failed {
            error: format!("unknown job class [{}]", job.name),
        };
    };
    for required in class.required_args() {
        if !job.args.contains_key(*required) {
            return ExecResult::Failed {
                error: format!("missing required argument [{}]", required),
            };
        }
    }
    let ctx = JobContext::new(&job, store, worker, cancel);
    let outcome = class.execute(&ctx).await;
    if let Err(e) = ctx.flush_progress().await {
        tracing::warn!(job_id = %job.id, error = %e, "failed to flush final progress");
    }
    match outcome {
        Ok(()) => match ctx.take_deferred() {
            Some(message) => ExecResult::Deferred { message },
            None => ExecResult::Finished,
        },
        Err(e) => ExecResult::Failed {
            error: format!("{e:#}"),
        },
    }
}
