//! Job classes and a multi-worker harness for exercising the engine.
//!
//! Everything here runs on the in-memory store with the task launcher and
//! aggressively short intervals, so whole lifecycles play out in well under
//! a second of wall clock per trial.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::class::{JobClass, JobContext};
use crate::launch::TaskLauncher;
use crate::queue::Queue;
use crate::registry::JobRegistry;
use crate::store::{MemoryStore, QueueStore};
use crate::worker::{Worker, WorkerOptions};

pub const DUMMY: &str = "gristmill.testing.Dummy";
pub const ERROR: &str = "gristmill.testing.Error";
pub const DEFER: &str = "gristmill.testing.Defer";
pub const FOREVER: &str = "gristmill.testing.Forever";
pub const NO_PROGRESS: &str = "gristmill.testing.NoProgress";
pub const PROGRESS: &str = "gristmill.testing.Progress";
pub const PANIC: &str = "gristmill.testing.Panic";
pub const REQUIRES_ARG: &str = "gristmill.testing.RequiresArg";
pub const RESTART_DEFERRED: &str = "gristmill.testing.RestartDeferred";
pub const RESTART_FAILED: &str = "gristmill.testing.RestartFailed";
pub const RESTART_ERROR: &str = "gristmill.testing.RestartError";
pub const RESTART_KILLED: &str = "gristmill.testing.RestartKilled";
pub const RESTART_INACTIVE: &str = "gristmill.testing.RestartInactive";

/// Sleeps for `sleep` seconds in small chunks, reporting progress.
pub struct DummyJob;

#[async_trait]
impl JobClass for DummyJob {
    fn author(&self) -> &str {
        "qa"
    }

    async fn execute(&self, ctx: &JobContext) -> Result<()> {
        let total = ctx.arg::<f64>("sleep").unwrap_or(0.1).max(0.0);
        let started = Instant::now();
        let mut step = 0u64;
        while started.elapsed().as_secs_f64() < total {
            step += 1;
            let fraction = (started.elapsed().as_secs_f64() / total.max(f64::MIN_POSITIVE)).min(1.0);
            ctx.progress(fraction, &format!("step {step}")).await?;
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Ok(())
    }
}

/// Fails every trial unless `success` is set, in which case trial 3 passes.
pub struct ErrorJob;

#[async_trait]
impl JobClass for ErrorJob {
    fn author(&self) -> &str {
        "qa"
    }

    fn attempts(&self) -> i64 {
        3
    }

    fn error_time(&self) -> f64 {
        0.2
    }

    async fn execute(&self, ctx: &JobContext) -> Result<()> {
        if let Some(sleep) = ctx.arg::<f64>("sleep") {
            tokio::time::sleep(Duration::from_secs_f64(sleep.max(0.0))).await;
        }
        let success = ctx.arg::<bool>("success").unwrap_or(false);
        if success && ctx.trial() >= 3 {
            return Ok(());
        }
        bail!("expected failure")
    }
}

/// Defers every trial unless `success` is set, in which case trial 2 passes.
pub struct DeferJob;

#[async_trait]
impl JobClass for DeferJob {
    fn author(&self) -> &str {
        "qa"
    }

    fn defer_time(&self) -> f64 {
        0.2
    }

    fn defer_max(&self) -> f64 {
        1.0
    }

    async fn execute(&self, ctx: &JobContext) -> Result<()> {
        let success = ctx.arg::<bool>("success").unwrap_or(false);
        if success && ctx.trial() >= 2 {
            return Ok(());
        }
        ctx.defer("expected defer");
        Ok(())
    }
}

/// Never returns and ignores the cooperative stop signal; only a hard kill
/// ends it.
pub struct ForeverJob;

#[async_trait]
impl JobClass for ForeverJob {
    fn author(&self) -> &str {
        "qa"
    }

    async fn execute(&self, _ctx: &JobContext) -> Result<()> {
        loop {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
    }
}

/// Sleeps without ever reporting progress; the heartbeat goes stale.
pub struct NoProgressJob;

#[async_trait]
impl JobClass for NoProgressJob {
    fn author(&self) -> &str {
        "qa"
    }

    async fn execute(&self, ctx: &JobContext) -> Result<()> {
        let sleep = ctx.arg::<f64>("sleep").unwrap_or(2.0).max(0.0);
        tokio::time::sleep(Duration::from_secs_f64(sleep)).await;
        Ok(())
    }
}

/// Reports progress continuously for `runtime` seconds.
pub struct ProgressJob;

#[async_trait]
impl JobClass for ProgressJob {
    fn author(&self) -> &str {
        "qa"
    }

    fn progress_interval(&self) -> f64 {
        10.0
    }

    async fn execute(&self, ctx: &JobContext) -> Result<()> {
        let runtime = ctx.arg::<f64>("runtime").unwrap_or(1.0).max(0.05);
        let started = Instant::now();
        let mut step = 0u64;
        while started.elapsed().as_secs_f64() < runtime {
            step += 1;
            let fraction = (started.elapsed().as_secs_f64() / runtime).min(1.0);
            ctx.progress(fraction, &format!("at {step}")).await?;
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Ok(())
    }
}

/// Panics, exercising the crash path.
pub struct PanicJob;

#[async_trait]
impl JobClass for PanicJob {
    fn author(&self) -> &str {
        "qa"
    }

    async fn execute(&self, _ctx: &JobContext) -> Result<()> {
        panic!("expected panic");
    }
}

/// Declares a required argument.
pub struct RequiresArgJob;

#[async_trait]
impl JobClass for RequiresArgJob {
    fn author(&self) -> &str {
        "qa"
    }

    fn required_args(&self) -> &'static [&'static str] {
        &["test"]
    }

    async fn execute(&self, _ctx: &JobContext) -> Result<()> {
        Ok(())
    }
}

/// Defers on trial 1 with a long re-query delay; succeeds on trial 2. Only a
/// restart gets it there within test time.
pub struct RestartDeferredJob;

#[async_trait]
impl JobClass for RestartDeferredJob {
    fn author(&self) -> &str {
        "qa"
    }

    fn defer_time(&self) -> f64 {
        120.0
    }

    async fn execute(&self, ctx: &JobContext) -> Result<()> {
        if ctx.trial() >= 2 {
            return Ok(());
        }
        ctx.defer("expected deferred");
        Ok(())
    }
}

/// Fails on trial 1 with a long retry delay; succeeds on trial 2.
pub struct RestartFailedJob;

#[async_trait]
impl JobClass for RestartFailedJob {
    fn author(&self) -> &str {
        "qa"
    }

    fn attempts(&self) -> i64 {
        2
    }

    fn error_time(&self) -> f64 {
        120.0
    }

    async fn execute(&self, ctx: &JobContext) -> Result<()> {
        if ctx.trial() >= 2 {
            return Ok(());
        }
        bail!("expected failure")
    }
}

/// Fails terminally unless running as a restart child.
pub struct RestartErrorJob;

#[async_trait]
impl JobClass for RestartErrorJob {
    fn author(&self) -> &str {
        "qa"
    }

    fn error_time(&self) -> f64 {
        120.0
    }

    async fn execute(&self, ctx: &JobContext) -> Result<()> {
        if ctx.parent_id().is_some() {
            return Ok(());
        }
        bail!("expected failure")
    }
}

/// Hangs unless running as a restart child.
pub struct RestartKilledJob;

#[async_trait]
impl JobClass for RestartKilledJob {
    fn author(&self) -> &str {
        "qa"
    }

    async fn execute(&self, ctx: &JobContext) -> Result<()> {
        if ctx.parent_id().is_some() {
            return Ok(());
        }
        loop {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
    }
}

/// Defers until inactive unless running as a restart child.
pub struct RestartInactiveJob;

#[async_trait]
impl JobClass for RestartInactiveJob {
    fn author(&self) -> &str {
        "qa"
    }

    fn defer_time(&self) -> f64 {
        0.1
    }

    fn defer_max(&self) -> f64 {
        0.5
    }

    async fn execute(&self, ctx: &JobContext) -> Result<()> {
        if ctx.parent_id().is_some() {
            return Ok(());
        }
        ctx.defer("expected defer");
        Ok(())
    }
}

/// Registry with every test class registered.
pub fn registry() -> JobRegistry {
    let mut registry = JobRegistry::new();
    let entries: Vec<(&str, Arc<dyn JobClass>)> = vec![
        (DUMMY, Arc::new(DummyJob)),
        (ERROR, Arc::new(ErrorJob)),
        (DEFER, Arc::new(DeferJob)),
        (FOREVER, Arc::new(ForeverJob)),
        (NO_PROGRESS, Arc::new(NoProgressJob)),
        (PROGRESS, Arc::new(ProgressJob)),
        (PANIC, Arc::new(PanicJob)),
        (REQUIRES_ARG, Arc::new(RequiresArgJob)),
        (RESTART_DEFERRED, Arc::new(RestartDeferredJob)),
        (RESTART_FAILED, Arc::new(RestartFailedJob)),
        (RESTART_ERROR, Arc::new(RestartErrorJob)),
        (RESTART_KILLED, Arc::new(RestartKilledJob)),
        (RESTART_INACTIVE, Arc::new(RestartInactiveJob)),
    ];
    for (name, class) in entries {
        registry
            .register(name, class)
            .unwrap_or_else(|e| panic!("failed to register {name}: {e}"));
    }
    registry
}

/// Worker tuning for tests: tight intervals, short grace.
pub fn fast_options() -> WorkerOptions {
    WorkerOptions {
        name: None,
        work_jobs_interval: 0.05,
        flag_jobs_interval: 0.1,
        collect_stats_interval: 30.0,
        remove_jobs_interval: 0.1,
        kill_grace: 0.3,
        drain_timeout: 5.0,
    }
}

/// Poll `cond` until it holds, failing after `secs` seconds.
pub async fn wait_until<F, Fut>(secs: f64, mut cond: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs_f64(secs);
    while Instant::now() < deadline {
        if cond().await {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    bail!("condition not met within {secs}s")
}

/// Shared store, registry and a pool of workers running as tasks.
pub struct WorkerHarness {
    store: Arc<dyn QueueStore>,
    registry: Arc<JobRegistry>,
    queue: Queue,
    options: WorkerOptions,
    workers: Vec<Arc<Worker>>,
    tasks: Vec<JoinHandle<Result<()>>>,
}

impl Default for WorkerHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerHarness {
    pub fn new() -> Self {
        Self::with_options(fast_options())
    }

    pub fn with_options(options: WorkerOptions) -> Self {
        let store: Arc<dyn QueueStore> = Arc::new(MemoryStore::new());
        let registry = Arc::new(registry());
        let queue = Queue::new(store.clone(), registry.clone());
        Self {
            store,
            registry,
            queue,
            options,
            workers: Vec::new(),
            tasks: Vec::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn workers(&self) -> &[Arc<Worker>] {
        &self.workers
    }

    /// Build a worker wired to the shared store without running it.
    pub fn build_worker(&self, name: &str) -> Worker {
        let mut options = self.options.clone();
        options.name = Some(name.to_string());
        Worker::new(
            self.store.clone(),
            self.registry.clone(),
            Arc::new(TaskLauncher::new()),
            options,
        )
    }

    /// Spawn `count` workers running their control loops.
    pub fn start(&mut self, count: usize) {
        for i in 0..count {
            let worker = Arc::new(self.build_worker(&format!("worker-{}", i + 1)));
            let runner = worker.clone();
            self.tasks
                .push(tokio::spawn(async move { runner.run().await }));
            self.workers.push(worker);
        }
    }

    /// Request exit on every worker and wait for the loops to return.
    pub async fn stop(&mut self) {
        for worker in &self.workers {
            worker.request_exit();
        }
        let tasks: Vec<_> = self.tasks.drain(..).collect();
        futures::future::join_all(tasks).await;
    }

    /// Wait for the worker loops to return on their own (halt marker).
    pub async fn join(&mut self) -> Result<()> {
        for task in self.tasks.drain(..) {
            task.await??;
        }
        Ok(())
    }

    /// Wait until the queue collection is empty, then stop all workers.
    pub async fn wait_queue(&mut self) -> Result<()> {
        let store = self.store.clone();
        wait_until(15.0, move || {
            let store = store.clone();
            async move { store.queue_count(None).await.unwrap_or(1) == 0 }
        })
        .await?;
        self.stop().await;
        Ok(())
    }
}
