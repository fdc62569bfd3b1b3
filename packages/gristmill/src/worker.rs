//! Worker control loop.
//!
//! A worker is one cooperative cycle over an ordered duty plan. Each duty
//! has an interval and runs when due; everything a duty does is a store
//! round-trip, and store failures abort the duty — never the worker. Job
//! execution itself is parallel (one child per running job, owned by the
//! supervisor); the loop only claims, flags and removes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::clock;
use crate::job::Job;
use crate::launch::Launcher;
use crate::logs::{log_event, LogBuffer, LogLevel};
use crate::registry::JobRegistry;
use crate::store::QueueStore;
use crate::supervisor::Supervisor;

/// Worker tuning. All intervals are float seconds.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Short worker name; expanded to `<hostname>.<pid>.<name>`.
    pub name: Option<String>,
    pub work_jobs_interval: f64,
    pub flag_jobs_interval: f64,
    pub collect_stats_interval: f64,
    pub remove_jobs_interval: f64,
    /// Seconds between the cooperative stop and the hard kill.
    pub kill_grace: f64,
    /// Bound on waiting for running jobs when exiting.
    pub drain_timeout: f64,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            name: None,
            work_jobs_interval: 0.25,
            flag_jobs_interval: 3.0,
            collect_stats_interval: 30.0,
            remove_jobs_interval: 1.0,
            kill_grace: 3.0,
            drain_timeout: 10.0,
        }
    }
}

/// Per-duty execution counters; incremented once per duty execution, not per
/// job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cycle {
    pub total: u64,
    pub work_jobs: u64,
    pub flag_jobs: u64,
    pub collect_stats: u64,
    pub remove_jobs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DutyKind {
    WorkJobs,
    FlagJobs,
    CollectStats,
    RemoveJobs,
}

struct Duty {
    kind: DutyKind,
    interval: Duration,
    last_run: Instant,
}

fn create_plan(options: &WorkerOptions) -> Vec<Duty> {
    let now = Instant::now();
    let duty = |kind, secs: f64| Duty {
        kind,
        interval: Duration::from_secs_f64(secs.max(0.0)),
        last_run: now,
    };
    vec![
        duty(DutyKind::WorkJobs, options.work_jobs_interval),
        duty(DutyKind::FlagJobs, options.flag_jobs_interval),
        duty(DutyKind::CollectStats, options.collect_stats_interval),
        duty(DutyKind::RemoveJobs, options.remove_jobs_interval),
    ]
}

pub struct Worker {
    identifier: String,
    options: WorkerOptions,
    store: Arc<dyn QueueStore>,
    supervisor: Arc<Supervisor>,
    cycle: Mutex<Cycle>,
    at: Mutex<Option<DateTime<Utc>>>,
    exit: AtomicBool,
}

impl Worker {
    pub fn new(
        store: Arc<dyn QueueStore>,
        registry: Arc<JobRegistry>,
        launcher: Arc<dyn Launcher>,
        options: WorkerOptions,
    ) -> Self {
        let name = options.name.clone().unwrap_or_else(|| "worker".to_string());
        let identifier = clock::worker_identifier(&name);
        let buffer = Arc::new(LogBuffer::new(store.clone(), 1000, LogLevel::Info));
        let supervisor = Arc::new(Supervisor::new(
            store.clone(),
            registry,
            launcher,
            identifier.clone(),
            Duration::from_secs_f64(options.kill_grace.max(0.0)),
            buffer,
        ));
        Self {
            identifier,
            options,
            store,
            supervisor,
            cycle: Mutex::new(Cycle::default()),
            at: Mutex::new(None),
            exit: AtomicBool::new(false),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn cycle(&self) -> Cycle {
        self.cycle.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Timestamp of the last dispatch, if any.
    pub fn at(&self) -> Option<DateTime<Utc>> {
        *self.at.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Ask the loop to stop claiming, drain running jobs and return.
    pub fn request_exit(&self) {
        self.exit.store(true, Ordering::SeqCst);
    }

    pub fn exit_requested(&self) -> bool {
        self.exit.load(Ordering::SeqCst)
    }

    pub async fn running_count(&self) -> usize {
        self.supervisor.running_count().await
    }

    /// Run the control loop until exit or halt.
    pub async fn run(&self) -> Result<()> {
        let started = clock::now();
        self.store
            .register_worker(&self.identifier, started)
            .await
            .context("store unreachable at worker startup")?;
        tracing::info!(worker = %self.identifier, "worker started");

        let mut plan = create_plan(&self.options);
        let tick = Duration::from_secs_f64(self.options.work_jobs_interval.max(0.01));
        loop {
            if self.exit_requested() {
                break;
            }
            match self.store.halt_at().await {
                Ok(Some(at)) if at > started => {
                    tracing::info!(worker = %self.identifier, "halt requested, exiting");
                    break;
                }
                Err(e) => tracing::warn!(error = %e, "failed to read halt marker"),
                _ => {}
            }
            self.bump(|c| c.total += 1);
            let maintenance = self.store.maintenance().await.unwrap_or(false);
            for duty in plan.iter_mut() {
                if duty.last_run.elapsed() < duty.interval {
                    continue;
                }
                duty.last_run = Instant::now();
                match duty.kind {
                    DutyKind::WorkJobs => {
                        if maintenance {
                            continue;
                        }
                        if let Err(e) = self.work_jobs().await {
                            tracing::warn!(error = %e, "work_jobs duty failed");
                        }
                        self.bump(|c| c.work_jobs += 1);
                    }
                    DutyKind::FlagJobs => {
                        if let Err(e) = self.supervisor.flag_jobs(clock::now()).await {
                            tracing::warn!(error = %e, "flag_jobs duty failed");
                        }
                        self.bump(|c| c.flag_jobs += 1);
                    }
                    DutyKind::CollectStats => {
                        if let Err(e) = self.collect_stats().await {
                            tracing::warn!(error = %e, "collect_stats duty failed");
                        }
                        self.bump(|c| c.collect_stats += 1);
                    }
                    DutyKind::RemoveJobs => {
                        if let Err(e) = self.remove_jobs().await {
                            tracing::warn!(error = %e, "remove_jobs duty failed");
                        }
                        self.bump(|c| c.remove_jobs += 1);
                    }
                }
            }
            tokio::time::sleep(tick).await;
        }

        self.supervisor
            .drain(Duration::from_secs_f64(self.options.drain_timeout.max(0.0)))
            .await;
        tracing::info!(worker = %self.identifier, "worker stopped");
        Ok(())
    }

    /// Claim-one protocol: atomic claim, then the lock insert. A lost lock
    /// race rolls the claim back and tries the next candidate.
    pub async fn get_next_job(&self) -> Result<Option<Job>> {
        let now = clock::now();
        for _ in 0..3 {
            let Some(job) = self.store.claim_next(&self.identifier, now).await? else {
                return Ok(None);
            };
            if self.store.insert_lock(job.id, &self.identifier).await? {
                return Ok(Some(job));
            }
            tracing::warn!(job_id = %job.id, "lock conflict on claimed job, rolling back");
            self.store.release_claim(job.id).await?;
        }
        Ok(None)
    }

    async fn work_jobs(&self) -> Result<()> {
        let now = clock::now();
        self.store.promote_due(now).await?;
        while let Some(job) = self.store.next_inactive(now).await? {
            log_event(
                &self.store,
                LogLevel::Info,
                Some(job.id),
                Some(&self.identifier),
                format!("done execution with [{}]", job.state),
            )
            .await;
            self.store.move_to_journal(job.id).await?;
        }
        if let Some(job) = self.get_next_job().await? {
            *self.at.lock().unwrap_or_else(|e| e.into_inner()) = Some(now);
            self.supervisor.dispatch(job).await?;
        }
        Ok(())
    }

    async fn collect_stats(&self) -> Result<()> {
        let cycles = self.cycle().total;
        self.store
            .worker_heartbeat(&self.identifier, clock::now(), cycles)
            .await?;
        Ok(())
    }

    async fn remove_jobs(&self) -> Result<()> {
        while let Some(job) = self.store.next_removed().await? {
            tracing::info!(job_id = %job.id, state = %job.state, "removing job");
            self.store.move_to_journal(job.id).await?;
        }
        Ok(())
    }

    fn bump(&self, f: impl FnOnce(&mut Cycle)) {
        f(&mut self.cycle.lock().unwrap_or_else(|e| e.into_inner()));
    }
}
