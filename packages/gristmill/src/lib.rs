//! Gristmill — a distributed job queue.
//!
//! Jobs are persisted in a shared store; worker processes cooperate through
//! atomic single-document updates on that store (no peer-to-peer traffic).
//! Each worker runs a cooperative control loop over a duty plan, claims jobs
//! through an atomic find-and-modify plus a unique lock insert, executes them
//! in isolated children, supervises progress, wall-time, zombie and kill
//! conditions, and finalizes terminal jobs into an append-only journal.
//!
//! # Architecture
//!
//! ```text
//! Queue (controller)                Worker (control loop)
//!     │ enqueue/kill/remove/restart     │ work_jobs ─► claim + lock ─► Supervisor
//!     ▼                                 │ flag_jobs ─► wall/zombie/kill markers
//!   QueueStore  ◄──────────────────────►│ remove_jobs / collect_stats
//!     ▲                                 ▼
//!     └── child writes progress and ExecResult; the finalizer applies the
//!         terminal transition and moves the document to the journal.
//! ```

pub mod class;
pub mod clock;
pub mod config;
mod finalize;
pub mod job;
pub mod launch;
pub mod logs;
pub mod queue;
pub mod registry;
pub mod store;
pub mod supervisor;
pub mod testing;
pub mod worker;

#[cfg(test)]
mod queue_tests;

pub use class::{JobClass, JobContext, JobDefaults};
pub use config::Config;
pub use job::{Enqueued, ExecResult, Job, JobState, Locked};
pub use launch::{
    child_main, Child, ChildExit, LaunchContext, Launcher, ProcessLauncher, TaskLauncher,
    CHILD_JOB_ENV,
};
pub use logs::{LogBuffer, LogLevel, LogRecord};
pub use queue::{EnqueueOptions, Queue};
pub use registry::JobRegistry;
pub use store::{MemoryStore, PostgresStore, QueueStore, StoreError};
pub use supervisor::Supervisor;
pub use worker::{Cycle, Worker, WorkerOptions};
