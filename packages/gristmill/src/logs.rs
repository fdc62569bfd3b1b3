//! Structured log records and the critical-flush ring buffer.
//!
//! Lifecycle events ("start execution", "done execution with [...]") are
//! written both to the store's log collection, where tests and operators can
//! query them by job id, and to `tracing` for console output. The
//! [`LogBuffer`] keeps a bounded backlog of low-level records (child stdout
//! chatter, debug noise) and only persists them when something critical
//! happens next to them.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::clock;
use crate::store::QueueStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "debug" => LogLevel::Debug,
            "info" => LogLevel::Info,
            "warning" => LogLevel::Warning,
            "error" => LogLevel::Error,
            "critical" => LogLevel::Critical,
            _ => return None,
        })
    }
}

/// A record in the store's log collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: Uuid,
    pub job_id: Option<Uuid>,
    pub worker: Option<String>,
    pub level: LogLevel,
    pub message: String,
    pub created: DateTime<Utc>,
}

impl LogRecord {
    pub fn new(
        level: LogLevel,
        job_id: Option<Uuid>,
        worker: Option<&str>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: clock::new_id(),
            job_id,
            worker: worker.map(str::to_string),
            level,
            message: message.into(),
            created: clock::now(),
        }
    }
}

/// Append a record to the store and mirror it as a tracing event. Store
/// failures are downgraded to a warning; logging must never take a duty down.
pub(crate) async fn log_event(
    store: &Arc<dyn QueueStore>,
    level: LogLevel,
    job_id: Option<Uuid>,
    worker: Option<&str>,
    message: impl Into<String>,
) {
    let record = LogRecord::new(level, job_id, worker, message);
    match level {
        LogLevel::Debug => tracing::debug!(job_id = ?record.job_id, "{}", record.message),
        LogLevel::Info => tracing::info!(job_id = ?record.job_id, "{}", record.message),
        LogLevel::Warning => tracing::warn!(job_id = ?record.job_id, "{}", record.message),
        LogLevel::Error | LogLevel::Critical => {
            tracing::error!(job_id = ?record.job_id, "{}", record.message)
        }
    }
    if let Err(e) = store.append_log(&record).await {
        tracing::warn!(error = %e, "failed to append log record");
    }
}

/// Fixed-capacity ring of recent sub-threshold records.
///
/// Records below `threshold` are buffered (drop-oldest); records at or above
/// it are persisted immediately. A `Critical` record flushes the buffered
/// backlog to the store along with itself, so the context of a fatal failure
/// survives without persisting every debug line of every healthy job.
pub struct LogBuffer {
    store: Arc<dyn QueueStore>,
    capacity: usize,
    threshold: LogLevel,
    buffer: Mutex<VecDeque<LogRecord>>,
}

impl LogBuffer {
    pub fn new(store: Arc<dyn QueueStore>, capacity: usize, threshold: LogLevel) -> Self {
        Self {
            store,
            capacity: capacity.max(1),
            threshold,
            buffer: Mutex::new(VecDeque::new()),
        }
    }

    /// Number of records currently buffered.
    pub async fn buffered(&self) -> usize {
        self.buffer.lock().await.len()
    }

    pub async fn push(&self, record: LogRecord) {
        if record.level < self.threshold {
            let mut buffer = self.buffer.lock().await;
            if buffer.len() == self.capacity {
                buffer.pop_front();
            }
            buffer.push_back(record);
            return;
        }
        if record.level >= LogLevel::Critical {
            self.flush().await;
        }
        if let Err(e) = self.store.append_log(&record).await {
            tracing::warn!(error = %e, "failed to append log record");
        }
    }

    /// Persist and truncate the buffered backlog.
    pub async fn flush(&self) {
        let drained: Vec<LogRecord> = {
            let mut buffer = self.buffer.lock().await;
            buffer.drain(..).collect()
        };
        for record in drained {
            if let Err(e) = self.store.append_log(&record).await {
                tracing::warn!(error = %e, "failed to flush buffered log record");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn record(level: LogLevel, message: &str) -> LogRecord {
        LogRecord::new(level, None, None, message)
    }

    #[tokio::test]
    async fn buffers_below_threshold() {
        let store: Arc<dyn QueueStore> = Arc::new(MemoryStore::new());
        let ring = LogBuffer::new(store.clone(), 10, LogLevel::Info);

        ring.push(record(LogLevel::Debug, "noise")).await;
        assert_eq!(ring.buffered().await, 1);
        assert_eq!(store.find_logs(None).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn persists_at_threshold() {
        let store: Arc<dyn QueueStore> = Arc::new(MemoryStore::new());
        let ring = LogBuffer::new(store.clone(), 10, LogLevel::Info);

        ring.push(record(LogLevel::Info, "hello")).await;
        assert_eq!(ring.buffered().await, 0);
        assert_eq!(store.find_logs(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn drops_oldest_at_capacity() {
        let store: Arc<dyn QueueStore> = Arc::new(MemoryStore::new());
        let ring = LogBuffer::new(store.clone(), 2, LogLevel::Info);

        ring.push(record(LogLevel::Debug, "one")).await;
        ring.push(record(LogLevel::Debug, "two")).await;
        ring.push(record(LogLevel::Debug, "three")).await;
        assert_eq!(ring.buffered().await, 2);

        ring.push(record(LogLevel::Critical, "boom")).await;
        let persisted = store.find_logs(None).await.unwrap();
        let messages: Vec<&str> = persisted.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["two", "three", "boom"]);
    }

    #[tokio::test]
    async fn critical_flushes_backlog_first() {
        let store: Arc<dyn QueueStore> = Arc::new(MemoryStore::new());
        let ring = LogBuffer::new(store.clone(), 5, LogLevel::Info);

        ring.push(record(LogLevel::Debug, "context")).await;
        ring.push(record(LogLevel::Critical, "fatal")).await;
        assert_eq!(ring.buffered().await, 0);
        assert_eq!(store.find_logs(None).await.unwrap().len(), 2);
    }
}
