//! Wall clock, identifiers and process identity.
//!
//! Every timestamp in the system flows through [`now`] so that stores,
//! workers and tests agree on time semantics (UTC, millisecond precision is
//! plenty for queue ordering).

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

/// Current UTC wall-clock time.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Allocate a new job id.
///
/// v7 UUIDs are time-ordered, which makes the `(priority, enqueued_at, id)`
/// dequeue tie-break a true FIFO even when two jobs share an enqueue
/// timestamp.
pub fn new_id() -> Uuid {
    Uuid::now_v7()
}

/// Convert float seconds (the unit used by job configuration scalars) into a
/// chrono duration. Negative inputs clamp to zero.
pub fn secs(seconds: f64) -> Duration {
    Duration::milliseconds((seconds.max(0.0) * 1000.0).round() as i64)
}

/// This process' pid.
pub fn pid() -> i32 {
    std::process::id() as i32
}

fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Worker identifier of the form `<hostname>.<pid>.<name>`, used as
/// `locked.worker` and for lock ownership.
pub fn worker_identifier(name: &str) -> String {
    format!("{}.{}.{}", hostname(), pid(), name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_time_ordered() {
        let a = new_id();
        let b = new_id();
        assert!(a < b);
    }

    #[test]
    fn secs_converts_fractions() {
        assert_eq!(secs(0.25), Duration::milliseconds(250));
        assert_eq!(secs(-1.0), Duration::zero());
    }

    #[test]
    fn identifier_contains_pid_and_name() {
        let id = worker_identifier("worker-1");
        assert!(id.ends_with(".worker-1"));
        assert!(id.contains(&pid().to_string()));
    }
}
