//! Queue controller and dequeue-protocol scenarios, driven without running
//! worker loops.

use serde_json::{Map, Value};

use crate::job::{Job, JobState};
use crate::queue::EnqueueOptions;
use crate::testing::{self, WorkerHarness};

fn args(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (key, value) in pairs {
        map.insert((*key).to_string(), value.clone());
    }
    map
}

#[tokio::test]
async fn enqueue_applies_class_defaults() {
    let harness = WorkerHarness::new();
    let job = harness
        .queue()
        .enqueue(testing::ERROR, EnqueueOptions::default())
        .await
        .unwrap();

    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempts, 3);
    assert_eq!(job.attempts_left, 3);
    assert_eq!(job.trial, 0);
    assert_eq!(job.priority, 0);
    assert_eq!(job.error_time, 0.2);
    assert!(job.query_at.is_none());
    assert!(job.enqueued.parent_id.is_none());
}

#[tokio::test]
async fn enqueue_overrides_class_defaults() {
    let harness = WorkerHarness::new();
    let options = EnqueueOptions::builder()
        .args(args(&[("i", Value::from(3))]))
        .priority(10i64)
        .attempts(5i64)
        .wall_time(1.5)
        .build();
    let job = harness.queue().enqueue(testing::DUMMY, options).await.unwrap();

    assert_eq!(job.priority, 10);
    assert_eq!(job.attempts, 5);
    assert_eq!(job.attempts_left, 5);
    assert_eq!(job.wall_time, Some(1.5));
    assert_eq!(job.args.get("i"), Some(&Value::from(3)));
}

#[tokio::test]
async fn enqueue_permits_unknown_class_names() {
    let harness = WorkerHarness::new();
    let job = harness
        .queue()
        .enqueue("gristmill.testing.Missing", EnqueueOptions::default())
        .await
        .unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempts, 1);
}

#[tokio::test]
async fn dequeue_respects_priority_then_fifo() {
    let harness = WorkerHarness::new();
    let worker = harness.build_worker("w1");

    let mut enqueued = Vec::new();
    for i in 0..5 {
        let options = EnqueueOptions::builder()
            .args(args(&[("i", Value::from(i))]))
            .build();
        enqueued.push(
            harness
                .queue()
                .enqueue(testing::DUMMY, options)
                .await
                .unwrap()
                .id,
        );
    }

    let mut dequeued = Vec::new();
    for _ in 0..3 {
        dequeued.push(worker.get_next_job().await.unwrap().unwrap().id);
    }
    assert_eq!(&enqueued[0..3], dequeued.as_slice());

    let urgent = harness
        .queue()
        .enqueue(
            testing::DUMMY,
            EnqueueOptions::builder()
                .args(args(&[("i", Value::from(5))]))
                .priority(10i64)
                .build(),
        )
        .await
        .unwrap();
    let next = worker.get_next_job().await.unwrap().unwrap();
    assert_eq!(next.id, urgent.id);
}

#[tokio::test]
async fn dequeued_document_round_trips() {
    let harness = WorkerHarness::new();
    let worker = harness.build_worker("w1");
    harness
        .queue()
        .enqueue(
            testing::DUMMY,
            EnqueueOptions::builder()
                .args(args(&[("sleep", Value::from(0.2))]))
                .build(),
        )
        .await
        .unwrap();

    let claimed = worker.get_next_job().await.unwrap().unwrap();
    assert_eq!(claimed.trial, 1);
    assert_eq!(claimed.attempts_left, 0);
    assert!(claimed.inactive_at.is_some());

    let back = Job::deserialise(claimed.serialise().unwrap()).unwrap();
    assert_eq!(back, claimed);
}

#[tokio::test]
async fn claim_holds_the_transition_lock() {
    let harness = WorkerHarness::new();
    let worker = harness.build_worker("w1");
    harness
        .queue()
        .enqueue(testing::DUMMY, EnqueueOptions::default())
        .await
        .unwrap();

    let claimed = worker.get_next_job().await.unwrap().unwrap();
    assert_eq!(harness.store().lock_count().await.unwrap(), 1);
    assert_eq!(claimed.locked_worker(), Some(worker.identifier()));

    // No second worker may lock the same job while it is held.
    assert!(!harness
        .queue()
        .lock_job(claimed.id, "other.1.worker")
        .await
        .unwrap());

    harness.store().delete_lock(claimed.id).await.unwrap();
    assert!(harness
        .queue()
        .lock_job(claimed.id, "other.1.worker")
        .await
        .unwrap());
}

#[tokio::test]
async fn removed_jobs_are_not_dequeued() {
    let harness = WorkerHarness::new();
    let worker = harness.build_worker("w1");
    let job = harness
        .queue()
        .enqueue(testing::DUMMY, EnqueueOptions::default())
        .await
        .unwrap();

    assert!(harness.queue().remove_job(job.id).await.unwrap());
    // Idempotent.
    assert!(harness.queue().remove_job(job.id).await.unwrap());
    assert!(worker.get_next_job().await.unwrap().is_none());

    assert!(!harness.queue().remove_job(crate::clock::new_id()).await.unwrap());
}

#[tokio::test]
async fn kill_requires_a_running_job() {
    let harness = WorkerHarness::new();
    let job = harness
        .queue()
        .enqueue(testing::DUMMY, EnqueueOptions::default())
        .await
        .unwrap();
    assert!(!harness.queue().kill_job(job.id).await.unwrap());
}

#[tokio::test]
async fn restart_of_pending_job_is_a_noop() {
    let harness = WorkerHarness::new();
    let job = harness
        .queue()
        .enqueue(testing::DUMMY, EnqueueOptions::default())
        .await
        .unwrap();

    let id = harness.queue().restart_job(job.id).await.unwrap();
    assert_eq!(id, job.id);
    let same = harness.queue().find_job(job.id).await.unwrap().unwrap();
    assert_eq!(same.state, JobState::Pending);
}

#[tokio::test]
async fn restart_of_unknown_job_fails() {
    let harness = WorkerHarness::new();
    assert!(harness
        .queue()
        .restart_job(crate::clock::new_id())
        .await
        .is_err());
}

#[tokio::test]
async fn maintenance_flag_round_trips() {
    let harness = WorkerHarness::new();
    assert!(!harness.store().maintenance().await.unwrap());
    harness.queue().enter_maintenance().await.unwrap();
    assert!(harness.store().maintenance().await.unwrap());
    harness.queue().leave_maintenance().await.unwrap();
    assert!(!harness.store().maintenance().await.unwrap());
}

#[tokio::test]
async fn halt_sets_the_global_marker() {
    let harness = WorkerHarness::new();
    assert!(harness.store().halt_at().await.unwrap().is_none());
    let at = harness.queue().halt().await.unwrap();
    assert_eq!(harness.store().halt_at().await.unwrap(), Some(at));
}
