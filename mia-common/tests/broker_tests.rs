//! Broker semantics: at-least-once delivery, retry/backoff, DLQ routing,
//! per-queue health isolation.

use mia_common::db::init_memory_database;
use mia_common::queue::broker::{queues_health, Broker, NackOutcome, SqliteBroker};
use mia_common::queue::envelope::JobEnvelope;
use mia_common::trace::TraceContext;
use serde_json::json;
use std::time::Duration;

fn job(queue: &str, meeting: &str, max_attempts: u32) -> JobEnvelope {
    JobEnvelope::new(
        queue,
        meeting,
        "stt",
        json!({"chunk_seq": 0}),
        &TraceContext::new_root(),
        max_attempts,
    )
}

async fn broker() -> SqliteBroker {
    let pool = init_memory_database().await.unwrap();
    SqliteBroker::new(pool)
}

#[tokio::test]
async fn test_enqueue_reserve_ack() {
    let broker = broker().await;
    let job = job("q:stt", "m-1", 3);
    broker.enqueue(&job).await.unwrap();
    assert_eq!(broker.depth("q:stt").await.unwrap(), 1);

    let reserved = broker
        .reserve("q:stt", "w-0", Duration::from_secs(30))
        .await
        .unwrap()
        .expect("job should be reservable");
    assert_eq!(reserved.job_id, job.job_id);
    assert_eq!(broker.depth("q:stt").await.unwrap(), 0);
    assert_eq!(broker.pending_depth("q:stt").await.unwrap(), 1);

    // Reserved job is invisible to other workers
    assert!(broker
        .reserve("q:stt", "w-1", Duration::from_secs(30))
        .await
        .unwrap()
        .is_none());

    broker.ack("q:stt", job.job_id).await.unwrap();
    assert_eq!(broker.pending_depth("q:stt").await.unwrap(), 0);
}

#[tokio::test]
async fn test_visibility_expiry_redelivers() {
    let broker = broker().await;
    let job = job("q:stt", "m-1", 3);
    broker.enqueue(&job).await.unwrap();

    // Worker reserves then "crashes" (never acks) with a tiny visibility
    let first = broker
        .reserve("q:stt", "w-0", Duration::from_millis(20))
        .await
        .unwrap();
    assert!(first.is_some());

    tokio::time::sleep(Duration::from_millis(40)).await;

    let redelivered = broker
        .reserve("q:stt", "w-1", Duration::from_secs(30))
        .await
        .unwrap()
        .expect("expired pending job should be re-deliverable");
    assert_eq!(redelivered.job_id, job.job_id);
}

#[tokio::test]
async fn test_fifo_order_under_normal_operation() {
    let broker = broker().await;
    let first = job("q:stt", "m-1", 3);
    broker.enqueue(&first).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = job("q:stt", "m-1", 3);
    broker.enqueue(&second).await.unwrap();

    let got = broker
        .reserve("q:stt", "w-0", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got.job_id, first.job_id);
}

#[tokio::test]
async fn test_nack_requeues_with_delay_then_dead_letters() {
    let broker = broker().await;
    let job = job("q:enhancer", "m-1", 2);
    broker.enqueue(&job).await.unwrap();

    let reserved = broker
        .reserve("q:enhancer", "w-0", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();

    // First failure: requeued with a delay, not immediately visible
    let outcome = broker
        .nack("q:enhancer", reserved.job_id, "provider 500", Duration::from_millis(30))
        .await
        .unwrap();
    assert_eq!(outcome, NackOutcome::Requeued);
    assert!(broker
        .reserve("q:enhancer", "w-0", Duration::from_secs(30))
        .await
        .unwrap()
        .is_none());

    tokio::time::sleep(Duration::from_millis(50)).await;
    let retried = broker
        .reserve("q:enhancer", "w-0", Duration::from_secs(30))
        .await
        .unwrap()
        .expect("job visible after backoff");
    assert_eq!(retried.attempt, 1);

    // Second failure exhausts max_attempts=2: dead-lettered exactly once
    let outcome = broker
        .nack("q:enhancer", retried.job_id, "provider 500 again", Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(outcome, NackOutcome::DeadLettered);

    assert_eq!(broker.depth("q:enhancer").await.unwrap(), 0);
    assert_eq!(broker.pending_depth("q:enhancer").await.unwrap(), 0);
    assert_eq!(broker.dlq_depth("q:enhancer").await.unwrap(), 1);

    let entries = broker.list_dlq("q:enhancer", 10).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].reason, "provider 500 again");
}

#[tokio::test]
async fn test_dlq_push_skips_retries() {
    let broker = broker().await;
    let job = job("q:delivery", "m-1", 5);
    broker.enqueue(&job).await.unwrap();
    broker
        .reserve("q:delivery", "w-0", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();

    broker
        .dlq_push("q:delivery", job.job_id, "auth: 401")
        .await
        .unwrap();

    assert_eq!(broker.dlq_depth("q:delivery").await.unwrap(), 1);
    assert_eq!(broker.depth("q:delivery").await.unwrap(), 0);
}

#[tokio::test]
async fn test_dlq_replay_resets_attempts_and_keeps_trace() {
    let broker = broker().await;
    let original = job("q:stt", "m-1", 1);
    broker.enqueue(&original).await.unwrap();
    let reserved = broker
        .reserve("q:stt", "w-0", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    broker
        .nack("q:stt", reserved.job_id, "boom", Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(broker.dlq_depth("q:stt").await.unwrap(), 1);

    let replayed = broker.replay_dlq("q:stt", 10).await.unwrap();
    assert_eq!(replayed, 1);
    assert_eq!(broker.dlq_depth("q:stt").await.unwrap(), 0);

    let back = broker
        .reserve("q:stt", "w-0", Duration::from_secs(30))
        .await
        .unwrap()
        .expect("replayed job should be reservable");
    assert_eq!(back.job_id, original.job_id);
    assert_eq!(back.attempt, 0);
    assert_eq!(back.trace_id, original.trace_id);
}

#[tokio::test]
async fn test_queue_isolation() {
    let broker = broker().await;
    broker.enqueue(&job("q:stt", "m-1", 3)).await.unwrap();

    assert!(broker
        .reserve("q:enhancer", "w-0", Duration::from_secs(30))
        .await
        .unwrap()
        .is_none());
    assert_eq!(broker.depth("q:enhancer").await.unwrap(), 0);
    assert_eq!(broker.depth("q:stt").await.unwrap(), 1);
}

#[tokio::test]
async fn test_queues_health_reports_all_queues() {
    let broker = broker().await;
    broker.enqueue(&job("q:stt", "m-1", 3)).await.unwrap();

    let report = queues_health(&broker, &["q:stt", "q:enhancer"]).await;
    assert_eq!(report.len(), 2);
    assert_eq!(report[0].depth, Some(1));
    assert_eq!(report[1].depth, Some(0));
    assert!(report.iter().all(|q| q.error.is_none()));
}
