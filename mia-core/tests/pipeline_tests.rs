//! Pipeline behavior: inline end-to-end, idempotent stages, worker-crash
//! redelivery, rebuild reproducibility, queue-mode workers.

use mia_common::blob::{BlobStore, FsBlobStore};
use mia_common::config::{QueueMode, Settings};
use mia_common::db;
use mia_common::db::artifacts::{self, ArtifactKind};
use mia_common::db::meetings::{self, MeetingMode, MeetingStatus};
use mia_common::events::EventBus;
use mia_common::locks::MeetingLocks;
use mia_common::metrics::Metrics;
use mia_common::queue::broker::{Broker, SqliteBroker};
use mia_common::queue::worker::{JobContext, JobHandler, Worker, WorkerConfig};
use mia_common::trace::TraceContext;
use mia_core::context::PipelineContext;
use mia_core::dispatcher;
use mia_core::finalize::finalize_meeting;
use mia_core::ingest::{ingest_chunk, ChunkIngestRequest};
use mia_core::providers::delivery::MockDeliveryProvider;
use mia_core::providers::enhance::MockEnhancer;
use mia_core::providers::stt::MockSttProvider;
use mia_core::stages::{self, SttHandler};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct TestEnv {
    ctx: Arc<PipelineContext>,
    delivery: Arc<MockDeliveryProvider>,
    _chunks_dir: TempDir,
}

async fn test_env(queue_mode: QueueMode) -> TestEnv {
    let chunks_dir = TempDir::new().unwrap();
    let mut settings = Settings::default();
    settings.queue_mode = queue_mode;
    settings.chunks_dir = chunks_dir.path().display().to_string();
    settings.queue_max_attempts = 3;

    let pool = db::init_memory_database().await.unwrap();
    let delivery = Arc::new(MockDeliveryProvider::new());

    let ctx = Arc::new(PipelineContext {
        settings: Arc::new(settings),
        db: pool.clone(),
        blob: Arc::new(FsBlobStore::new(chunks_dir.path())) as Arc<dyn BlobStore>,
        broker: Arc::new(SqliteBroker::new(pool)),
        bus: EventBus::new(64),
        locks: MeetingLocks::new(),
        metrics: Arc::new(Metrics::new()),
        stt: Arc::new(MockSttProvider),
        enhancer: Arc::new(MockEnhancer),
        delivery: delivery.clone(),
    });

    TestEnv {
        ctx,
        delivery,
        _chunks_dir: chunks_dir,
    }
}

fn chunk_request(meeting_id: &str, seq: Option<i64>, media: &[u8]) -> ChunkIngestRequest {
    ChunkIngestRequest {
        meeting_id: meeting_id.to_string(),
        seq,
        media: media.to_vec(),
        idempotency_key: None,
        trace: TraceContext::new_root(),
    }
}

async fn wait_for_status(
    ctx: &PipelineContext,
    meeting_id: &str,
    expected: MeetingStatus,
    timeout: Duration,
) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        let meeting = meetings::get_meeting(&ctx.db, meeting_id).await.unwrap().unwrap();
        if meeting.status == expected {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

async fn snapshot_artifacts(ctx: &PipelineContext, meeting_id: &str) -> Vec<(String, String)> {
    let kinds = [
        ArtifactKind::RawTranscript,
        ArtifactKind::EnhancedTranscript,
        ArtifactKind::Report,
        ArtifactKind::Scorecard,
        ArtifactKind::Comparison,
    ];
    let mut out = Vec::new();
    for kind in kinds {
        if let Some(content) = artifacts::get_artifact(&ctx.db, meeting_id, kind).await.unwrap() {
            out.push((kind.as_str().to_string(), content));
        }
    }
    out
}

#[tokio::test]
async fn test_inline_happy_path() {
    let env = test_env(QueueMode::Inline).await;
    let ctx = &env.ctx;

    meetings::create_meeting(&ctx.db, "m-1", None, MeetingMode::Batch, &[]).await.unwrap();

    for seq in 0..3 {
        let media = format!("audio chunk {}", seq);
        let outcome = ingest_chunk(ctx, chunk_request("m-1", Some(seq), media.as_bytes()))
            .await
            .unwrap();
        assert_eq!(outcome.chunk_seq, Some(seq));
        assert!(!outcome.is_duplicate);
        assert_eq!(outcome.inline_events.len(), 1, "inline mode returns the transcript event");
    }

    assert!(finalize_meeting(ctx, "m-1", &TraceContext::new_root(), "explicit").await.unwrap());

    let meeting = meetings::get_meeting(&ctx.db, "m-1").await.unwrap().unwrap();
    assert_eq!(meeting.status, MeetingStatus::Done);

    let enhanced = artifacts::get_artifact(&ctx.db, "m-1", ArtifactKind::EnhancedTranscript)
        .await
        .unwrap()
        .expect("enhanced transcript present");
    assert!(!enhanced.is_empty());
    assert_eq!(enhanced.lines().count(), 3);

    let report = artifacts::get_artifact(&ctx.db, "m-1", ArtifactKind::Report)
        .await
        .unwrap()
        .expect("report present");
    let report: serde_json::Value = serde_json::from_str(&report).unwrap();
    assert!(!report["summary"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn test_server_assigns_sequence_when_absent() {
    let env = test_env(QueueMode::Inline).await;
    let ctx = &env.ctx;
    meetings::create_meeting(&ctx.db, "m-1", None, MeetingMode::Batch, &[]).await.unwrap();

    let a = ingest_chunk(ctx, chunk_request("m-1", None, b"first")).await.unwrap();
    let b = ingest_chunk(ctx, chunk_request("m-1", None, b"second")).await.unwrap();
    assert_eq!(a.chunk_seq, Some(0));
    assert_eq!(b.chunk_seq, Some(1));
}

#[tokio::test]
async fn test_duplicate_idempotency_key_is_deduped() {
    let env = test_env(QueueMode::Inline).await;
    let ctx = &env.ctx;
    meetings::create_meeting(&ctx.db, "m-1", None, MeetingMode::Batch, &[]).await.unwrap();

    let mut first = chunk_request("m-1", Some(0), b"audio");
    first.idempotency_key = Some("client-key-1".to_string());
    let outcome = ingest_chunk(ctx, first).await.unwrap();
    assert!(!outcome.is_duplicate);

    let mut second = chunk_request("m-1", Some(0), b"audio");
    second.idempotency_key = Some("client-key-1".to_string());
    let outcome = ingest_chunk(ctx, second).await.unwrap();
    assert!(outcome.is_duplicate);

    assert_eq!(db::chunks::chunk_count(&ctx.db, "m-1").await.unwrap(), 1);
}

#[tokio::test]
async fn test_chunks_rejected_after_finalize() {
    let env = test_env(QueueMode::Inline).await;
    let ctx = &env.ctx;
    meetings::create_meeting(&ctx.db, "m-1", None, MeetingMode::Batch, &[]).await.unwrap();
    ingest_chunk(ctx, chunk_request("m-1", Some(0), b"audio")).await.unwrap();
    finalize_meeting(ctx, "m-1", &TraceContext::new_root(), "explicit").await.unwrap();

    let err = ingest_chunk(ctx, chunk_request("m-1", Some(1), b"late")).await;
    assert!(matches!(err, Err(mia_common::Error::InvalidInput(_))));
}

#[tokio::test]
async fn test_enhance_stage_is_idempotent() {
    let env = test_env(QueueMode::Inline).await;
    let ctx = &env.ctx;
    meetings::create_meeting(&ctx.db, "m-1", None, MeetingMode::Batch, &[]).await.unwrap();
    ingest_chunk(ctx, chunk_request("m-1", Some(0), b"audio")).await.unwrap();

    let trace = TraceContext::new_root();
    assert!(stages::enhancer::run_enhance(ctx, "m-1", &trace).await.unwrap());
    let after_first = snapshot_artifacts(ctx, "m-1").await;

    // Re-delivery of the same logical job is a no-op
    assert!(!stages::enhancer::run_enhance(ctx, "m-1", &trace).await.unwrap());
    assert_eq!(snapshot_artifacts(ctx, "m-1").await, after_first);
}

#[tokio::test]
async fn test_delivery_not_repeated_on_redelivery() {
    let env = test_env(QueueMode::Inline).await;
    let ctx = &env.ctx;
    meetings::create_meeting(
        &ctx.db,
        "m-1",
        None,
        MeetingMode::Batch,
        &["hr@example.com".to_string()],
    )
    .await
    .unwrap();
    ingest_chunk(ctx, chunk_request("m-1", Some(0), b"audio")).await.unwrap();
    finalize_meeting(ctx, "m-1", &TraceContext::new_root(), "explicit").await.unwrap();
    assert_eq!(env.delivery.sent().len(), 1);

    // Duplicate delivery job: the mail must not go out twice
    assert!(!stages::delivery::run_delivery(ctx, "m-1", &TraceContext::new_root()).await.unwrap());
    assert_eq!(env.delivery.sent().len(), 1);
}

#[tokio::test]
async fn test_crash_before_ack_redelivers_with_same_artifacts() {
    let env = test_env(QueueMode::Queue).await;
    let ctx = &env.ctx;
    meetings::create_meeting(&ctx.db, "m-1", None, MeetingMode::Batch, &[]).await.unwrap();
    ingest_chunk(ctx, chunk_request("m-1", Some(0), b"crash test audio")).await.unwrap();

    let handler = SttHandler { ctx: ctx.clone() };

    // First delivery: the handler runs, then the worker "crashes" before ack
    let job = ctx
        .broker
        .reserve(dispatcher::Q_STT, "w-0", Duration::from_millis(30))
        .await
        .unwrap()
        .expect("stt job enqueued");
    let job_ctx = JobContext {
        trace: job.trace(),
        cancel: CancellationToken::new(),
    };
    handler.handle(&job, &job_ctx).await.unwrap();
    let after_first = snapshot_artifacts(ctx, "m-1").await;
    assert!(!after_first.is_empty());

    // Visibility expires; the job is delivered again and deduplicated
    tokio::time::sleep(Duration::from_millis(60)).await;
    let redelivered = ctx
        .broker
        .reserve(dispatcher::Q_STT, "w-1", Duration::from_secs(30))
        .await
        .unwrap()
        .expect("job must be redelivered after crash");
    assert_eq!(redelivered.job_id, job.job_id);
    handler.handle(&redelivered, &job_ctx).await.unwrap();
    ctx.broker.ack(dispatcher::Q_STT, redelivered.job_id).await.unwrap();

    assert_eq!(snapshot_artifacts(ctx, "m-1").await, after_first);
    let segments = db::segments::list_segments(&ctx.db, "m-1").await.unwrap();
    assert_eq!(segments.len(), 1);
}

#[tokio::test]
async fn test_queue_mode_end_to_end_with_workers() {
    let env = test_env(QueueMode::Queue).await;
    let ctx = &env.ctx;
    meetings::create_meeting(
        &ctx.db,
        "m-1",
        None,
        MeetingMode::Batch,
        &["hr@example.com".to_string()],
    )
    .await
    .unwrap();

    let cancel = CancellationToken::new();
    let mut worker_tasks = Vec::new();
    let handlers: Vec<(&str, Arc<dyn JobHandler>)> = vec![
        (dispatcher::Q_STT, Arc::new(stages::SttHandler { ctx: ctx.clone() })),
        (dispatcher::Q_ENHANCER, Arc::new(stages::EnhancerHandler { ctx: ctx.clone() })),
        (dispatcher::Q_ANALYTICS, Arc::new(stages::AnalyticsHandler { ctx: ctx.clone() })),
        (dispatcher::Q_DELIVERY, Arc::new(stages::DeliveryHandler { ctx: ctx.clone() })),
    ];
    for (queue, handler) in handlers {
        let mut config = WorkerConfig::new(queue);
        config.concurrency = 1;
        config.poll_interval = Duration::from_millis(20);
        config.drain_deadline = Duration::from_secs(2);
        let worker = Worker::new(
            config,
            ctx.broker.clone(),
            handler,
            ctx.metrics.clone(),
            cancel.clone(),
        );
        worker_tasks.push(tokio::spawn(worker.run()));
    }

    for seq in 0..3 {
        let media = format!("worker audio {}", seq);
        ingest_chunk(ctx, chunk_request("m-1", Some(seq), media.as_bytes())).await.unwrap();
    }
    finalize_meeting(ctx, "m-1", &TraceContext::new_root(), "explicit").await.unwrap();

    assert!(
        wait_for_status(ctx, "m-1", MeetingStatus::Done, Duration::from_secs(10)).await,
        "pipeline should reach done"
    );
    assert_eq!(env.delivery.sent().len(), 1);

    let artifacts = snapshot_artifacts(ctx, "m-1").await;
    let kinds: Vec<&str> = artifacts.iter().map(|(k, _)| k.as_str()).collect();
    assert_eq!(
        kinds,
        vec!["raw_transcript", "enhanced_transcript", "report", "scorecard", "comparison"]
    );

    cancel.cancel();
    for task in worker_tasks {
        let _ = task.await;
    }
}

#[tokio::test]
async fn test_rebuild_reproduces_identical_artifacts() {
    let env = test_env(QueueMode::Inline).await;
    let ctx = &env.ctx;
    meetings::create_meeting(&ctx.db, "m-1", None, MeetingMode::Batch, &[]).await.unwrap();

    for seq in 0..2 {
        let media = format!("rebuild audio {}", seq);
        ingest_chunk(ctx, chunk_request("m-1", Some(seq), media.as_bytes())).await.unwrap();
    }
    finalize_meeting(ctx, "m-1", &TraceContext::new_root(), "explicit").await.unwrap();
    let original = snapshot_artifacts(ctx, "m-1").await;
    assert_eq!(original.len(), 5);

    // Rebuild: fresh epoch, downstream artifacts cleared, pipeline re-run
    // from the enhancer.
    meetings::bump_rebuild_epoch(&ctx.db, "m-1").await.unwrap();
    artifacts::clear_downstream(&ctx.db, "m-1").await.unwrap();
    meetings::set_status(&ctx.db, "m-1", MeetingStatus::Processing, true).await.unwrap();
    dispatcher::enqueue_enhancer(ctx, "m-1", &TraceContext::new_root()).await.unwrap();

    let meeting = meetings::get_meeting(&ctx.db, "m-1").await.unwrap().unwrap();
    assert_eq!(meeting.status, MeetingStatus::Done);
    assert_eq!(snapshot_artifacts(ctx, "m-1").await, original);
}
