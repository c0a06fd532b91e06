//! Worker harness: polls a queue, executes a handler, commits the outcome.
//!
//! A worker is `(queue, handler, concurrency, visibility_timeout)`. Success
//! acks; retryable failure nacks with exponential backoff; non-retryable
//! failure dead-letters immediately. Shutdown is cooperative: cancellation
//! stops new reservations and in-flight jobs get a drain window.

use crate::metrics::Metrics;
use crate::queue::broker::{Broker, NackOutcome};
use crate::queue::envelope::JobEnvelope;
use crate::trace::TraceContext;
use crate::Error;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Handler failure classification.
#[derive(Debug)]
pub enum HandlerError {
    /// Transient; the job should be retried with backoff.
    Retry(Error),
    /// Terminal; the job goes straight to the DLQ.
    Fatal(Error),
}

impl HandlerError {
    /// Classify by the error's own retryability.
    pub fn from_error(e: Error) -> Self {
        if e.is_retryable() {
            HandlerError::Retry(e)
        } else {
            HandlerError::Fatal(e)
        }
    }

    pub fn inner(&self) -> &Error {
        match self {
            HandlerError::Retry(e) | HandlerError::Fatal(e) => e,
        }
    }
}

/// Execution context handed to handlers: trace fields plus a cancellation
/// token observed across suspension points.
#[derive(Clone)]
pub struct JobContext {
    pub trace: TraceContext,
    pub cancel: CancellationToken,
}

/// A queue consumer.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    async fn handle(&self, job: &JobEnvelope, ctx: &JobContext) -> Result<(), HandlerError>;
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub queue: String,
    pub concurrency: usize,
    pub visibility_timeout: Duration,
    pub poll_interval: Duration,
    pub backoff_base: Duration,
    pub drain_deadline: Duration,
}

impl WorkerConfig {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            concurrency: 2,
            visibility_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(200),
            backoff_base: Duration::from_millis(500),
            drain_deadline: Duration::from_secs(30),
        }
    }
}

/// Worker pool for one queue.
pub struct Worker {
    config: WorkerConfig,
    broker: Arc<dyn Broker>,
    handler: Arc<dyn JobHandler>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        broker: Arc<dyn Broker>,
        handler: Arc<dyn JobHandler>,
        metrics: Arc<Metrics>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            broker,
            handler,
            metrics,
            cancel,
        }
    }

    /// Run the pool until cancelled, then drain.
    pub async fn run(self) {
        let mut tasks = JoinSet::new();
        for slot in 0..self.config.concurrency.max(1) {
            let worker_id = format!("{}#{}", self.config.queue, slot);
            let config = self.config.clone();
            let broker = self.broker.clone();
            let handler = self.handler.clone();
            let metrics = self.metrics.clone();
            let cancel = self.cancel.clone();
            tasks.spawn(async move {
                consume_loop(worker_id, config, broker, handler, metrics, cancel).await;
            });
        }

        self.cancel.cancelled().await;
        info!(queue = %self.config.queue, "worker pool draining");

        let drained = tokio::time::timeout(self.config.drain_deadline, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                queue = %self.config.queue,
                "drain deadline exceeded, abandoning in-flight jobs (visibility expiry will re-deliver)"
            );
            tasks.abort_all();
        }
    }
}

async fn consume_loop(
    worker_id: String,
    config: WorkerConfig,
    broker: Arc<dyn Broker>,
    handler: Arc<dyn JobHandler>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
) {
    info!(worker = %worker_id, queue = %config.queue, "worker started");
    loop {
        if cancel.is_cancelled() {
            break;
        }

        let job = match broker
            .reserve(&config.queue, &worker_id, config.visibility_timeout)
            .await
        {
            Ok(Some(job)) => job,
            Ok(None) => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(config.poll_interval) => continue,
                }
            }
            Err(e) => {
                error!(worker = %worker_id, error = %e, "reserve failed");
                tokio::time::sleep(config.poll_interval).await;
                continue;
            }
        };

        let ctx = JobContext {
            trace: job.trace(),
            cancel: cancel.clone(),
        };
        let started = Instant::now();
        // The visibility timeout is also the upper bound on handler
        // execution; past it the job is re-deliverable elsewhere anyway.
        let outcome = match tokio::time::timeout(
            config.visibility_timeout,
            handler.handle(&job, &ctx),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(HandlerError::Retry(Error::Internal(format!(
                "handler '{}' exceeded visibility timeout",
                handler.name()
            )))),
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(()) => {
                if let Err(e) = broker.ack(&config.queue, job.job_id).await {
                    error!(worker = %worker_id, job_id = %job.job_id, error = %e, "ack failed");
                } else {
                    metrics.record_success(&config.queue, latency_ms);
                    info!(
                        worker = %worker_id,
                        job_id = %job.job_id,
                        meeting_id = %job.meeting_id,
                        trace_id = %job.trace_id,
                        latency_ms,
                        "job completed"
                    );
                }
            }
            Err(HandlerError::Retry(e)) => {
                // Exponential backoff on the attempt that just failed.
                let delay = config.backoff_base * 2u32.saturating_pow(job.attempt);
                warn!(
                    worker = %worker_id,
                    job_id = %job.job_id,
                    meeting_id = %job.meeting_id,
                    trace_id = %job.trace_id,
                    attempt = job.attempt,
                    error = %e,
                    "job failed, retrying"
                );
                match broker
                    .nack(&config.queue, job.job_id, &e.to_string(), delay)
                    .await
                {
                    Ok(NackOutcome::Requeued) => metrics.record_retry(&config.queue),
                    Ok(NackOutcome::DeadLettered) => {
                        metrics.record_dead_letter(&config.queue);
                        error!(
                            worker = %worker_id,
                            job_id = %job.job_id,
                            meeting_id = %job.meeting_id,
                            "attempts exhausted, job dead-lettered"
                        );
                    }
                    Err(nack_err) => {
                        error!(worker = %worker_id, job_id = %job.job_id, error = %nack_err, "nack failed");
                    }
                }
            }
            Err(HandlerError::Fatal(e)) => {
                error!(
                    worker = %worker_id,
                    job_id = %job.job_id,
                    meeting_id = %job.meeting_id,
                    trace_id = %job.trace_id,
                    error = %e,
                    "non-retryable failure, job dead-lettered"
                );
                if let Err(push_err) = broker
                    .dlq_push(&config.queue, job.job_id, &e.to_string())
                    .await
                {
                    error!(worker = %worker_id, job_id = %job.job_id, error = %push_err, "dlq push failed");
                } else {
                    metrics.record_dead_letter(&config.queue);
                }
            }
        }
    }
    info!(worker = %worker_id, "worker stopped");
}
