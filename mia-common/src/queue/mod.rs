//! Queue fabric: job envelope, broker, worker harness.
//!
//! Named FIFO queues with at-least-once delivery: a reserved job stays in a
//! pending state until acked; when its visibility timeout lapses it becomes
//! reservable again. Exhausted retries land in a per-queue dead-letter
//! queue.

pub mod broker;
pub mod envelope;
pub mod worker;

pub use broker::{Broker, NackOutcome, QueueHealth, SqliteBroker};
pub use envelope::JobEnvelope;
pub use worker::{HandlerError, JobContext, JobHandler, Worker, WorkerConfig};
