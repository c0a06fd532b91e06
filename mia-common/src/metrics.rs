//! Worker metric counters.
//!
//! A plain in-process registry; exporters are out of scope. Counters are
//! read back by the admin surface and shutdown logs.

use serde_json::json;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Default, Clone)]
pub struct QueueCounters {
    pub succeeded: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub latency_ms_total: u64,
    pub latency_samples: u64,
}

impl QueueCounters {
    pub fn mean_latency_ms(&self) -> f64 {
        if self.latency_samples == 0 {
            0.0
        } else {
            self.latency_ms_total as f64 / self.latency_samples as f64
        }
    }
}

/// Shared counter registry keyed by queue name.
#[derive(Default)]
pub struct Metrics {
    queues: Mutex<HashMap<String, QueueCounters>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, queue: &str, latency_ms: u64) {
        let mut map = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        let counters = map.entry(queue.to_string()).or_default();
        counters.succeeded += 1;
        counters.latency_ms_total += latency_ms;
        counters.latency_samples += 1;
    }

    pub fn record_retry(&self, queue: &str) {
        let mut map = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(queue.to_string()).or_default().retried += 1;
    }

    pub fn record_dead_letter(&self, queue: &str) {
        let mut map = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(queue.to_string()).or_default().dead_lettered += 1;
    }

    pub fn counters(&self, queue: &str) -> QueueCounters {
        let map = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        map.get(queue).cloned().unwrap_or_default()
    }

    /// JSON snapshot for the admin surface.
    pub fn snapshot(&self) -> serde_json::Value {
        let map = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = serde_json::Map::new();
        for (queue, counters) in map.iter() {
            out.insert(
                queue.clone(),
                json!({
                    "succeeded": counters.succeeded,
                    "retried": counters.retried,
                    "dead_lettered": counters.dead_lettered,
                    "mean_latency_ms": counters.mean_latency_ms(),
                }),
            );
        }
        serde_json::Value::Object(out)
    }
}
