//! Event types for the MIA event system.
//!
//! Events are broadcast in-process via `EventBus` and, for events that must
//! cross the worker/gateway process boundary, appended to the
//! `pipeline_events` feed table (see `db::events_feed`).

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// MIA event types
///
/// Serialized with a `type` tag so the same shape goes out on WebSocket
/// frames and into the feed table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MiaEvent {
    /// A transcript segment was produced or updated for a meeting.
    #[serde(rename = "transcript.update")]
    TranscriptUpdate {
        meeting_id: String,
        /// Highest chunk sequence covered by this update
        seq_high: i64,
        speaker: Option<String>,
        text: String,
        /// Enhancement quality ratio (1.0 = unchanged)
        quality: Option<f64>,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// The analytics report for a meeting is ready.
    #[serde(rename = "report")]
    ReportReady {
        meeting_id: String,
        summary: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Meeting pipeline status moved forward.
    #[serde(rename = "meeting.status")]
    MeetingStatusChanged {
        meeting_id: String,
        old_status: String,
        new_status: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A job exhausted its attempts and landed in a dead-letter queue.
    #[serde(rename = "job.dead_lettered")]
    JobDeadLettered {
        queue: String,
        job_id: String,
        meeting_id: String,
        reason: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Connector session state transition.
    #[serde(rename = "connector.session")]
    ConnectorSessionChanged {
        meeting_id: String,
        provider: String,
        state: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Circuit breaker state transition.
    #[serde(rename = "breaker.state")]
    BreakerStateChanged {
        provider: String,
        state: String,
        reason: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl MiaEvent {
    /// Event type tag for filtering.
    pub fn event_type(&self) -> &'static str {
        match self {
            MiaEvent::TranscriptUpdate { .. } => "transcript.update",
            MiaEvent::ReportReady { .. } => "report",
            MiaEvent::MeetingStatusChanged { .. } => "meeting.status",
            MiaEvent::JobDeadLettered { .. } => "job.dead_lettered",
            MiaEvent::ConnectorSessionChanged { .. } => "connector.session",
            MiaEvent::BreakerStateChanged { .. } => "breaker.state",
        }
    }

    /// Meeting this event belongs to, if any.
    pub fn meeting_id(&self) -> Option<&str> {
        match self {
            MiaEvent::TranscriptUpdate { meeting_id, .. }
            | MiaEvent::ReportReady { meeting_id, .. }
            | MiaEvent::MeetingStatusChanged { meeting_id, .. }
            | MiaEvent::JobDeadLettered { meeting_id, .. }
            | MiaEvent::ConnectorSessionChanged { meeting_id, .. } => Some(meeting_id),
            MiaEvent::BreakerStateChanged { .. } => None,
        }
    }
}

/// Central event distribution bus.
///
/// Backed by `tokio::broadcast`: non-blocking publish, multiple concurrent
/// subscribers, automatic cleanup when subscribers drop.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MiaEvent>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<MiaEvent> {
        self.tx.subscribe()
    }

    /// Emit an event, ignoring whether anyone is listening.
    pub fn emit_lossy(&self, event: MiaEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> MiaEvent {
        MiaEvent::TranscriptUpdate {
            meeting_id: "m-1".to_string(),
            seq_high: 3,
            speaker: Some("spk1".to_string()),
            text: "hello".to_string(),
            quality: Some(1.0),
            timestamp: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_event_serialization_carries_type_tag() {
        let json = serde_json::to_string(&sample_event()).unwrap();
        assert!(json.contains("\"type\":\"transcript.update\""));
        assert!(json.contains("\"seq_high\":3"));

        let back: MiaEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.event_type(), "transcript.update");
        assert_eq!(back.meeting_id(), Some("m-1"));
    }

    #[test]
    fn test_eventbus_delivers_to_subscribers() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.emit_lossy(sample_event());

        assert_eq!(rx1.try_recv().unwrap().event_type(), "transcript.update");
        assert_eq!(rx2.try_recv().unwrap().event_type(), "transcript.update");
    }

    #[test]
    fn test_emit_lossy_without_subscribers_is_fine() {
        let bus = EventBus::new(2);
        bus.emit_lossy(sample_event());
        assert_eq!(bus.capacity(), 2);
    }
}
