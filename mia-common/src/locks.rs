//! Per-meeting advisory locks.
//!
//! Serializes chunk sequence assignment and artifact writes for one meeting
//! within a process. Cross-process exclusivity is not needed here: sequence
//! assignment only happens in the gateway, artifact writes only in the
//! worker (or the gateway in inline mode, which then runs no worker).
//! Connector lifecycle operations use the TTL lock in `db::kv` instead.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Registry of per-meeting async mutexes.
#[derive(Clone, Default)]
pub struct MeetingLocks {
    inner: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl MeetingLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the advisory lock for a meeting, waiting if another task
    /// holds it. The guard releases on drop (transaction-end semantics).
    pub async fn lock(&self, meeting_id: &str) -> OwnedMutexGuard<()> {
        let entry = {
            let mut map = self.inner.lock().await;
            map.entry(meeting_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        entry.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_lock_serializes_same_meeting() {
        let locks = MeetingLocks::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let counter = counter.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock("m-1").await;
                let inside = counter.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(inside, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                counter.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1, "critical section overlapped");
    }

    #[tokio::test]
    async fn test_different_meetings_do_not_block() {
        let locks = MeetingLocks::new();
        let _a = locks.lock("m-1").await;
        // Must not deadlock
        let _b = locks.lock("m-2").await;
    }
}
