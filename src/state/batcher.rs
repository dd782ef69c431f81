//! Debounce/coalesce buffer sitting between the hub session's
//! `StateChanged` events and the cloud outbound channel.
//!
//! A flush timer arms itself the moment an event lands on an empty
//! buffer, rather than ticking on a free-running cadence, so a burst of
//! events that starts mid-cycle still coalesces into exactly one
//! `state_batch` instead of splitting across two depending on where a
//! periodic ticker happens to be in its cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::debug;
use uuid::Uuid;

use crate::protocol::{BridgeToCloud, StateBatchFrame, StateChangeEvent};

const FLUSH_WINDOW: Duration = Duration::from_millis(500);

/// Buffers incoming state-change events and flushes them as one
/// `state_batch` frame 500ms after the first event in a burst arrives.
/// While the cloud session is not authenticated, ingested events are
/// discarded at flush time rather than accumulating without bound.
pub struct StateBatcher {
    buffer: Mutex<Vec<StateChangeEvent>>,
    last_event_at: Mutex<Option<DateTime<Utc>>>,
    authenticated: AtomicBool,
    timer_armed: AtomicBool,
    flush_due: Notify,
    outbox: mpsc::UnboundedSender<BridgeToCloud>,
}

impl StateBatcher {
    pub fn new(outbox: mpsc::UnboundedSender<BridgeToCloud>) -> Arc<Self> {
        Arc::new(Self {
            buffer: Mutex::new(Vec::new()),
            last_event_at: Mutex::new(None),
            authenticated: AtomicBool::new(false),
            timer_armed: AtomicBool::new(false),
            flush_due: Notify::new(),
            outbox,
        })
    }

    /// Reflects the cloud session's authentication state. Flushes while
    /// unauthenticated discard the buffer instead of sending.
    pub fn set_authenticated(&self, authenticated: bool) {
        self.authenticated.store(authenticated, Ordering::SeqCst);
    }

    /// Non-blocking ingest: append to the buffer, record the event's
    /// timestamp for heartbeat reporting, and arm the flush timer if this
    /// is the first event since the last flush.
    pub async fn ingest(&self, event: StateChangeEvent) {
        *self.last_event_at.lock().await = Some(event.timestamp);
        self.buffer.lock().await.push(event);

        if self.timer_armed.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
            self.flush_due.notify_one();
        }
    }

    pub async fn last_event_at(&self) -> Option<DateTime<Utc>> {
        *self.last_event_at.lock().await
    }

    /// Waits for the flush timer to arm, sleeps out the remainder of the
    /// debounce window, then flushes and disarms. Returns only when the
    /// task is aborted by the orchestrator during shutdown.
    pub async fn run(self: Arc<Self>) {
        loop {
            self.flush_due.notified().await;
            tokio::time::sleep(FLUSH_WINDOW).await;
            self.timer_armed.store(false, Ordering::SeqCst);
            self.flush().await;
        }
    }

    /// Swaps the buffer out and either sends it as one batch or discards it,
    /// depending on authentication state. Safe to call directly for the
    /// final synchronous flush on shutdown.
    pub async fn flush(&self) {
        let events = {
            let mut buf = self.buffer.lock().await;
            if buf.is_empty() {
                return;
            }
            std::mem::take(&mut *buf)
        };

        if !self.authenticated.load(Ordering::SeqCst) {
            debug!(count = events.len(), "state batcher: discarding batch, cloud not authenticated");
            return;
        }

        let frame = BridgeToCloud::StateBatch(StateBatchFrame {
            batch_id: Uuid::new_v4().to_string(),
            is_overflow: false,
            events,
        });
        let _ = self.outbox.send(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event(entity_id: &str) -> StateChangeEvent {
        use crate::protocol::EntityState;
        let now = Utc::now();
        StateChangeEvent {
            entity_id: entity_id.to_string(),
            old_state: None,
            new_state: EntityState {
                state: "on".into(),
                attributes: serde_json::json!({}),
                last_changed: now,
                last_updated: now,
            },
            timestamp: now,
        }
    }

    #[tokio::test]
    async fn flush_discards_when_unauthenticated() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let batcher = StateBatcher::new(tx);
        batcher.ingest(sample_event("light.kitchen")).await;
        batcher.flush().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn flush_sends_one_batch_with_all_coalesced_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let batcher = StateBatcher::new(tx);
        batcher.set_authenticated(true);
        batcher.ingest(sample_event("light.kitchen")).await;
        batcher.ingest(sample_event("switch.fan")).await;
        batcher.flush().await;

        match rx.try_recv().unwrap() {
            BridgeToCloud::StateBatch(frame) => {
                assert_eq!(frame.events.len(), 2);
                assert!(!frame.is_overflow);
                assert!(!frame.batch_id.is_empty());
            }
            other => panic!("expected StateBatch, got {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn empty_buffer_flush_sends_nothing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let batcher = StateBatcher::new(tx);
        batcher.set_authenticated(true);
        batcher.flush().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn last_event_at_tracks_most_recent_ingest() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let batcher = StateBatcher::new(tx);
        assert!(batcher.last_event_at().await.is_none());
        let event = sample_event("light.kitchen");
        let ts = event.timestamp;
        batcher.ingest(event).await;
        assert_eq!(batcher.last_event_at().await, Some(ts));
    }
}
