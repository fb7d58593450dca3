//! Detection events, the rolling event log, and subscriber fan-out.
//!
//! Events are immutable once created. The log keeps the last hour for
//! catch-up on new subscriptions; the broadcaster delivers the live tail and
//! never blocks the detection path on a slow subscriber.

use std::collections::VecDeque;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Local};
use serde::{Deserialize, Serialize};

/// How long the rolling log keeps an event.
pub const EVENT_RETENTION_SECS: i64 = 3600;

/// Queued events per subscriber; past this, the subscriber misses events.
const SUBSCRIBER_QUEUE_DEPTH: usize = 64;

/// One observed PPE violation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DetectionEvent {
    pub source_id: String,
    pub timestamp: DateTime<Local>,
    pub violation_type: String,
    pub confidence: f32,
    pub event_id: String,
    pub frame_number: u64,
}

impl DetectionEvent {
    pub fn new(source_id: &str, violation_type: &str, confidence: f32, frame_number: u64) -> Self {
        Self::at(
            Local::now(),
            source_id,
            violation_type,
            confidence,
            frame_number,
        )
    }

    pub fn at(
        timestamp: DateTime<Local>,
        source_id: &str,
        violation_type: &str,
        confidence: f32,
        frame_number: u64,
    ) -> Self {
        let event_id = format!(
            "{}_{}_{}",
            violation_type,
            timestamp.format("%Y%m%d_%H%M%S"),
            frame_number
        );
        Self {
            source_id: source_id.to_string(),
            timestamp,
            violation_type: violation_type.to_string(),
            confidence,
            event_id,
            frame_number,
        }
    }
}

/// Rolling log of the last hour of events, oldest first.
pub struct EventLog {
    events: Mutex<VecDeque<DetectionEvent>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
        }
    }

    // Appends and prunes cannot panic mid-update, so a poisoned lock still
    // guards a consistent queue.
    fn locked(&self) -> MutexGuard<'_, VecDeque<DetectionEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn append(&self, event: DetectionEvent) {
        let mut events = self.locked();
        events.push_back(event);
        Self::prune(&mut events, Local::now());
    }

    /// Events still within the retention window, oldest first. Pruning
    /// happens here too, so the snapshot never contains expired events even
    /// when nothing has been appended for a while.
    pub fn snapshot(&self) -> Vec<DetectionEvent> {
        let mut events = self.locked();
        Self::prune(&mut events, Local::now());
        events.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.locked().len()
    }

    pub fn is_empty(&self) -> bool {
        self.locked().is_empty()
    }

    fn prune(events: &mut VecDeque<DetectionEvent>, now: DateTime<Local>) {
        let cutoff = now - Duration::seconds(EVENT_RETENTION_SECS);
        while events.front().is_some_and(|e| e.timestamp < cutoff) {
            events.pop_front();
        }
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Fan-out of live detection events to SSE subscribers.
///
/// `publish` never blocks: a subscriber whose queue is full misses that
/// event (it still has the rolling log for catch-up), and a subscriber
/// whose receiver is gone is dropped from the list.
pub struct EventBroadcaster {
    subscribers: Mutex<Vec<SyncSender<DetectionEvent>>>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    fn locked(&self) -> MutexGuard<'_, Vec<SyncSender<DetectionEvent>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> Receiver<DetectionEvent> {
        let (tx, rx) = sync_channel(SUBSCRIBER_QUEUE_DEPTH);
        self.locked().push(tx);
        rx
    }

    pub fn publish(&self, event: &DetectionEvent) {
        self.locked().retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                log::debug!("slow event subscriber missed {}", event.event_id);
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.locked().len()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_at(timestamp: DateTime<Local>, frame: u64) -> DetectionEvent {
        DetectionEvent::at(timestamp, "src-1", "NO-Hardhat", 0.9, frame)
    }

    #[test]
    fn event_id_embeds_class_time_and_frame() {
        let timestamp = Local::now();
        let event = DetectionEvent::at(timestamp, "src-1", "NO-Mask", 0.91, 42);
        let expected = format!("NO-Mask_{}_42", timestamp.format("%Y%m%d_%H%M%S"));
        assert_eq!(event.event_id, expected);
        assert_eq!(event.confidence, 0.91);
    }

    #[test]
    fn snapshot_drops_events_older_than_retention() {
        let log = EventLog::new();
        let now = Local::now();
        log.append(event_at(now - Duration::seconds(EVENT_RETENTION_SECS + 5), 1));
        log.append(event_at(now - Duration::seconds(30), 2));
        log.append(event_at(now, 3));

        let snapshot = log.snapshot();
        let frames: Vec<u64> = snapshot.iter().map(|e| e.frame_number).collect();
        assert_eq!(frames, vec![2, 3]);
    }

    #[test]
    fn snapshot_is_oldest_first() {
        let log = EventLog::new();
        let now = Local::now();
        for frame in 0..5 {
            log.append(event_at(now - Duration::seconds(50 - frame as i64), frame));
        }
        let frames: Vec<u64> = log.snapshot().iter().map(|e| e.frame_number).collect();
        assert_eq!(frames, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn publish_without_subscribers_is_a_no_op() {
        let broadcaster = EventBroadcaster::new();
        broadcaster.publish(&event_at(Local::now(), 1));
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[test]
    fn subscribers_receive_events_in_order() {
        let broadcaster = EventBroadcaster::new();
        let rx = broadcaster.subscribe();

        for frame in 0..3 {
            broadcaster.publish(&event_at(Local::now(), frame));
        }

        let frames: Vec<u64> = (0..3).map(|_| rx.recv().unwrap().frame_number).collect();
        assert_eq!(frames, vec![0, 1, 2]);
    }

    #[test]
    fn disconnected_subscribers_are_pruned() {
        let broadcaster = EventBroadcaster::new();
        let rx = broadcaster.subscribe();
        assert_eq!(broadcaster.subscriber_count(), 1);

        drop(rx);
        broadcaster.publish(&event_at(Local::now(), 1));
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[test]
    fn full_subscriber_queue_misses_events_but_stays_subscribed() {
        let broadcaster = EventBroadcaster::new();
        let rx = broadcaster.subscribe();

        for frame in 0..(SUBSCRIBER_QUEUE_DEPTH as u64 + 8) {
            broadcaster.publish(&event_at(Local::now(), frame));
        }
        assert_eq!(broadcaster.subscriber_count(), 1);

        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, SUBSCRIBER_QUEUE_DEPTH);
    }
}
