//! Replayable server-sent event streams.
//!
//! Agent credential status (and other low-rate notifications) flow over SSE
//! with monotonically increasing ids. Events land in a bounded ring; a
//! reconnecting client sends `Last-Event-ID` and receives everything it
//! missed that is still in the ring before going live.

use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::broadcast;

/// Events retained for replay.
const RING_CAPACITY: usize = 256;

/// Capacity of the live fan-out channel.
const LIVE_BUFFER: usize = 64;

/// A numbered event.
#[derive(Debug, Clone)]
pub struct RingEvent {
    pub id: u64,
    pub data: Value,
}

/// A bounded, replayable event ring.
pub struct EventRing {
    inner: Mutex<RingState>,
    live_tx: broadcast::Sender<RingEvent>,
}

struct RingState {
    next_id: u64,
    buffer: VecDeque<RingEvent>,
}

impl EventRing {
    pub fn new() -> Self {
        let (live_tx, _) = broadcast::channel(LIVE_BUFFER);
        Self {
            inner: Mutex::new(RingState {
                next_id: 1,
                buffer: VecDeque::with_capacity(RING_CAPACITY),
            }),
            live_tx,
        }
    }

    /// Publish an event, returning its assigned id.
    pub fn publish(&self, data: Value) -> u64 {
        let event = {
            let mut state = self.inner.lock().expect("event ring mutex poisoned");
            let event = RingEvent {
                id: state.next_id,
                data,
            };
            state.next_id += 1;
            if state.buffer.len() >= RING_CAPACITY {
                state.buffer.pop_front();
            }
            state.buffer.push_back(event.clone());
            event
        };
        let id = event.id;
        let _ = self.live_tx.send(event);
        id
    }

    /// Replay events after `last_event_id` plus a live receiver for the rest.
    ///
    /// Events older than the ring window are gone; the replay simply starts
    /// at the oldest retained id.
    pub fn subscribe(&self, last_event_id: Option<u64>) -> (Vec<RingEvent>, broadcast::Receiver<RingEvent>) {
        let receiver = self.live_tx.subscribe();
        let state = self.inner.lock().expect("event ring mutex poisoned");
        let missed = match last_event_id {
            Some(last) => state
                .buffer
                .iter()
                .filter(|event| event.id > last)
                .cloned()
                .collect(),
            None => Vec::new(),
        };
        (missed, receiver)
    }
}

impl Default for EventRing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ids_are_dense_and_monotonic() {
        let ring = EventRing::new();
        assert_eq!(ring.publish(json!({"n": 1})), 1);
        assert_eq!(ring.publish(json!({"n": 2})), 2);
        assert_eq!(ring.publish(json!({"n": 3})), 3);
    }

    #[test]
    fn replay_resumes_after_last_event_id() {
        let ring = EventRing::new();
        for n in 1..=5 {
            ring.publish(json!({"n": n}));
        }
        let (missed, _live) = ring.subscribe(Some(3));
        let ids: Vec<u64> = missed.iter().map(|event| event.id).collect();
        assert_eq!(ids, vec![4, 5]);
    }

    #[test]
    fn fresh_subscriber_gets_no_replay() {
        let ring = EventRing::new();
        ring.publish(json!({}));
        let (missed, _live) = ring.subscribe(None);
        assert!(missed.is_empty());
    }

    #[test]
    fn ring_evicts_beyond_capacity() {
        let ring = EventRing::new();
        for n in 0..(RING_CAPACITY as u64 + 10) {
            ring.publish(json!({"n": n}));
        }
        let (missed, _live) = ring.subscribe(Some(0));
        assert_eq!(missed.len(), RING_CAPACITY);
        assert_eq!(missed.first().unwrap().id, 11);
    }
}
