//! `InspectionEvent` + `EventBus` (spec §3, §9 "Event bus backpressure").
//!
//! The ring keeps the N most recent events with overwrite-oldest semantics;
//! subscribers are replayed that history on attach and then stream live
//! events via a broadcast channel. Subscriptions are weak: dropping a
//! receiver only decrements the broadcast channel's listener count, it never
//! keeps anything else alive.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    Request,
    Response,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct InspectionEvent {
    pub id: u64,
    pub ts_unix_ms: u64,
    pub direction: Direction,
    pub method: Option<String>,
    pub url: Option<String>,
    pub status: Option<u16>,
    pub headers: Vec<(String, String)>,
    pub body_preview: Vec<u8>,
    pub truncated: bool,
    pub fingerprint: String,
}

impl InspectionEvent {
    /// Builds an event with `id` left at 0; `EventBus::publish` assigns the
    /// real, monotonically increasing id.
    pub fn new(direction: Direction, fingerprint: impl Into<String>) -> Self {
        Self {
            id: 0,
            ts_unix_ms: now_unix_ms(),
            direction,
            method: None,
            url: None,
            status: None,
            headers: Vec::new(),
            body_preview: Vec::new(),
            truncated: false,
            fingerprint: fingerprint.into(),
        }
    }
}

fn now_unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub struct EventBus {
    ring: Mutex<VecDeque<InspectionEvent>>,
    capacity: usize,
    sender: broadcast::Sender<InspectionEvent>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity.max(16));
        Self {
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            sender,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn publish(&self, mut event: InspectionEvent) {
        event.id = self.next_id.fetch_add(1, Ordering::SeqCst);
        {
            let mut ring = self.ring.lock().expect("event ring lock poisoned");
            if ring.len() == self.capacity {
                ring.pop_front();
            }
            ring.push_back(event.clone());
        }
        // A send error only means there are no live subscribers; that is
        // not a failure for the publisher.
        let _ = self.sender.send(event);
    }

    pub fn recent(&self) -> Vec<InspectionEvent> {
        self.ring.lock().expect("event ring lock poisoned").iter().cloned().collect()
    }

    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            replay: self.recent(),
            replay_pos: 0,
            receiver: self.sender.subscribe(),
        }
    }
}

pub struct EventSubscription {
    replay: Vec<InspectionEvent>,
    replay_pos: usize,
    receiver: broadcast::Receiver<InspectionEvent>,
}

impl EventSubscription {
    /// Yields replayed history first, then live events. Returns `None` once
    /// the bus itself is dropped.
    pub async fn recv(&mut self) -> Option<InspectionEvent> {
        if self.replay_pos < self.replay.len() {
            let event = self.replay[self.replay_pos].clone();
            self.replay_pos += 1;
            return Some(event);
        }
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn late_subscriber_replays_history_then_sees_live_events() {
        let bus = EventBus::new(4);
        bus.publish(InspectionEvent::new(Direction::Request, "fp1"));
        bus.publish(InspectionEvent::new(Direction::Response, "fp1"));

        let mut sub = bus.subscribe();
        let first = sub.recv().await.unwrap();
        assert_eq!(first.direction, Direction::Request);
        let second = sub.recv().await.unwrap();
        assert_eq!(second.direction, Direction::Response);

        bus.publish(InspectionEvent::new(Direction::Error, "fp2"));
        let third = sub.recv().await.unwrap();
        assert_eq!(third.fingerprint, "fp2");
    }

    #[tokio::test]
    async fn ring_overwrites_oldest_beyond_capacity() {
        let bus = EventBus::new(2);
        for i in 0..5 {
            bus.publish(InspectionEvent::new(Direction::Request, format!("fp{i}")));
        }
        let recent = bus.recent();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].fingerprint, "fp3");
        assert_eq!(recent[1].fingerprint, "fp4");
    }

    #[tokio::test]
    async fn dropping_a_subscriber_does_not_affect_publisher() {
        let bus = EventBus::new(4);
        {
            let _sub = bus.subscribe();
        }
        bus.publish(InspectionEvent::new(Direction::Request, "fp"));
        assert_eq!(bus.recent().len(), 1);
    }
}
