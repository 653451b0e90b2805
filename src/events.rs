//! The single bounded, drop-oldest events sink delivered to the user.

use std::collections::VecDeque;

use serde_json::Value;
use tokio::sync::{Mutex, Notify};

/// Tag identifying the kind of event on the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Registered,
    Reconnecting,
    Reconnected,
    Disconnected,
    ZonesSubscribed,
    ZonesChanged,
    ZonesAdded,
    ZonesRemoved,
    ZonesSeekChanged,
    OutputsSubscribed,
    OutputsChanged,
    OutputsAdded,
    OutputsRemoved,
    QueueSubscribed,
    QueueChanged,
    CoreFound,
    CoreLost,
    CorePaired,
    PairingChanged,
}

/// A single tagged value delivered on the events sink.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub data: Value,
}

impl Event {
    pub fn new(kind: EventKind, data: Value) -> Self {
        Self { kind, data }
    }
}

/// A bounded ring buffer with drop-oldest semantics: a slow consumer never
/// blocks the producer (the receive pump). Single consumer, multiple
/// producers (the receive pump and, e.g., `CoreFound`/`CoreLost` callers).
pub struct EventSink {
    inner: Mutex<VecDeque<Event>>,
    notify: Notify,
    capacity: usize,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        Self { inner: Mutex::new(VecDeque::with_capacity(capacity)), notify: Notify::new(), capacity }
    }

    /// Push an event. If the sink is at capacity, the oldest queued event
    /// is dropped to make room — this call never blocks.
    pub async fn push(&self, event: Event) {
        let mut guard = self.inner.lock().await;
        if guard.len() >= self.capacity {
            guard.pop_front();
        }
        guard.push_back(event);
        drop(guard);
        self.notify.notify_one();
    }

    /// Await the next event in arrival order.
    pub async fn recv(&self) -> Event {
        loop {
            {
                let mut guard = self.inner.lock().await;
                if let Some(event) = guard.pop_front() {
                    return event
                }
            }
            self.notify.notified().await;
        }
    }
}
