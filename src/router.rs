//! Owns the pending-request table, the consumed-subscription table, and
//! the dispatch logic from decoded `CONTINUE`/`COMPLETE` frames to their
//! completion sinks or the events sink.
//!
//! Dispatch of inbound `REQUEST` frames (the Core calling *us*) is not
//! this module's concern — the connection supervisor routes those
//! straight to the [`crate::registry::ServiceRegistry`], since that keeps
//! the consumed and provided sides decoupled.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use futures_channel::oneshot;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::{
    codec::{self, Body, Frame, Verb},
    errors::RequestError,
    events::{Event, EventKind, EventSink},
};

/// Request ids below this value are reserved for server-initiated ids.
const FIRST_REQUEST_ID: u64 = 10;

pub type RequestResult = Result<Value, RequestError>;

struct SubscriptionEntry {
    topic: String,
    request_id: u64,
}

struct PendingEntry {
    sender: oneshot::Sender<RequestResult>,
    installed_at: Instant,
}

/// Request-id allocation, the pending-request table, the subscription
/// table, and completion/event dispatch for one connection's lifetime.
pub struct Router {
    next_request_id: AtomicU64,
    next_subscription_key: AtomicU64,
    pending: Mutex<HashMap<u64, PendingEntry>>,
    subscriptions: Mutex<HashMap<u64, SubscriptionEntry>>,
    events: Arc<EventSink>,
}

impl Router {
    pub fn new(events: Arc<EventSink>) -> Self {
        Self {
            next_request_id: AtomicU64::new(FIRST_REQUEST_ID),
            next_subscription_key: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn alloc_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    fn alloc_subscription_key(&self) -> u64 {
        self.next_subscription_key.fetch_add(1, Ordering::Relaxed)
    }

    /// Allocate a request id, install a completion sink, and encode the
    /// outbound frame. The caller is responsible for actually sending the
    /// returned bytes; the pending entry exists from this call onward
    /// regardless of whether the send succeeds, matching the spec's
    /// "timeout does not itself remove the entry" contract (a send failure
    /// is surfaced via the transport's own error event, which drives
    /// `fail_pending`).
    pub async fn build_request(
        &self,
        path: &str,
        body: Option<Value>,
    ) -> (Vec<u8>, oneshot::Receiver<RequestResult>) {
        let id = self.alloc_request_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, PendingEntry { sender: tx, installed_at: Instant::now() });
        let bytes = codec::encode_request(id, path, body.as_ref());
        (bytes, rx)
    }

    /// Build a `subscribe_<topic>` request and register the subscription
    /// entry before returning, so that a `CONTINUE` racing the caller back
    /// is never missed.
    pub async fn build_subscribe(&self, service: &str, topic: &str, extra: Option<Value>) -> Vec<u8> {
        let request_id = self.alloc_request_id();
        let subscription_key = self.alloc_subscription_key();

        self.subscriptions
            .lock()
            .await
            .insert(subscription_key, SubscriptionEntry { topic: topic.to_string(), request_id });

        let mut body = serde_json::json!({ "subscription_key": subscription_key });
        if let (Some(extra), Some(obj)) = (extra, body.as_object_mut()) {
            if let Some(extra_obj) = extra.as_object() {
                for (k, v) in extra_obj {
                    obj.insert(k.clone(), v.clone());
                }
            }
        }

        codec::encode_request(request_id, &format!("{service}/subscribe_{topic}"), Some(&body))
    }

    /// Handle a decoded `CONTINUE` or `COMPLETE` frame from the Core.
    pub async fn handle_frame(&self, frame: Frame) {
        let Some(request_id) = frame.request_id else {
            warn!(name = %frame.name, "dropping frame with no Request-Id");
            return
        };

        match frame.verb {
            Verb::Complete => self.complete(request_id, &frame.name, frame.body).await,
            Verb::Continue => {
                if frame.name == "Registered" {
                    self.deliver_without_removing(request_id, frame.body.clone()).await;
                }
                self.dispatch_subscription_event(request_id, &frame.name, &frame.body).await;
            }
            Verb::Request => {
                // handled by the connection supervisor via the service registry
            }
        }
    }

    async fn complete(&self, request_id: u64, name: &str, body: Body) {
        let Some(entry) = self.pending.lock().await.remove(&request_id) else {
            trace!(request_id, "completion for unknown/already-resolved request");
            return
        };
        let result = if matches!(name, "Success" | "Registered") {
            Ok(body_to_value(body))
        } else {
            Err(RequestError::Failed { name: name.to_string(), body: body_as_opt_value(body) })
        };
        let _ = entry.sender.send(result);
    }

    async fn deliver_without_removing(&self, request_id: u64, body: Body) {
        // `Registered` arrives as CONTINUE during the handshake; the
        // pending entry is resolved but intentionally left in place only
        // if a later COMPLETE is still expected. In this protocol the
        // handshake's terminal frame IS the Registered CONTINUE, so we
        // resolve it here without requiring a follow-up COMPLETE.
        if let Some(entry) = self.pending.lock().await.remove(&request_id) {
            let _ = entry.sender.send(Ok(body_to_value(body)));
        }
    }

    async fn dispatch_subscription_event(&self, request_id: u64, name: &str, body: &Body) {
        let subs = self.subscriptions.lock().await;
        let value = body_to_value(body.clone());
        for entry in subs.values() {
            if entry.request_id != request_id {
                continue
            }
            if let Some(kind) = classify(&entry.topic, name, &value) {
                self.events.push(Event::new(kind, value.clone())).await;
            } else {
                debug!(topic = %entry.topic, "no event mapping for subscription topic");
            }
        }
    }

    /// Remove the subscription entry for `subscription_key`, if any.
    pub async fn end_subscription(&self, subscription_key: u64) {
        self.subscriptions.lock().await.remove(&subscription_key);
    }

    /// Fail every pending request with a disconnect error and clear the
    /// table. Called once per connection loss.
    pub async fn fail_pending(&self) {
        let mut pending = self.pending.lock().await;
        for (_, entry) in pending.drain() {
            let _ = entry.sender.send(Err(RequestError::Disconnected));
        }
    }

    /// Drop pending entries older than `max_age` without resolving them —
    /// a caller's completion sink simply goes away silently. Not called
    /// automatically (late responses are still deliverable per spec); a
    /// caller that wants to bound table growth under §9's guidance can
    /// invoke this periodically.
    pub async fn sweep_stale(&self, max_age: Duration) -> usize {
        let mut pending = self.pending.lock().await;
        let before = pending.len();
        pending.retain(|_, entry| entry.installed_at.elapsed() < max_age);
        before - pending.len()
    }

    #[cfg(test)]
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

fn body_as_opt_value(body: Body) -> Option<Value> {
    match body_to_value(body) {
        Value::Null => None,
        v => Some(v),
    }
}

fn body_to_value(body: Body) -> Value {
    match body {
        Body::Json(v) => v,
        Body::None => Value::Null,
        Body::Raw(_) => Value::Null,
    }
}

fn classify(topic: &str, name: &str, body: &Value) -> Option<EventKind> {
    match topic {
        "zones" => Some(if name == "Subscribed" {
            EventKind::ZonesSubscribed
        } else if has_key(body, "zones_changed") {
            EventKind::ZonesChanged
        } else if has_key(body, "zones_added") {
            EventKind::ZonesAdded
        } else if has_key(body, "zones_removed") {
            EventKind::ZonesRemoved
        } else if has_key(body, "zones_seek_changed") {
            EventKind::ZonesSeekChanged
        } else {
            EventKind::ZonesChanged
        }),
        "outputs" => Some(if name == "Subscribed" {
            EventKind::OutputsSubscribed
        } else if has_key(body, "outputs_changed") {
            EventKind::OutputsChanged
        } else if has_key(body, "outputs_added") {
            EventKind::OutputsAdded
        } else if has_key(body, "outputs_removed") {
            EventKind::OutputsRemoved
        } else {
            EventKind::OutputsChanged
        }),
        "queue" => Some(if name == "Subscribed" { EventKind::QueueSubscribed } else { EventKind::QueueChanged }),
        _ => None,
    }
}

fn has_key(body: &Value, key: &str) -> bool {
    body.as_object().is_some_and(|o| o.contains_key(key))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::codec::Verb;
    use serde_json::json;

    fn frame(verb: Verb, name: &str, request_id: Option<u64>, body: Body) -> Frame {
        Frame { verb, name: name.to_string(), request_id, headers: Default::default(), body }
    }

    #[tokio::test]
    async fn complete_success_resolves_pending_and_removes_entry() {
        let events = Arc::new(EventSink::new(8));
        let router = Router::new(events);
        let (_, rx) = router.build_request("com.roonlabs.ping:1/ping", None).await;
        let id = FIRST_REQUEST_ID;

        router.handle_frame(frame(Verb::Complete, "Success", Some(id), Body::Json(json!({"a":1})))).await;

        assert_eq!(router.pending_count().await, 0);
        assert_eq!(rx.await.unwrap().unwrap(), json!({"a":1}));
    }

    #[tokio::test]
    async fn complete_failure_delivers_typed_error() {
        let events = Arc::new(EventSink::new(8));
        let router = Router::new(events);
        let (_, rx) = router.build_request("com.roonlabs.ping:1/ping", None).await;
        let id = FIRST_REQUEST_ID;

        router.handle_frame(frame(Verb::Complete, "NotValid", Some(id), Body::None)).await;

        match rx.await.unwrap() {
            Err(RequestError::Failed { name, .. }) => assert_eq!(name, "NotValid"),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sweep_stale_drops_old_entries_without_resolving_them() {
        let events = Arc::new(EventSink::new(8));
        let router = Router::new(events);
        let (_, rx) = router.build_request("com.roonlabs.ping:1/ping", None).await;

        let removed = router.sweep_stale(Duration::from_millis(0)).await;
        assert_eq!(removed, 1);
        assert_eq!(router.pending_count().await, 0);
        assert!(rx.await.is_err(), "sweep should drop the sender, not resolve it");
    }

    #[tokio::test]
    async fn fail_pending_resolves_every_entry_exactly_once_and_empties_table() {
        let events = Arc::new(EventSink::new(8));
        let router = Router::new(events);
        let (_, rx1) = router.build_request("a", None).await;
        let (_, rx2) = router.build_request("b", None).await;

        router.fail_pending().await;

        assert!(matches!(rx1.await.unwrap(), Err(RequestError::Disconnected)));
        assert!(matches!(rx2.await.unwrap(), Err(RequestError::Disconnected)));
        assert_eq!(router.pending_count().await, 0);
    }

    #[tokio::test]
    async fn zones_subscription_emits_typed_events_in_order() {
        let events = Arc::new(EventSink::new(8));
        let router = Router::new(events.clone());
        let bytes = router.build_subscribe("com.roonlabs.transport:2", "zones", None).await;
        let sent = codec::parse(&bytes).unwrap();
        let request_id = sent.request_id.unwrap();

        router
            .handle_frame(frame(Verb::Continue, "Subscribed", Some(request_id), Body::Json(json!({"zones": []}))))
            .await;
        router
            .handle_frame(frame(
                Verb::Continue,
                "Changed",
                Some(request_id),
                Body::Json(json!({"zones_changed": []})),
            ))
            .await;

        let first = events.recv().await;
        let second = events.recv().await;
        assert_eq!(first.kind, EventKind::ZonesSubscribed);
        assert_eq!(second.kind, EventKind::ZonesChanged);
    }
}
