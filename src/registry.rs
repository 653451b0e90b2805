//! The provided-service registry: lets the client answer inbound
//! `REQUEST` frames for services it hosts, and push broadcasts to every
//! current subscriber of a named provided-service subscription.

use std::{collections::HashMap, sync::Arc};

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::codec::{self, Body, Frame, Verb};

/// Identity of the connected Core, handed to every provided-service
/// handler so it can scope behavior (e.g. pairing) to the calling Core.
#[derive(Debug, Clone)]
pub struct CoreIdentity {
    pub id: String,
    pub name: String,
}

/// What a provided-service method handler or subscription lifecycle hook
/// returns: the verb/name/body to send back, and an optional broadcast
/// to fan out afterward.
pub struct Response {
    pub verb: Verb,
    pub name: String,
    pub body: Option<Value>,
    pub broadcast: Option<String>,
}

impl Response {
    pub fn success(body: Option<Value>) -> Self {
        Self { verb: Verb::Complete, name: "Success".to_string(), body, broadcast: None }
    }

    pub fn changed(body: Option<Value>) -> Self {
        Self { verb: Verb::Continue, name: "Changed".to_string(), body, broadcast: None }
    }

    pub fn subscribed(body: Option<Value>) -> Self {
        Self { verb: Verb::Continue, name: "Subscribed".to_string(), body, broadcast: None }
    }

    pub fn with_broadcast(mut self, subscription_name: impl Into<String>) -> Self {
        self.broadcast = Some(subscription_name.into());
        self
    }
}

pub type MethodHandler = Arc<dyn Fn(&CoreIdentity, Option<&Value>) -> Response + Send + Sync>;
pub type SubscriptionStartHandler = Arc<dyn Fn(&CoreIdentity, Option<&Value>) -> Response + Send + Sync>;
pub type SubscriptionEndHandler = Arc<dyn Fn(&CoreIdentity, Option<&Value>) -> Response + Send + Sync>;

#[derive(Clone)]
pub struct SubscriptionHooks {
    pub start: SubscriptionStartHandler,
    pub end: Option<SubscriptionEndHandler>,
}

/// A service this client hosts for the Core to call.
#[derive(Clone)]
pub struct ProvidedService {
    pub name: String,
    pub methods: HashMap<String, MethodHandler>,
    pub subscriptions: HashMap<String, SubscriptionHooks>,
}

impl ProvidedService {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), methods: HashMap::new(), subscriptions: HashMap::new() }
    }

    pub fn with_method(mut self, name: impl Into<String>, handler: MethodHandler) -> Self {
        self.methods.insert(name.into(), handler);
        self
    }

    pub fn with_subscription(
        mut self,
        topic: impl Into<String>,
        start: SubscriptionStartHandler,
        end: Option<SubscriptionEndHandler>,
    ) -> Self {
        self.subscriptions.insert(topic.into(), SubscriptionHooks { start, end });
        self
    }
}

struct ProvidedSubscriptionEntry {
    topic: String,
    request_id: u64,
}

/// Registry of hosted services plus the Core-supplied subscription keys
/// currently active against them.
pub struct ServiceRegistry {
    services: Mutex<HashMap<String, Arc<ProvidedService>>>,
    subscriptions: Mutex<HashMap<u64, ProvidedSubscriptionEntry>>,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self { services: Mutex::new(HashMap::new()), subscriptions: Mutex::new(HashMap::new()) }
    }

    /// Register (or replace, idempotently) a provided service by name.
    pub async fn register(&self, service: ProvidedService) {
        self.services.lock().await.insert(service.name.clone(), Arc::new(service));
    }

    pub async fn lookup(&self, name: &str) -> Option<Arc<ProvidedService>> {
        self.services.lock().await.get(name).cloned()
    }

    /// Names of every currently-registered service, advertised to the Core
    /// as the `provided_services` list during registration.
    pub async fn service_names(&self) -> Vec<String> {
        self.services.lock().await.keys().cloned().collect()
    }

    /// Dispatch an inbound `REQUEST` frame. Returns every encoded frame to
    /// send back: the direct response first, followed by any broadcast
    /// frames the handler's response triggered.
    pub async fn dispatch(&self, frame: &Frame, core: &CoreIdentity) -> Option<Vec<Vec<u8>>> {
        let request_id = frame.request_id?;
        let Some((service_name, method_name)) = frame.name.rsplit_once('/') else {
            warn!(uri = %frame.name, "dropping inbound request with no service/method split");
            return None
        };

        let service = match self.lookup(service_name).await {
            Some(s) => s,
            None => {
                warn!(service = service_name, "dropping inbound request for unknown service");
                return None
            }
        };

        let body = frame.body.as_json();

        if let Some(handler) = service.methods.get(method_name) {
            let response = handler(core, body);
            return Some(self.finish(request_id, response).await)
        }

        if let Some(hooks) = service.subscriptions.get(method_name) {
            if let Some(subscription_key) = body.and_then(|b| b.get("subscription_key")).and_then(|v| v.as_u64())
            {
                self.subscriptions.lock().await.insert(
                    subscription_key,
                    ProvidedSubscriptionEntry { topic: method_name.to_string(), request_id },
                );
            } else {
                warn!(method = method_name, "subscription start missing subscription_key");
            }
            let response = (hooks.start)(core, body);
            return Some(self.finish(request_id, response).await)
        }

        if let Some(topic) = method_name.strip_prefix("unsubscribe_") {
            let start_method = format!("subscribe_{topic}");
            if service.subscriptions.contains_key(&start_method) {
                if let Some(subscription_key) =
                    body.and_then(|b| b.get("subscription_key")).and_then(|v| v.as_u64())
                {
                    self.subscriptions.lock().await.remove(&subscription_key);
                }
                if let Some(end) = service.subscriptions.get(&start_method).and_then(|h| h.end.clone()) {
                    let response = end(core, body);
                    return Some(self.finish(request_id, response).await)
                }
                return Some(vec![codec::encode_response(Verb::Complete, "Success", request_id, None)])
            }
        }

        debug!(service = service_name, method = method_name, "no handler matched inbound request");
        None
    }

    /// Encode the direct response, then fold in any broadcast this
    /// response triggered so the caller can send every frame in order.
    async fn finish(&self, request_id: u64, response: Response) -> Vec<Vec<u8>> {
        let bytes = codec::encode_response(response.verb, &response.name, request_id, response.body.as_ref());
        let mut frames = vec![bytes];
        if let Some(subscription_name) = response.broadcast {
            frames.extend(self.broadcast_internal(&subscription_name, response.body).await);
        }
        frames
    }

    /// Push `body` as a `CONTINUE Changed` to every active subscriber of
    /// `subscription_name`, using each subscriber's own `request_id` as
    /// the correlator.
    pub async fn broadcast(&self, subscription_name: &str, body: Option<Value>) -> Vec<Vec<u8>> {
        self.broadcast_internal(subscription_name, body).await
    }

    async fn broadcast_internal(&self, subscription_name: &str, body: Option<Value>) -> Vec<Vec<u8>> {
        let subs = self.subscriptions.lock().await;
        subs.values()
            .filter(|entry| entry.topic == subscription_name)
            .map(|entry| codec::encode_response(Verb::Continue, "Changed", entry.request_id, body.as_ref()))
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn core() -> CoreIdentity {
        CoreIdentity { id: "core-1".to_string(), name: "Test Core".to_string() }
    }

    fn frame(name: &str, request_id: u64, body: Option<Value>) -> Frame {
        Frame {
            verb: Verb::Request,
            name: name.to_string(),
            request_id: Some(request_id),
            headers: Default::default(),
            body: body.map(Body::Json).unwrap_or(Body::None),
        }
    }

    #[tokio::test]
    async fn dispatches_to_registered_method() {
        let registry = ServiceRegistry::new();
        let service = ProvidedService::new("com.roonlabs.ping:1")
            .with_method("ping", Arc::new(|_core, _body| Response::success(None)));
        registry.register(service).await;

        let frames = registry.dispatch(&frame("com.roonlabs.ping:1/ping", 3, None), &core()).await.unwrap();
        assert_eq!(frames.len(), 1);
        let response = codec::parse(&frames[0]).unwrap();
        assert_eq!(response.verb, Verb::Complete);
        assert_eq!(response.name, "Success");
        assert_eq!(response.request_id, Some(3));
    }

    #[tokio::test]
    async fn unknown_service_is_dropped_silently() {
        let registry = ServiceRegistry::new();
        assert!(registry.dispatch(&frame("com.roonlabs.missing:1/ping", 1, None), &core()).await.is_none());
    }

    #[tokio::test]
    async fn subscription_start_then_unsubscribe_round_trip() {
        let registry = ServiceRegistry::new();
        let service = ProvidedService::new("com.example:1").with_subscription(
            "subscribe_things",
            Arc::new(|_core, _body| Response::subscribed(Some(json!({"things": []})))),
            None,
        );
        registry.register(service).await;

        let start = frame("com.example:1/subscribe_things", 5, Some(json!({"subscription_key": 42})));
        let frames = registry.dispatch(&start, &core()).await.unwrap();
        let response = codec::parse(&frames[0]).unwrap();
        assert_eq!(response.name, "Subscribed");

        let broadcasts = registry.broadcast("subscribe_things", Some(json!({"things": ["a"]}))).await;
        assert_eq!(broadcasts.len(), 1);
        let broadcast = codec::parse(&broadcasts[0]).unwrap();
        assert_eq!(broadcast.verb, Verb::Continue);
        assert_eq!(broadcast.name, "Changed");
        assert_eq!(broadcast.request_id, Some(5));

        let end = frame("com.example:1/unsubscribe_things", 6, Some(json!({"subscription_key": 42})));
        let frames = registry.dispatch(&end, &core()).await.unwrap();
        let response = codec::parse(&frames[0]).unwrap();
        assert_eq!(response.name, "Success");

        assert!(registry.broadcast("subscribe_things", None).await.is_empty());
    }
}
