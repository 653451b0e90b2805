//! The connection supervisor: owns the socket lifecycle, runs the
//! registration handshake, and drives auto-reconnect with exponential
//! backoff. This is the one piece callers actually construct.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use futures_channel::{mpsc, oneshot};
use futures_util::{select, FutureExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use tracing_futures::Instrument;

use crate::{
    codec::{self, Verb},
    errors::{Error, RegistrationError, RequestError, TransportError},
    events::{Event, EventKind, EventSink},
    registry::{CoreIdentity, ProvidedService, ServiceRegistry},
    router::Router,
    services,
    transport::{self, TransportEvent, TransportHandle},
};

const DEFAULT_PORT: u16 = 9330;
const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_BACKOFF_INITIAL_MS: u64 = 1_000;
const DEFAULT_BACKOFF_MAX_MS: u64 = 60_000;
const EVENTS_CAPACITY: usize = 32;
const REGISTER_URI: &str = "com.roonlabs.registry:1/register";

/// Identity this extension presents to the Core during registration.
#[derive(Debug, Clone)]
pub struct ExtensionInfo {
    pub extension_id: String,
    pub display_name: String,
    pub display_version: String,
    pub publisher: Option<String>,
    pub email: Option<String>,
}

impl ExtensionInfo {
    pub fn new(extension_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            extension_id: extension_id.into(),
            display_name: display_name.into(),
            display_version: crate::VERSION.to_string(),
            publisher: None,
            email: None,
        }
    }

    pub fn with_publisher(mut self, publisher: impl Into<String>) -> Self {
        self.publisher = Some(publisher.into());
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }
}

/// Immutable-at-connect-time configuration for a [`Connection`].
#[derive(Clone)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub extension: ExtensionInfo,
    pub token: Option<String>,
    pub timeout_ms: u64,
    pub auto_reconnect: bool,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub required_services: Vec<String>,
    pub optional_services: Vec<String>,
    pub provided_services: Vec<ProvidedService>,
    pub on_core_lost: Option<Arc<dyn Fn(&str) + Send + Sync>>,
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, extension: ExtensionInfo) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            extension,
            token: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            auto_reconnect: true,
            backoff_initial_ms: DEFAULT_BACKOFF_INITIAL_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            required_services: Vec::new(),
            optional_services: Vec::new(),
            provided_services: Vec::new(),
            on_core_lost: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_auto_reconnect(mut self, auto_reconnect: bool) -> Self {
        self.auto_reconnect = auto_reconnect;
        self
    }

    pub fn with_backoff(mut self, initial_ms: u64, max_ms: u64) -> Self {
        self.backoff_initial_ms = initial_ms;
        self.backoff_max_ms = max_ms;
        self
    }

    pub fn with_required_services(mut self, services: Vec<String>) -> Self {
        self.required_services = services;
        self
    }

    pub fn with_optional_services(mut self, services: Vec<String>) -> Self {
        self.optional_services = services;
        self
    }

    pub fn with_provided_services(mut self, services: Vec<ProvidedService>) -> Self {
        self.provided_services = services;
        self
    }

    pub fn with_on_core_lost(mut self, callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_core_lost = Some(Arc::new(callback));
        self
    }
}

/// Identity the Core reported back during registration.
#[derive(Debug, Clone, Default)]
pub struct CoreInfo {
    pub id: String,
    pub name: String,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Owns one connection's worth of mutable state: socket, pending/subscription
/// tables (via [`Router`]), provided-service registry, and the reconnect
/// supervisor. Constructed behind an `Arc` since the receive pump and
/// reconnect loop both need a long-lived handle back to it.
pub struct Connection {
    config: ConnectionConfig,
    router: Arc<Router>,
    registry: Arc<ServiceRegistry>,
    events: Arc<EventSink>,
    pairing: services::pairing::PairingState,
    status: Mutex<ConnectionStatus>,
    core_info: Mutex<Option<CoreInfo>>,
    token: Mutex<Option<String>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    disconnect_signal: Mutex<Option<oneshot::Sender<()>>>,
    explicitly_disconnected: AtomicBool,
    reconnecting: AtomicBool,
    services_registered: AtomicBool,
    initial_services: Mutex<Option<Vec<ProvidedService>>>,
}

impl Connection {
    pub fn new(config: ConnectionConfig) -> Arc<Self> {
        let events = Arc::new(EventSink::new(EVENTS_CAPACITY));
        let router = Arc::new(Router::new(events.clone()));
        let registry = Arc::new(ServiceRegistry::new());

        let events_for_pairing = events.clone();
        let on_core_lost = config.on_core_lost.clone();
        let pairing = services::pairing::PairingState::new(move |old_id| {
            if let Some(callback) = &on_core_lost {
                callback(old_id);
            }
            let events = events_for_pairing.clone();
            let old_id = old_id.to_string();
            tokio::spawn(async move {
                events.push(Event::new(EventKind::CoreLost, json!({ "core_id": old_id }))).await;
            });
        });

        let initial_services = config.provided_services.clone();
        let token = config.token.clone();

        Arc::new(Self {
            config,
            router,
            registry,
            events,
            pairing,
            status: Mutex::new(ConnectionStatus::Disconnected),
            core_info: Mutex::new(None),
            token: Mutex::new(token),
            outbound: Mutex::new(None),
            disconnect_signal: Mutex::new(None),
            explicitly_disconnected: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            services_registered: AtomicBool::new(false),
            initial_services: Mutex::new(Some(initial_services)),
        })
    }

    /// Stream of tagged lifecycle/subscription events. Cloning the sink
    /// handle is cheap (it is an `Arc`); only the first consumer to call
    /// `recv` on any given clone observes a given event.
    pub fn events(&self) -> Arc<EventSink> {
        self.events.clone()
    }

    pub async fn status(&self) -> ConnectionStatus {
        *self.status.lock().await
    }

    pub async fn connected(&self) -> bool {
        matches!(self.status().await, ConnectionStatus::Connected)
    }

    async fn set_status(&self, status: ConnectionStatus) {
        *self.status.lock().await = status;
    }

    /// Register the built-in `ping`/`pairing` services plus whatever the
    /// caller installed via `ConnectionConfig::with_provided_services`.
    /// Runs exactly once across this connection's lifetime, including
    /// across reconnects — the registry itself, unlike the socket, is not
    /// torn down on reconnect.
    async fn ensure_services_registered(&self) {
        if self.services_registered.swap(true, Ordering::SeqCst) {
            return
        }
        self.registry.register(services::ping::service()).await;
        self.registry.register(services::pairing::service(self.pairing.clone())).await;
        if let Some(initial) = self.initial_services.lock().await.take() {
            for service in initial {
                self.registry.register(service).await;
            }
        }
    }

    async fn current_core_identity(&self) -> CoreIdentity {
        match &*self.core_info.lock().await {
            Some(info) => CoreIdentity { id: info.id.clone(), name: info.name.clone() },
            None => CoreIdentity { id: String::new(), name: String::new() },
        }
    }

    async fn registration_body(&self) -> Value {
        let provided = self.registry.service_names().await;
        let token = self.token.lock().await.clone();
        json!({
            "extension_id": self.config.extension.extension_id,
            "display_name": self.config.extension.display_name,
            "display_version": self.config.extension.display_version,
            "publisher": self.config.extension.publisher,
            "email": self.config.extension.email,
            "required_services": self.config.required_services,
            "optional_services": self.config.optional_services,
            "provided_services": provided,
            "token": token,
        })
    }

    async fn send_bytes(&self, bytes: Vec<u8>) {
        let guard = self.outbound.lock().await;
        match guard.as_ref() {
            Some(outbound) if outbound.unbounded_send(bytes).is_ok() => {}
            _ => warn!("dropping outbound frame: no active connection"),
        }
    }

    /// Open the socket, run the registration handshake, and start the
    /// receive pump. Used both by the public `connect` entry point and by
    /// the reconnect loop, which is why it does not itself reset
    /// `explicitly_disconnected`.
    async fn do_connect(self: &Arc<Self>) -> Result<CoreInfo, Error> {
        self.set_status(ConnectionStatus::Connecting).await;
        self.ensure_services_registered().await;

        let handle = transport::connect(&self.config.host, self.config.port).await?;
        let outbound = handle.outbound.clone();
        *self.outbound.lock().await = Some(outbound.clone());

        let (disconnect_tx, disconnect_rx) = oneshot::channel();
        *self.disconnect_signal.lock().await = Some(disconnect_tx);

        let pump_conn = self.clone();
        let pump_span = tracing::info_span!("receive_pump", host = %self.config.host);
        tokio::spawn(async move { pump_conn.run_pump(handle, disconnect_rx).await }.instrument(pump_span));

        let body = self.registration_body().await;
        let (bytes, rx) = self.router.build_request(REGISTER_URI, Some(body)).await;
        outbound.unbounded_send(bytes).ok();

        match tokio::time::timeout(Duration::from_millis(self.config.timeout_ms), rx).await {
            Err(_elapsed) => Err(Error::Registration(RegistrationError::Timeout)),
            Ok(Err(_canceled)) => Err(Error::Registration(RegistrationError::Transport(TransportError::Closed {
                code: None,
                reason: Some("disconnected during registration".to_string()),
            }))),
            Ok(Ok(Err(RequestError::Failed { name, body }))) => {
                Err(Error::Registration(RegistrationError::Rejected { name, body }))
            }
            Ok(Ok(Err(RequestError::Disconnected))) => {
                Err(Error::Registration(RegistrationError::Transport(TransportError::Closed {
                    code: None,
                    reason: Some("disconnected during registration".to_string()),
                })))
            }
            Ok(Ok(Err(RequestError::Timeout))) => Err(Error::Registration(RegistrationError::Timeout)),
            Ok(Ok(Ok(value))) => {
                let core_info = core_info_from_body(&value);
                if let Some(token) = value.get("token").and_then(|v| v.as_str()) {
                    *self.token.lock().await = Some(token.to_string());
                }
                *self.core_info.lock().await = Some(core_info.clone());
                self.set_status(ConnectionStatus::Connected).await;
                info!(core_id = %core_info.id, "registered with core");
                self.events
                    .push(Event::new(
                        EventKind::Registered,
                        json!({
                            "core_id": core_info.id,
                            "display_name": core_info.name,
                            "display_version": core_info.version,
                        }),
                    ))
                    .await;
                Ok(core_info)
            }
        }
    }

    /// Drains the transport's event stream: parses inbound bytes, routes
    /// `CONTINUE`/`COMPLETE` to the router and `REQUEST` to the provided
    /// service registry, and reacts to close/error by tearing the
    /// connection down. Also watches for an explicit-disconnect signal.
    async fn run_pump(self: Arc<Self>, mut handle: TransportHandle, mut disconnect_rx: oneshot::Receiver<()>) {
        loop {
            select! {
                event = handle.events.next().fuse() => {
                    match event {
                        Some(TransportEvent::Message(bytes)) => self.handle_inbound(bytes).await,
                        Some(TransportEvent::Closed { code, reason }) => {
                            self.on_transport_closed(reason, code).await;
                            break
                        }
                        Some(TransportEvent::Error(e)) => {
                            error!(err = %e, "transport error");
                            self.on_transport_closed(Some(e.to_string()), None).await;
                            break
                        }
                        None => {
                            self.on_transport_closed(None, None).await;
                            break
                        }
                    }
                }
                _ = (&mut disconnect_rx).fuse() => {
                    handle.close();
                    break
                }
            }
        }
    }

    async fn handle_inbound(&self, bytes: Vec<u8>) {
        let Some(frame) = codec::parse(&bytes) else {
            debug!(len = bytes.len(), "dropped unparsable inbound frame");
            return
        };

        if frame.verb == Verb::Request {
            let core = self.current_core_identity().await;
            if let Some(frames) = self.registry.dispatch(&frame, &core).await {
                for out in frames {
                    self.send_bytes(out).await;
                }
            }
            return
        }

        self.router.handle_frame(frame).await;
    }

    async fn on_transport_closed(self: &Arc<Self>, reason: Option<String>, code: Option<u16>) {
        self.set_status(ConnectionStatus::Disconnected).await;
        self.router.fail_pending().await;
        *self.outbound.lock().await = None;

        let reason_text = reason.unwrap_or_else(|| "connection closed".to_string());
        warn!(reason = %reason_text, code = ?code, "transport closed");
        self.events.push(Event::new(EventKind::Disconnected, json!({ "reason": reason_text, "code": code }))).await;

        if self.explicitly_disconnected.load(Ordering::SeqCst) || !self.config.auto_reconnect {
            return
        }

        if self.reconnecting.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
            let conn = self.clone();
            let span = tracing::info_span!("reconnect_loop", host = %self.config.host);
            tokio::spawn(async move { conn.run_reconnect_loop().await }.instrument(span));
        }
    }

    async fn run_reconnect_loop(self: Arc<Self>) {
        let mut attempt: u32 = 1;
        loop {
            if self.explicitly_disconnected.load(Ordering::SeqCst) {
                break
            }

            let exponent = (attempt - 1).min(32);
            let backoff_ms = self.config.backoff_initial_ms.saturating_mul(1u64 << exponent).min(self.config.backoff_max_ms);
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;

            if self.explicitly_disconnected.load(Ordering::SeqCst) {
                break
            }

            self.events
                .push(Event::new(EventKind::Reconnecting, json!({ "attempt": attempt, "backoff_ms": backoff_ms })))
                .await;

            match self.do_connect().await {
                Ok(core_info) => {
                    info!(attempt, core_id = %core_info.id, "reconnected");
                    self.events
                        .push(Event::new(
                            EventKind::Reconnected,
                            json!({
                                "core_id": core_info.id,
                                "display_name": core_info.name,
                                "display_version": core_info.version,
                            }),
                        ))
                        .await;
                    break
                }
                Err(e) => {
                    warn!(attempt, err = %e, "reconnect attempt failed");
                    attempt += 1;
                }
            }
        }
        self.reconnecting.store(false, Ordering::SeqCst);
    }

    /// Open the connection and run the registration handshake.
    #[tracing::instrument(skip(self))]
    pub async fn connect(self: &Arc<Self>) -> Result<(), Error> {
        self.explicitly_disconnected.store(false, Ordering::SeqCst);
        self.do_connect().await.map(|_| ())
    }

    /// Explicitly tear the connection down. No further reconnect attempt
    /// will start until `connect` is called again.
    #[tracing::instrument(skip(self))]
    pub async fn disconnect(&self) {
        self.explicitly_disconnected.store(true, Ordering::SeqCst);
        self.set_status(ConnectionStatus::Disconnecting).await;

        if let Some(tx) = self.disconnect_signal.lock().await.take() {
            let _ = tx.send(());
        }
        *self.outbound.lock().await = None;

        self.set_status(ConnectionStatus::Disconnected).await;
        self.events
            .push(Event::new(EventKind::Disconnected, json!({ "reason": "Explicitly disconnected" })))
            .await;
    }

    /// Issue a request and await its completion, bounded by the configured
    /// request timeout. A caller-side timeout does not remove the pending
    /// entry; a late response is simply delivered to nobody.
    #[tracing::instrument(skip(self, body))]
    pub async fn request(&self, uri: &str, body: Option<Value>) -> Result<Value, Error> {
        let (bytes, rx) = self.router.build_request(uri, body).await;
        self.send_bytes(bytes).await;

        match tokio::time::timeout(Duration::from_millis(self.config.timeout_ms), rx).await {
            Err(_elapsed) => Err(Error::Request(RequestError::Timeout)),
            Ok(Err(_canceled)) => Err(Error::Request(RequestError::Disconnected)),
            Ok(Ok(Err(e))) => Err(Error::Request(e)),
            Ok(Ok(Ok(value))) => Ok(value),
        }
    }

    /// Fire-and-forget a subscribe request; results arrive on the events
    /// sink, not as this call's return value.
    pub async fn subscribe(&self, service: &str, topic: &str, extra: Option<Value>) {
        let bytes = self.router.build_subscribe(service, topic, extra).await;
        self.send_bytes(bytes).await;
    }

    /// Push `body` to every current subscriber of `subscription_name`.
    pub async fn broadcast(&self, subscription_name: &str, body: Option<Value>) {
        for frame in self.registry.broadcast(subscription_name, body).await {
            self.send_bytes(frame).await;
        }
    }

    /// Install (or replace) a provided service at any time, not just at
    /// connect.
    pub async fn register_provided_service(&self, service: ProvidedService) {
        self.registry.register(service).await;
    }

    pub async fn get_service_instance(&self, name: &str) -> Option<Arc<ProvidedService>> {
        self.registry.lookup(name).await
    }

    /// Drop pending-request entries older than `max_age`. Not called
    /// automatically; a long-lived caller may invoke this periodically to
    /// bound `pending` table growth per §9's guidance on late responses.
    pub async fn sweep_stale_requests(&self, max_age: Duration) -> usize {
        self.router.sweep_stale(max_age).await
    }
}

fn core_info_from_body(body: &Value) -> CoreInfo {
    CoreInfo {
        id: body.get("core_id").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
        name: body.get("display_name").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
        version: body.get("display_version").and_then(|v| v.as_str()).map(|s| s.to_string()),
    }
}
