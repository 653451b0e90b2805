//! Integration-style tests against the crate's public surface only (no
//! live Core required): config builders, persisted-state application, and
//! the bounded events sink.

use roon_client::{
    apply_persisted_state, ConnectionConfig, Error, Event, EventKind, EventSink, ExtensionInfo, PersistedState,
    RequestError,
};

#[test]
fn extension_info_defaults_version_to_crate_version() {
    let info = ExtensionInfo::new("com.example.ext", "Example Extension");
    assert_eq!(info.display_version, roon_client::VERSION);
    assert!(info.publisher.is_none());
}

#[test]
fn persisted_state_injects_token_for_known_core_only() {
    let mut state = PersistedState::new();
    state.remember_token("core-a", "secret-a");

    let base = ConnectionConfig::new("roon.local", ExtensionInfo::new("com.example.ext", "Example Extension"));

    let for_known = apply_persisted_state(base.clone(), &state, "core-a");
    assert_eq!(for_known.token.as_deref(), Some("secret-a"));

    let for_unknown = apply_persisted_state(base, &state, "core-b");
    assert!(for_unknown.token.is_none());
}

#[test]
fn config_builder_overrides_every_default() {
    let config = ConnectionConfig::new("roon.local", ExtensionInfo::new("com.example.ext", "Example Extension"))
        .with_port(9999)
        .with_timeout_ms(5_000)
        .with_auto_reconnect(false)
        .with_backoff(250, 4_000)
        .with_required_services(vec!["com.roonlabs.transport:2".to_string()]);

    assert_eq!(config.port, 9999);
    assert_eq!(config.timeout_ms, 5_000);
    assert!(!config.auto_reconnect);
    assert_eq!(config.backoff_initial_ms, 250);
    assert_eq!(config.backoff_max_ms, 4_000);
    assert_eq!(config.required_services, vec!["com.roonlabs.transport:2".to_string()]);
}

#[tokio::test]
async fn events_sink_is_bounded_and_drops_oldest_under_external_use() {
    let sink = EventSink::new(1);
    sink.push(Event::new(EventKind::ZonesChanged, serde_json::json!({"zones_changed": []}))).await;
    sink.push(Event::new(EventKind::OutputsChanged, serde_json::json!({"outputs_changed": []}))).await;

    let only = sink.recv().await;
    assert_eq!(only.kind, EventKind::OutputsChanged);
}

#[tokio::test]
async fn connection_request_without_transport_surfaces_timeout_error() {
    let config = ConnectionConfig::new("roon.local", ExtensionInfo::new("com.example.ext", "Example Extension"))
        .with_timeout_ms(10);
    let connection = roon_client::Connection::new(config);

    match connection.request("com.roonlabs.ping:1/ping", None).await {
        Err(Error::Request(RequestError::Timeout)) => {}
        other => panic!("expected a request timeout, got {other:?}"),
    }
}
