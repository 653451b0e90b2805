//! The `com.roonlabs.pairing:1` provided service: tracks which Core this
//! extension is paired with and notifies subscribers of changes.
//!
//! Pairing state lives on the [`PairingState`] handed in by
//! [`crate::connection::Connection`] (one instance per connection), not at
//! module scope — see the "Global pairing state" Open Question decision in
//! `DESIGN.md`.

use std::sync::{Arc, Mutex};

use serde_json::json;

use crate::registry::{ProvidedService, Response};

pub const SERVICE_NAME: &str = "com.roonlabs.pairing:1";

const UNPAIRED: &str = "undefined";

/// Shared, lock-guarded pairing state plus the callback invoked when a
/// previously-paired Core is replaced by a new one.
#[derive(Clone)]
pub struct PairingState {
    paired_core_id: Arc<Mutex<Option<String>>>,
    on_core_lost: Arc<dyn Fn(&str) + Send + Sync>,
}

impl PairingState {
    pub fn new(on_core_lost: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Self { paired_core_id: Arc::new(Mutex::new(None)), on_core_lost: Arc::new(on_core_lost) }
    }

    pub fn paired_core_id(&self) -> Option<String> {
        self.paired_core_id.lock().unwrap().clone()
    }

    /// Set the paired Core, invoking `on_core_lost` with the previous id
    /// iff it differs from `new_id`. Returns `true` if the pairing
    /// actually changed (and a broadcast is warranted).
    fn pair(&self, new_id: &str) -> bool {
        let mut guard = self.paired_core_id.lock().unwrap();
        match guard.as_deref() {
            Some(current) if current == new_id => false,
            Some(current) => {
                (self.on_core_lost)(current);
                *guard = Some(new_id.to_string());
                true
            }
            None => {
                *guard = Some(new_id.to_string());
                true
            }
        }
    }
}

pub fn service(state: PairingState) -> ProvidedService {
    let get_state = state.clone();
    let pair_state = state.clone();
    let sub_state = state;

    ProvidedService::new(SERVICE_NAME)
        .with_method(
            "get_pairing",
            Arc::new(move |_core, _body| match get_state.paired_core_id() {
                Some(id) => Response::success(Some(json!({ "paired_core_id": id }))),
                None => Response::success(None),
            }),
        )
        .with_method(
            "pair",
            Arc::new(move |_core, body| {
                let new_id = body
                    .and_then(|b| b.get("paired_core_id"))
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();

                let changed = pair_state.pair(&new_id);
                let response = Response::changed(Some(json!({ "paired_core_id": new_id })));
                if changed {
                    response.with_broadcast("subscribe_pairing")
                } else {
                    response
                }
            }),
        )
        .with_subscription(
            "subscribe_pairing",
            Arc::new(move |_core, _body| {
                let current = sub_state.paired_core_id().unwrap_or_else(|| UNPAIRED.to_string());
                Response::subscribed(Some(json!(current)))
            }),
            None,
        )
}
