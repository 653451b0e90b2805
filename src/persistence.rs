//! Pure data-transform: extract/apply the auth token and paired-core id
//! to/from a serializable value. I/O is the caller's responsibility.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::connection::ConnectionConfig;

/// Everything this client persists across process restarts.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistedState {
    #[serde(default)]
    pub tokens: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paired_core_id: Option<String>,
}

impl PersistedState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the token issued by `core_id` during registration.
    pub fn remember_token(&mut self, core_id: impl Into<String>, token: impl Into<String>) {
        self.tokens.insert(core_id.into(), token.into());
    }

    pub fn token_for(&self, core_id: &str) -> Option<&str> {
        self.tokens.get(core_id).map(|s| s.as_str())
    }
}

/// Produce a copy of `config` with `token` injected from `state`, keyed by
/// `core_id`, iff a token is on file for that Core.
pub fn apply(mut config: ConnectionConfig, state: &PersistedState, core_id: &str) -> ConnectionConfig {
    if let Some(token) = state.token_for(core_id) {
        config.token = Some(token.to_string());
    }
    config
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let mut state = PersistedState::new();
        state.remember_token("core-1", "tok-abc");
        state.paired_core_id = Some("core-1".to_string());

        let encoded = serde_json::to_string(&state).unwrap();
        let decoded: PersistedState = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn round_trips_with_no_pairing() {
        let state = PersistedState::new();
        let encoded = serde_json::to_string(&state).unwrap();
        let decoded: PersistedState = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn apply_injects_known_token_only() {
        let mut state = PersistedState::new();
        state.remember_token("core-1", "tok-abc");

        let config = ConnectionConfig::new("host", crate::connection::ExtensionInfo::new("ext", "Ext"));
        let applied = apply(config.clone(), &state, "core-1");
        assert_eq!(applied.token.as_deref(), Some("tok-abc"));

        let not_applied = apply(config, &state, "core-2");
        assert_eq!(not_applied.token, None);
    }
}
