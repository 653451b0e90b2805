//! Core client runtime for the Roon remote-control wire protocol: a
//! text-header codec, a WebSocket transport, UDP service discovery, a
//! request/subscription router, a provided-service registry, and a
//! connection supervisor that ties them together with registration and
//! auto-reconnect.
//!
//! This crate intentionally stops at the protocol core. The individual
//! domain services (transport control, browsing, image fetch, pairing
//! business logic, ...) are thin builders over [`connection::Connection`]'s
//! `request`/`subscribe` primitives and are not part of this crate.

mod codec;
mod connection;
mod discovery;
mod errors;
mod events;
mod persistence;
mod registry;
mod router;
mod services;
mod transport;

pub use codec::{Body, Frame, Verb};
pub use connection::{Connection, ConnectionConfig, ConnectionStatus, CoreInfo, ExtensionInfo};
pub use discovery::{discover, DiscoveredCore};
pub use errors::{DiscoveryError, Error, RegistrationError, RequestError, TransportError};
pub use events::{Event, EventKind, EventSink};
pub use persistence::{apply as apply_persisted_state, PersistedState};
pub use registry::{CoreIdentity, ProvidedService, Response};
pub use services::{pairing, ping};

/// The crate's own version, used as the default `display_version` advertised
/// during registration when an [`ExtensionInfo`] is built without one.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
