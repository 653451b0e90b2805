//! Built-in provided services, always registered by [`crate::connection::Connection`]
//! alongside whatever services the caller registers itself.

pub mod pairing;
pub mod ping;
