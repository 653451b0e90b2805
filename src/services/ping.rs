//! The `com.roonlabs.ping:1` provided service: the simplest possible
//! consumer of the registry, used as a liveness check by the Core.

use std::sync::Arc;

use crate::registry::{ProvidedService, Response};

pub const SERVICE_NAME: &str = "com.roonlabs.ping:1";

pub fn service() -> ProvidedService {
    ProvidedService::new(SERVICE_NAME).with_method("ping", Arc::new(|_core, _body| Response::success(None)))
}
