//! Top-level entry point (§2, §9 "Global singletons").
//!
//! One [`Engine`] owns the process-wide [`EngineShared`] caches and
//! resolvers; every connection dialed through it shares the same
//! [`crate::caches::ServerCapabilities`], [`crate::caches::DirectoryCache`],
//! [`crate::caches::PathCache`], lock table, and TLS session cache, the way
//! a single running process held the original engine's C++ singletons.
//! Tests build a fresh `Engine` per case rather than reaching into statics.

use std::sync::Arc;

use crate::control::{ControlSocket, EngineShared};
use crate::error::EngineError;
use crate::notification::NotificationListener;
use crate::options::EngineOptions;
use crate::server_info::{Credentials, Server};
use crate::status::OpStatus;

/// Process-wide engine state. Cheap to clone; clones share the same
/// underlying caches.
#[derive(Clone, Default)]
pub struct Engine {
    shared: EngineShared,
}

impl Engine {
    /// Builds a fresh engine with empty caches.
    pub fn new() -> Self {
        Engine::default()
    }

    /// Dials `server`, authenticates with `credentials`, and returns a
    /// connected [`ControlSocket`] handle once the logon handshake
    /// completes (successfully or not) — see [`ControlSocket::connect`].
    pub async fn connect(&self, server: Server, credentials: Credentials, options: EngineOptions, listener: impl NotificationListener + 'static) -> Result<(ControlSocket, OpStatus), EngineError> {
        ControlSocket::connect(server, credentials, options, self.shared.clone(), Arc::new(listener)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_engines_do_not_share_caches() {
        let a = Engine::new();
        let b = Engine::new();
        assert!(!Arc::ptr_eq(&a.shared.locks, &b.shared.locks));
    }
}
