//! Process-wide bridge state.

use std::sync::Arc;
use std::time::Instant;

use linuxio_common::{Bootstrap, Error, Mode};
use tokio_util::sync::CancellationToken;

use crate::dbus::DbusGate;
use crate::handlers;
use crate::network::rates::RateCache;
use crate::registry::Registry;
use crate::runner::{CommandRunner, TokioRunner};

/// Identity of the one session this bridge serves.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: String,
    pub username: String,
    pub uid: u32,
    pub gid: u32,
    pub secret: String,
    pub socket_path: String,
    pub server_base_url: String,
    pub mode: Mode,
}

pub struct BridgeState {
    pub session: SessionInfo,
    pub registry: Registry,
    pub dbus: DbusGate,
    pub runner: Arc<dyn CommandRunner>,
    pub net_rates: RateCache,
    pub started: Instant,
    /// Root cancellation: tripped by SIGTERM/SIGINT or `control/Shutdown`.
    pub shutdown: CancellationToken,
}

impl BridgeState {
    /// Build the state from a validated bootstrap blob and register every
    /// handler. Fails only on a registration conflict, which is a packaging
    /// bug, not a runtime condition.
    pub fn new(bootstrap: &Bootstrap, privileged: bool) -> Result<Arc<Self>, Error> {
        let session = SessionInfo {
            session_id: bootstrap.session_id.clone(),
            username: bootstrap.username.clone(),
            uid: bootstrap.uid,
            gid: bootstrap.gid,
            secret: bootstrap.secret.clone(),
            socket_path: bootstrap.socket_path.clone(),
            server_base_url: bootstrap.server_base_url.clone(),
            mode: if privileged {
                Mode::Privileged
            } else {
                Mode::Unprivileged
            },
        };
        let mut registry = Registry::new();
        handlers::register_all(&mut registry)?;
        Ok(Arc::new(BridgeState {
            session,
            registry,
            dbus: DbusGate::new(),
            runner: Arc::new(TokioRunner::default()),
            net_rates: RateCache::new(),
            started: Instant::now(),
            shutdown: CancellationToken::new(),
        }))
    }

    /// State with a caller-supplied registry, used by integration tests.
    #[must_use]
    pub fn with_registry(session: SessionInfo, registry: Registry) -> Arc<Self> {
        Arc::new(BridgeState {
            session,
            registry,
            dbus: DbusGate::new(),
            runner: Arc::new(TokioRunner::default()),
            net_rates: RateCache::new(),
            started: Instant::now(),
            shutdown: CancellationToken::new(),
        })
    }
}
