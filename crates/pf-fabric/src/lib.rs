//! Node fabric for probefleet — the registry of probe nodes, the
//! persistent session layer they connect through, and the dispatcher that
//! routes diagnostic jobs over those sessions.
//!
//! Key modules:
//! - [`protocol`] — the frame-level wire protocol (bit-exact field names)
//! - [`registry`] — durable node records, registration tokens, heartbeats
//! - [`session`] — live session tracking, one session per node
//! - [`dispatcher`] — node selection, job correlation, deadlines
//! - [`ws`] — the axum WebSocket endpoint nodes connect to

pub mod dispatcher;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod ws;

use std::sync::Arc;

use pf_core::config::FabricConfig;

use crate::dispatcher::Dispatcher;
use crate::registry::NodeRegistry;
use crate::session::SessionRegistry;

/// Shared fabric state: registry + live sessions + dispatcher.
pub struct Fabric {
    pub registry: Arc<NodeRegistry>,
    pub sessions: Arc<SessionRegistry>,
    pub dispatcher: Dispatcher,
    pub cfg: FabricConfig,
}

impl Fabric {
    pub fn new(registry: Arc<NodeRegistry>, cfg: FabricConfig) -> Arc<Self> {
        let sessions = Arc::new(SessionRegistry::new());
        let dispatcher = Dispatcher::new(registry.clone(), sessions.clone(), cfg.clone());
        Arc::new(Self {
            registry,
            sessions,
            dispatcher,
            cfg,
        })
    }
}
