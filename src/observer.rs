use std::sync::Arc;

use crate::config::Config;

use service::{NodeId, ServiceHandler, SessionId};

#[derive(Clone)]
pub struct Observer {
    config: Arc<Config>,
}

impl Observer {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }
}

impl ServiceHandler for Observer {
    fn on_session_attached(&self, session: &SessionId) {
        log::info!("session attached: id={}", session);
    }

    /// Triggered when the session leaves the node. Possible reasons: the
    /// connection closed, the peer went away, or local shutdown.
    fn on_session_closed(&self, session: &SessionId) {
        log::info!("session closed: id={}", session);
    }

    fn on_route_added(&self, node: &NodeId) {
        log::info!("route added: nodeid={}", node);
    }

    fn on_route_removed(&self, node: &NodeId) {
        log::info!("route removed: nodeid={}", node);
    }

    /// Realm admission stays open; an unexpected realm on the Master is
    /// still worth a trace while operating.
    fn authorize_realm(&self, session: &SessionId, realm: &str) -> bool {
        if let Some(master) = &self.config.master {
            if !master.realms.is_empty() && !master.realms.iter().any(|owned| owned == realm) {
                log::debug!("session ({}) uses unasserted realm {}", session, realm);
            }
        }

        true
    }
}
