//! The routing-and-dispatch core of a fabric node.
//!
//! Every participating process holds one [`Service`]: it maintains the
//! single upstream session toward its parent (ultimately terminating at
//! the Master), accepts any number of downstream sessions from children,
//! learns and routes requests toward nodes identified by opaque string
//! ids, and hosts protocol handlers addressable by
//! `(protocol, realm, method)`.  All traffic is JSON-RPC 2.0 over a
//! message-framed transport owned by the caller; the transport hands each
//! complete frame to [`Service::process`] and tells the service about
//! session lifecycle through the `session_*` and `upstream_*` surface.

pub mod ident;
pub mod registry;
pub mod routing;
pub mod rpc;
pub mod session;
pub mod subscription;

mod dispatch;
mod protocol;

pub use self::{
    ident::{NodeId, Realm, SessionId, Upstream, UpstreamState},
    registry::ProtocolRegistry,
    routing::RouteTable,
    rpc::{
        BroadcastEvent, EventHandler, ExecuteHandler, ExecuteOutcome, ExecuteReply,
        ExecuteRequest, InboundRequest, RpcRegistry, execute_result,
    },
    session::{Outbound, ResponseCallback, ResponseEvent, Session, SessionManager},
    subscription::{Subscriber, SubscriptionKey, Subscriptions},
};

use std::sync::Arc;

/// Default per-request deadline, in seconds.
pub const DEFAULT_REQUEST_TIMEOUT: u64 = 10;

/// Synchronous failures of the generator surface.
///
/// Wire-level failures (`-32601`, `-32602`, `-32603`) never appear here,
/// they are answered on the session they arrived on.  Timeouts and
/// teardown of in-flight requests are reported through
/// [`ResponseEvent`], not through this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// No usable session: the upstream is not up and no downstream route
    /// matches.  Nothing was sent and no callback will fire.
    Disconnected,
    /// A second concurrent attempt at a singleton operation, e.g. an
    /// upstream connect while one is already establishing.
    DuplicateOperation,
    /// The session's outbound sink refused the frame, the session is on
    /// its way down.
    Send,
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Observer of node-level events, supplied by the embedding application.
pub trait ServiceHandler: Send + Sync {
    /// A session was attached by the transport.
    #[allow(unused_variables)]
    fn on_session_attached(&self, session: &SessionId) {}

    /// A session finished tearing down; its routes, subscriptions and
    /// pending requests are already cleaned up.
    #[allow(unused_variables)]
    fn on_session_closed(&self, session: &SessionId) {}

    /// A node became reachable through a downstream session.
    #[allow(unused_variables)]
    fn on_route_added(&self, node: &NodeId) {}

    /// A node stopped being reachable.
    #[allow(unused_variables)]
    fn on_route_removed(&self, node: &NodeId) {}

    /// Admission policy for requests that carry a realm, invoked before
    /// routing.  The default allows everything.
    #[allow(unused_variables)]
    fn authorize_realm(&self, session: &SessionId, realm: &str) -> bool {
        true
    }
}

pub struct ServiceOptions<T> {
    pub handler: T,
    /// Per-request deadline in seconds, swept once a second.
    pub request_timeout: u64,
}

/// The node runtime: owner of every manager table and the composition
/// root the transport and the application talk to.
///
/// Managers are allocated leaves-first and torn down in reverse; the six
/// core RPCs are installed into the fixed table at construction time.
pub struct Service {
    pub(crate) rpcs: RpcRegistry,
    pub(crate) routes: RouteTable,
    pub(crate) subscriptions: Subscriptions,
    pub(crate) registry: ProtocolRegistry,
    pub(crate) upstream: Upstream,
    pub(crate) sessions: Arc<SessionManager>,
    pub(crate) handler: Box<dyn ServiceHandler>,
}

impl Service {
    pub fn new<T>(options: ServiceOptions<T>) -> Self
    where
        T: ServiceHandler + 'static,
    {
        let service = Self {
            rpcs: RpcRegistry::new(),
            routes: RouteTable::new(),
            subscriptions: Subscriptions::new(),
            registry: ProtocolRegistry::new(),
            upstream: Upstream::new(),
            sessions: SessionManager::new(options.request_timeout),
            handler: Box::new(options.handler),
        };

        service.rpcs.corerpc_add("blade.register", protocol::register_request_handler);
        service.rpcs.corerpc_add("blade.publish", protocol::publish_request_handler);
        service.rpcs.corerpc_add("blade.locate", protocol::locate_request_handler);
        service.rpcs.corerpc_add("blade.execute", protocol::execute_request_handler);
        service.rpcs.corerpc_add("blade.subscribe", protocol::subscribe_request_handler);
        service.rpcs.corerpc_add("blade.broadcast", protocol::broadcast_request_handler);

        log::debug!("service created");

        service
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn subscriptions(&self) -> &Subscriptions {
        &self.subscriptions
    }

    pub fn registry(&self) -> &ProtocolRegistry {
        &self.registry
    }

    pub fn upstream(&self) -> &Upstream {
        &self.upstream
    }

    pub fn local_id(&self) -> Option<NodeId> {
        self.upstream.local_id()
    }

    pub fn master_id(&self) -> Option<NodeId> {
        self.upstream.master_id()
    }

    pub fn realms(&self) -> Vec<Realm> {
        self.upstream.realms()
    }

    /// Configure this node as the Master of the fabric: its own id is the
    /// master id and it asserts the given realms.
    pub fn set_master(&self, nodeid: NodeId, realms: impl IntoIterator<Item = Realm>) {
        self.upstream.set_local_id(nodeid.clone());
        self.upstream.set_master_id(nodeid);
        for realm in realms {
            self.upstream.realm_add(realm);
        }
    }

    /// Set the node id of a non-Master node.  Set once during startup,
    /// immutable thereafter.
    pub fn set_local_id(&self, nodeid: NodeId) {
        self.upstream.set_local_id(nodeid);
    }

    /// Register a protocol method reachable through `blade.execute`.
    pub fn protocolrpc_add<H>(&self, method: &str, protocol: &str, realm: &str, handler: H)
    where
        H: ExecuteHandler + 'static,
    {
        self.rpcs
            .protocolrpc_add(method, protocol, realm, Arc::new(handler));
    }

    pub fn protocolrpc_remove(&self, method: &str, protocol: &str, realm: &str) {
        self.rpcs.protocolrpc_remove(method, protocol, realm);
    }

    // SESSION LIFECYCLE, driven by the transport

    /// Attach a new session around its outbound sink and return its id.
    pub fn session_attach(&self, outbound: Box<dyn Outbound>) -> SessionId {
        let id = self.sessions.attach(outbound);
        self.handler.on_session_attached(&id);
        id
    }

    /// A downstream session finished establishing: the child node is now
    /// reachable through it.
    pub fn downstream_established(&self, session: &SessionId, node: NodeId) {
        {
            let lock = self.sessions.get(session);
            let Some(session) = lock.get_ref() else {
                return;
            };

            session.route_add(node.clone());
        }

        self.route_learned(node, session.clone());
    }

    /// Begin upstream establishment.  Fails with
    /// [`Error::DuplicateOperation`] while another attempt is connecting
    /// or up.
    pub fn upstream_connecting(&self) -> Result<(), Error> {
        self.upstream.connecting()
    }

    /// Abandon a failed upstream establishment attempt.
    pub fn upstream_failed(&self) {
        self.upstream.connect_failed();
    }

    /// The upstream session finished establishing; the master identity
    /// and its realms were learned from the session-layer handshake.
    pub fn upstream_established(
        &self,
        session: &SessionId,
        master: NodeId,
        realms: impl IntoIterator<Item = Realm>,
    ) {
        self.upstream.set_master_id(master);
        for realm in realms {
            self.upstream.realm_add(realm);
        }

        self.upstream.established(session.clone());
        log::info!("upstream session ({}) established", session);
    }

    /// Tear down one session and every piece of state that referenced it:
    /// pending requests are cancelled, owned routes leave the table and
    /// are withdrawn from the parent, the protocol registry and the
    /// subscription tree are reconciled, and the upstream link is marked
    /// disconnected if this was it.  Safe to call for unknown ids.
    pub fn session_closed(&self, session_id: &SessionId) {
        let Some(session) = self.sessions.detach(session_id) else {
            return;
        };

        // the requester hears exactly once, teardown included
        for callback in session.cancel_all() {
            callback(ResponseEvent::Closed);
        }

        let routes = session.take_routes();
        for node in &routes {
            self.route_lost(node, session_id);
        }

        // only the Master reconciles controller liveness, elsewhere the
        // registry is empty and this is a no-op
        self.registry.purge(&routes);

        for key in self.subscriptions.purge_session(session_id) {
            let _ = self.subscribe_raw(&key.event, &key.protocol, &key.realm, true, None);
        }

        if self.upstream.lost(session_id) {
            log::warn!("upstream session ({}) lost", session_id);
        }

        self.handler.on_session_closed(session_id);
        log::debug!("session ({}) reaped", session_id);
    }

    /// Tear down every session.  Idempotent: a second call finds nothing
    /// left to do.
    pub fn shutdown(&self) {
        for id in self.sessions.ids() {
            self.session_closed(&id);
        }
    }

    // ROUTE BOOKKEEPING shared by the register handler and session
    // establishment

    pub(crate) fn route_learned(&self, node: NodeId, session: SessionId) {
        self.routes.add(node.clone(), session);
        self.handler.on_route_added(&node);

        // each hop announces its reachable set to its own parent, the
        // chain ends at the Master
        if self.upstream.session().is_some() {
            let _ = self.register(&node, false, None);
        }
    }

    pub(crate) fn route_lost(&self, node: &NodeId, session: &SessionId) {
        if self.routes.remove_owned(node, session) {
            self.handler.on_route_removed(node);

            if self.upstream.session().is_some() {
                let _ = self.register(node, true, None);
            }
        }
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.shutdown();
    }
}
