use crate::{
    Error, Service,
    ident::SessionId,
    session::{Session, Table},
};

use std::sync::Arc;

use codec::{Request, Response};
use parking_lot::RwLock;
use serde_json::{Value, json};

/// A request annotated with the session it arrived on.
///
/// The session reference lives inside the manager's read guard held by the
/// dispatcher, so it stays valid for the whole synchronous handler body.
pub struct InboundRequest<'a> {
    pub(crate) session: &'a Session,
    pub(crate) request: &'a Request,
}

impl InboundRequest<'_> {
    pub fn session(&self) -> &Session {
        self.session
    }

    pub fn request(&self) -> &Request {
        self.request
    }

    pub(crate) fn respond(&self, result: Value) {
        let _ = self
            .session
            .respond(&Response::result(self.request.id.clone(), result));
    }

    pub(crate) fn reject(&self, code: i64, message: &str) {
        log::debug!(
            "session ({}) {} request rejected: {}",
            self.session.id(),
            self.request.method,
            message
        );

        let _ = self
            .session
            .respond(&Response::error(self.request.id.clone(), code, message));
    }
}

/// An execute request as seen by a protocol method handler.
pub struct ExecuteRequest<'a> {
    pub(crate) session: &'a Session,
    pub(crate) request: &'a Request,
    pub(crate) method: &'a str,
}

impl<'a> ExecuteRequest<'a> {
    pub fn method(&self) -> &str {
        self.method
    }

    pub fn protocol(&self) -> &str {
        self.request.param_str("protocol").unwrap_or_default()
    }

    pub fn realm(&self) -> &str {
        self.request.param_str("realm").unwrap_or_default()
    }

    pub fn requester_nodeid(&self) -> &str {
        self.request.param_str("requester-nodeid").unwrap_or_default()
    }

    pub fn responder_nodeid(&self) -> &str {
        self.request.param_str("responder-nodeid").unwrap_or_default()
    }

    /// The caller-supplied nested `params` value, if any.
    pub fn params(&self) -> Option<&'a Value> {
        self.request.param("params")
    }

    /// Detach an owned reply handle from the inbound frame.
    ///
    /// The frame itself is only valid for the synchronous handler body; a
    /// handler that responds later takes a handle, returns
    /// [`ExecuteOutcome::Deferred`], and completes the handle when the
    /// result is ready.
    pub fn defer(&self) -> ExecuteReply {
        ExecuteReply {
            session: self.session.id().clone(),
            id: self.request.id.clone(),
            protocol: self.protocol().to_string(),
            realm: self.realm().to_string(),
            requester: self.requester_nodeid().to_string(),
            responder: self.responder_nodeid().to_string(),
        }
    }
}

/// An owned handle for answering an execute request after the handler has
/// returned.
pub struct ExecuteReply {
    session: SessionId,
    id: String,
    protocol: String,
    realm: String,
    requester: String,
    responder: String,
}

impl ExecuteReply {
    /// Send the result envelope back along the path the request came in
    /// on.  Fails with [`Error::Disconnected`] when that session is gone.
    pub fn result(self, service: &Service, result: Value) -> Result<(), Error> {
        let response = execute_response(
            self.id,
            &self.protocol,
            &self.realm,
            &self.requester,
            &self.responder,
            result,
        );

        let lock = service.sessions().get(&self.session);
        let session = lock.get_ref().ok_or(Error::Disconnected)?;
        session.respond(&response)
    }

    pub fn error(self, service: &Service, code: i64, message: impl Into<String>) -> Result<(), Error> {
        let response = Response::error(self.id, code, message);

        let lock = service.sessions().get(&self.session);
        let session = lock.get_ref().ok_or(Error::Disconnected)?;
        session.respond(&response)
    }
}

/// The execute response envelope always echoes the addressing fields and
/// nests the handler's result.
pub(crate) fn execute_response(
    id: String,
    protocol: &str,
    realm: &str,
    requester: &str,
    responder: &str,
    result: Value,
) -> Response {
    Response::result(
        id,
        json!({
            "protocol": protocol,
            "realm": realm,
            "requester-nodeid": requester,
            "responder-nodeid": responder,
            "result": result,
        }),
    )
}

/// Pull the handler's result out of an execute response.
pub fn execute_result(response: &Response) -> Option<&Value> {
    response.result.as_ref()?.get("result")
}

/// Outcome of a protocol method handler.
pub enum ExecuteOutcome {
    /// Respond now with this result, wrapped in the execute envelope.
    Reply(Value),
    /// Respond now with a JSON-RPC error on the same id.
    Error(i64, String),
    /// The handler took an [`ExecuteReply`] and will respond later.
    Deferred,
}

/// A protocol method addressable through `blade.execute`.
pub trait ExecuteHandler: Send + Sync {
    fn on_execute(&self, service: &Service, request: ExecuteRequest<'_>) -> ExecuteOutcome;
}

impl<F> ExecuteHandler for F
where
    F: Fn(&Service, ExecuteRequest<'_>) -> ExecuteOutcome + Send + Sync,
{
    fn on_execute(&self, service: &Service, request: ExecuteRequest<'_>) -> ExecuteOutcome {
        self(service, request)
    }
}

/// An event delivered through `blade.broadcast`.
pub struct BroadcastEvent<'a> {
    pub(crate) broadcaster: &'a str,
    pub(crate) event: &'a str,
    pub(crate) protocol: &'a str,
    pub(crate) realm: &'a str,
    pub(crate) params: Option<&'a Value>,
}

impl<'a> BroadcastEvent<'a> {
    pub fn broadcaster_nodeid(&self) -> &str {
        self.broadcaster
    }

    pub fn event(&self) -> &str {
        self.event
    }

    pub fn protocol(&self) -> &str {
        self.protocol
    }

    pub fn realm(&self) -> &str {
        self.realm
    }

    pub fn params(&self) -> Option<&'a Value> {
        self.params
    }
}

/// The local callback installed by a subscription.
pub trait EventHandler: Send + Sync {
    fn on_broadcast(&self, service: &Service, event: BroadcastEvent<'_>);
}

impl<F> EventHandler for F
where
    F: Fn(&Service, BroadcastEvent<'_>) + Send + Sync,
{
    fn on_broadcast(&self, service: &Service, event: BroadcastEvent<'_>) {
        self(service, event)
    }
}

pub(crate) type CoreHandler = fn(&Service, InboundRequest<'_>);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MethodKey {
    method: String,
    protocol: String,
    realm: String,
}

/// The RPC handler tables: the fixed core table installed at startup and
/// the protocol method table registered by application code.
pub struct RpcRegistry {
    core: RwLock<Table<String, CoreHandler>>,
    protocols: RwLock<Table<MethodKey, Arc<dyn ExecuteHandler>>>,
}

impl RpcRegistry {
    pub(crate) fn new() -> Self {
        Self {
            core: RwLock::new(Table::default()),
            protocols: RwLock::new(Table::default()),
        }
    }

    pub(crate) fn corerpc_add(&self, method: &str, handler: CoreHandler) {
        self.core.write().insert(method.to_string(), handler);
    }

    pub(crate) fn corerpc_lookup(&self, method: &str) -> Option<CoreHandler> {
        self.core.read().get(method).copied()
    }

    pub(crate) fn protocolrpc_add(
        &self,
        method: &str,
        protocol: &str,
        realm: &str,
        handler: Arc<dyn ExecuteHandler>,
    ) {
        self.protocols.write().insert(
            MethodKey {
                method: method.to_string(),
                protocol: protocol.to_string(),
                realm: realm.to_string(),
            },
            handler,
        );
    }

    pub(crate) fn protocolrpc_lookup(
        &self,
        method: &str,
        protocol: &str,
        realm: &str,
    ) -> Option<Arc<dyn ExecuteHandler>> {
        self.protocols
            .read()
            .get(&MethodKey {
                method: method.to_string(),
                protocol: protocol.to_string(),
                realm: realm.to_string(),
            })
            .cloned()
    }

    pub(crate) fn protocolrpc_remove(&self, method: &str, protocol: &str, realm: &str) {
        self.protocols.write().remove(&MethodKey {
            method: method.to_string(),
            protocol: protocol.to_string(),
            realm: realm.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;

    impl ExecuteHandler for Nop {
        fn on_execute(&self, _: &Service, _: ExecuteRequest<'_>) -> ExecuteOutcome {
            ExecuteOutcome::Reply(json!({}))
        }
    }

    #[test]
    fn protocolrpc_keys_are_scoped() {
        let registry = RpcRegistry::new();

        registry.protocolrpc_add("m", "p", "r", Arc::new(Nop));
        assert!(registry.protocolrpc_lookup("m", "p", "r").is_some());
        assert!(registry.protocolrpc_lookup("m", "p", "other").is_none());
        assert!(registry.protocolrpc_lookup("m", "other", "r").is_none());
        assert!(registry.protocolrpc_lookup("other", "p", "r").is_none());

        registry.protocolrpc_remove("m", "p", "r");
        assert!(registry.protocolrpc_lookup("m", "p", "r").is_none());
    }

    #[test]
    fn execute_result_unwraps_the_envelope() {
        let response = execute_response(
            "1".to_string(),
            "p",
            "r",
            "c1",
            "m",
            json!({ "pong": true }),
        );

        assert_eq!(execute_result(&response), Some(&json!({ "pong": true })));
        assert_eq!(response.result_value("protocol"), Some(&json!("p")));
        assert_eq!(response.result_value("requester-nodeid"), Some(&json!("c1")));
    }
}
