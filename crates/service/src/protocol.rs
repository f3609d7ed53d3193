//! The six fabric operations: request generators on [`Service`] and the
//! corresponding core request handlers installed at startup.

use crate::{
    Error, Service,
    ident::NodeId,
    rpc::{self, ExecuteHandler, ExecuteOutcome, ExecuteRequest, InboundRequest},
    session::{ResponseCallback, message_id},
    subscription::{Subscriber, SubscriptionKey},
};

use std::sync::Arc;

use codec::{INVALID_PARAMS, Request, Response};
use serde_json::json;

impl Service {
    /// `blade.register` generator: tell the direct upstream that a node id
    /// is reachable through this node, or no longer is.
    pub fn register(
        &self,
        nodeid: &NodeId,
        remove: bool,
        callback: Option<ResponseCallback>,
    ) -> Result<(), Error> {
        let upstream = self.upstream.session().ok_or(Error::Disconnected)?;
        let lock = self.sessions.get(&upstream);
        let session = lock.get_ref().ok_or(Error::Disconnected)?;

        let mut params = json!({ "nodeid": nodeid.as_str() });
        if remove {
            params["remove"] = json!(true);
        }

        log::debug!(
            "session ({}) register request ({} {}) started",
            session.id(),
            if remove { "removing" } else { "adding" },
            nodeid
        );

        session.send(
            &Request::new(message_id(), "blade.register", Some(params)),
            callback,
        )
    }

    /// `blade.publish` generator: advertise this node as a controller of
    /// `(protocol, realm)` to the Master.
    pub fn publish(
        &self,
        protocol: &str,
        realm: &str,
        callback: Option<ResponseCallback>,
    ) -> Result<(), Error> {
        self.master_addressed("blade.publish", protocol, realm, callback)
    }

    /// `blade.locate` generator: ask the Master for the current controller
    /// set of `(protocol, realm)`.
    pub fn locate(
        &self,
        protocol: &str,
        realm: &str,
        callback: Option<ResponseCallback>,
    ) -> Result<(), Error> {
        self.master_addressed("blade.locate", protocol, realm, callback)
    }

    fn master_addressed(
        &self,
        method: &str,
        protocol: &str,
        realm: &str,
        callback: Option<ResponseCallback>,
    ) -> Result<(), Error> {
        let upstream = self.upstream.session().ok_or(Error::Disconnected)?;
        // the master id is learned during session establishment, without
        // it the request cannot be addressed
        let master = self.upstream.master_id().ok_or(Error::Disconnected)?;
        let local = self.local_id_required();

        let lock = self.sessions.get(&upstream);
        let session = lock.get_ref().ok_or(Error::Disconnected)?;

        log::debug!("session ({}) {} request started", session.id(), method);

        session.send(
            &Request::new(
                message_id(),
                method,
                Some(json!({
                    "protocol": protocol,
                    "realm": realm,
                    "requester-nodeid": local.as_str(),
                    "responder-nodeid": master.as_str(),
                })),
            ),
            callback,
        )
    }

    /// `blade.execute` generator: invoke `method` on `nodeid` within
    /// `(protocol, realm)`.
    ///
    /// Routes through the local table when the responder is reachable
    /// below, otherwise climbs the upstream session.
    pub fn execute(
        &self,
        nodeid: &NodeId,
        method: &str,
        protocol: &str,
        realm: &str,
        params: Option<serde_json::Value>,
        callback: Option<ResponseCallback>,
    ) -> Result<(), Error> {
        let target = match self.routes.lookup(nodeid) {
            Some(session) => session,
            None => self.upstream.session().ok_or(Error::Disconnected)?,
        };
        let local = self.local_id_required();

        let lock = self.sessions.get(&target);
        let session = lock.get_ref().ok_or(Error::Disconnected)?;

        let mut request_params = json!({
            "method": method,
            "protocol": protocol,
            "realm": realm,
            "requester-nodeid": local.as_str(),
            "responder-nodeid": nodeid.as_str(),
        });
        if let Some(params) = params {
            request_params["params"] = params;
        }

        log::debug!("session ({}) execute request started", session.id());

        session.send(
            &Request::new(message_id(), "blade.execute", Some(request_params)),
            callback,
        )
    }

    /// `blade.subscribe` generator: install a local callback for
    /// `(protocol, realm, event)` and propagate the interest upstream on
    /// the first local subscriber.
    pub fn subscribe(
        &self,
        event: &str,
        protocol: &str,
        realm: &str,
        handler: Arc<dyn rpc::EventHandler>,
        callback: Option<ResponseCallback>,
    ) -> Result<(), Error> {
        let master_local = self.upstream.master_local();
        if !master_local && self.upstream.session().is_none() {
            return Err(Error::Disconnected);
        }

        let key = SubscriptionKey::new(event, protocol, realm);
        let propagate = self
            .subscriptions
            .subscriber_add(&key, Subscriber::Local, Some(handler));

        // the Master terminates propagation, it has no upstream
        if propagate && !master_local {
            self.subscribe_raw(event, protocol, realm, false, callback)?;
        }

        Ok(())
    }

    /// `blade.subscribe` generator, removal side.
    pub fn unsubscribe(
        &self,
        event: &str,
        protocol: &str,
        realm: &str,
        callback: Option<ResponseCallback>,
    ) -> Result<(), Error> {
        let master_local = self.upstream.master_local();
        if !master_local && self.upstream.session().is_none() {
            return Err(Error::Disconnected);
        }

        let key = SubscriptionKey::new(event, protocol, realm);
        let propagate = self
            .subscriptions
            .subscriber_remove(&key, &Subscriber::Local);

        if propagate && !master_local {
            self.subscribe_raw(event, protocol, realm, true, callback)?;
        }

        Ok(())
    }

    /// Send the wire form of `blade.subscribe` upstream, without touching
    /// the local tree.
    pub(crate) fn subscribe_raw(
        &self,
        event: &str,
        protocol: &str,
        realm: &str,
        remove: bool,
        callback: Option<ResponseCallback>,
    ) -> Result<(), Error> {
        let upstream = self.upstream.session().ok_or(Error::Disconnected)?;
        let lock = self.sessions.get(&upstream);
        let session = lock.get_ref().ok_or(Error::Disconnected)?;

        let mut params = json!({
            "event": event,
            "protocol": protocol,
            "realm": realm,
        });
        if remove {
            params["remove"] = json!(true);
        }

        log::debug!("session ({}) subscribe request started", session.id());

        session.send(
            &Request::new(message_id(), "blade.subscribe", Some(params)),
            callback,
        )
    }

    /// `blade.broadcast` generator: deliver an event to every subscriber
    /// of `(protocol, realm, event)`.
    ///
    /// The originator fans out to its downstream subscribers and its
    /// upstream; its own local callback is not invoked.
    pub fn broadcast(
        &self,
        broadcaster: Option<&NodeId>,
        event: &str,
        protocol: &str,
        realm: &str,
        params: Option<&serde_json::Value>,
    ) -> Result<(), Error> {
        let local = self.local_id_required();
        let broadcaster = broadcaster.unwrap_or(&local);

        self.broadcast_dispatch(broadcaster.as_str(), None, event, protocol, realm, params);

        Ok(())
    }

    /// Fan a broadcast out to every subscriber session except the one it
    /// arrived on, then climb upstream unless it came down from there.
    ///
    /// Returns the local callback for the caller to invoke once the
    /// subscription lock has been released; loop avoidance rests on the
    /// excluded source session and the tree topology, broadcasts carry no
    /// hop count.
    pub(crate) fn broadcast_dispatch(
        &self,
        broadcaster: &str,
        exclude: Option<&crate::ident::SessionId>,
        event: &str,
        protocol: &str,
        realm: &str,
        params: Option<&serde_json::Value>,
    ) -> Option<Arc<dyn rpc::EventHandler>> {
        let key = SubscriptionKey::new(event, protocol, realm);
        let (mut targets, handler) = self.subscriptions.fanout(&key, exclude);

        if let Some(upstream) = self.upstream.session() {
            if Some(&upstream) != exclude && !targets.contains(&upstream) {
                targets.push(upstream);
            }
        }

        for target in targets {
            let lock = self.sessions.get(&target);
            let Some(session) = lock.get_ref() else {
                continue;
            };

            let mut request_params = json!({
                "broadcaster-nodeid": broadcaster,
                "event": event,
                "protocol": protocol,
                "realm": realm,
            });
            if let Some(params) = params {
                request_params["params"] = params.clone();
            }

            if let Err(e) = session.send(
                &Request::new(message_id(), "blade.broadcast", Some(request_params)),
                None,
            ) {
                log::debug!("session ({}) broadcast send failed: {}", target, e);
            }
        }

        handler
    }

    fn local_id_required(&self) -> NodeId {
        self.upstream
            .local_id()
            .expect("local node id must be set during startup")
    }
}

// CORE REQUEST HANDLERS

macro_rules! required_str {
    ($request:expr, $key:expr, $missing:expr) => {
        match $request.request.param_str($key) {
            Some(value) => value,
            None => {
                $request.reject(INVALID_PARAMS, $missing);
                return;
            }
        }
    };
}

fn has_params(request: &InboundRequest<'_>) -> bool {
    if request.request.params.is_none() {
        request.reject(INVALID_PARAMS, "Missing params object");
        return false;
    }

    true
}

/// `blade.register`: record or drop a route for a node reachable through
/// the requesting session.
///
/// Registration is answered locally; the learned route is re-announced to
/// this node's own parent so every hop tracks its reachable set.
pub(crate) fn register_request_handler(service: &Service, request: InboundRequest<'_>) {
    if !has_params(&request) {
        return;
    }
    let nodeid = required_str!(request, "nodeid", "Missing params nodeid");
    let remove = request.request.param_bool("remove");

    log::debug!(
        "session ({}) register request ({} {}) processing",
        request.session.id(),
        if remove { "removing" } else { "adding" },
        nodeid
    );

    let node = NodeId::from(nodeid);
    if remove {
        request.session.route_remove(&node);
        service.route_lost(&node, request.session.id());
    } else {
        request.session.route_add(node.clone());
        service.route_learned(node, request.session.id().clone());
    }

    request.respond(json!({}));
}

/// `blade.publish`: the Master records the requester as a controller of
/// `(protocol, realm)`.
pub(crate) fn publish_request_handler(service: &Service, request: InboundRequest<'_>) {
    if !has_params(&request) {
        return;
    }
    let protocol = required_str!(request, "protocol", "Missing params protocol");
    let realm = required_str!(request, "realm", "Missing params realm");
    let requester = required_str!(request, "requester-nodeid", "Missing params requester-nodeid");
    let responder = required_str!(request, "responder-nodeid", "Missing params responder-nodeid");

    if !service.upstream.is_master(responder) {
        request.reject(INVALID_PARAMS, "Invalid params responder-nodeid");
        return;
    }

    log::debug!(
        "session ({}) publish request ({} to {}) processing",
        request.session.id(),
        requester,
        responder
    );

    service
        .registry
        .controller_add(protocol, realm, NodeId::from(requester));

    request.respond(json!({
        "protocol": protocol,
        "realm": realm,
        "requester-nodeid": requester,
        "responder-nodeid": responder,
    }));
}

/// `blade.locate`: the Master answers with the current controller set of
/// `(protocol, realm)`.
pub(crate) fn locate_request_handler(service: &Service, request: InboundRequest<'_>) {
    if !has_params(&request) {
        return;
    }
    let protocol = required_str!(request, "protocol", "Missing params protocol");
    let realm = required_str!(request, "realm", "Missing params realm");
    let requester = required_str!(request, "requester-nodeid", "Missing params requester-nodeid");
    let responder = required_str!(request, "responder-nodeid", "Missing params responder-nodeid");

    if !service.upstream.is_master(responder) {
        request.reject(INVALID_PARAMS, "Invalid params responder-nodeid");
        return;
    }

    log::debug!(
        "session ({}) locate request ({} to {}) processing",
        request.session.id(),
        requester,
        responder
    );

    let controllers = service
        .registry
        .controllers(protocol, realm)
        .into_iter()
        .map(|controller| controller.as_str().to_string())
        .collect::<Vec<_>>();

    request.respond(json!({
        "protocol": protocol,
        "realm": realm,
        "requester-nodeid": requester,
        "responder-nodeid": responder,
        "controllers": controllers,
    }));
}

/// `blade.execute`: run the protocol method registered for
/// `(method, protocol, realm)` on this node.
pub(crate) fn execute_request_handler(service: &Service, request: InboundRequest<'_>) {
    if !has_params(&request) {
        return;
    }
    let method = required_str!(request, "method", "Missing params method");
    let protocol = required_str!(request, "protocol", "Missing params protocol");
    let realm = required_str!(request, "realm", "Missing params realm");
    let requester = required_str!(request, "requester-nodeid", "Missing params requester-nodeid");
    let responder = required_str!(request, "responder-nodeid", "Missing params responder-nodeid");

    log::debug!(
        "session ({}) execute request ({} to {}) processing",
        request.session.id(),
        requester,
        responder
    );

    let Some(handler) = service.rpcs.protocolrpc_lookup(method, protocol, realm) else {
        request.reject(INVALID_PARAMS, "Unknown params method");
        return;
    };

    run_execute_handler(service, &request, handler, method);
}

/// Run a protocol method handler and settle its outcome.
pub(crate) fn run_execute_handler(
    service: &Service,
    inbound: &InboundRequest<'_>,
    handler: Arc<dyn ExecuteHandler>,
    method: &str,
) {
    let outcome = handler.on_execute(
        service,
        ExecuteRequest {
            session: inbound.session,
            request: inbound.request,
            method,
        },
    );

    match outcome {
        ExecuteOutcome::Reply(result) => {
            let response = rpc::execute_response(
                inbound.request.id.clone(),
                inbound.request.param_str("protocol").unwrap_or_default(),
                inbound.request.param_str("realm").unwrap_or_default(),
                inbound.request.param_str("requester-nodeid").unwrap_or_default(),
                inbound.request.param_str("responder-nodeid").unwrap_or_default(),
                result,
            );
            let _ = inbound.session.respond(&response);
        }
        ExecuteOutcome::Error(code, message) => {
            let _ = inbound
                .session
                .respond(&Response::error(inbound.request.id.clone(), code, message));
        }
        // the handler took an ExecuteReply and answers later
        ExecuteOutcome::Deferred => {}
    }
}

/// `blade.subscribe`: apply the interest change for the requesting
/// session and propagate upstream on a 0 ↔ 1 transition.
pub(crate) fn subscribe_request_handler(service: &Service, request: InboundRequest<'_>) {
    if !has_params(&request) {
        return;
    }
    let event = required_str!(request, "event", "Missing params event");
    let protocol = required_str!(request, "protocol", "Missing params protocol");
    let realm = required_str!(request, "realm", "Missing params realm");
    let remove = request.request.param_bool("remove");

    log::debug!(
        "session ({}) subscribe request processing",
        request.session.id()
    );

    let key = SubscriptionKey::new(event, protocol, realm);
    let subscriber = Subscriber::Session(request.session.id().clone());
    let propagate = if remove {
        service.subscriptions.subscriber_remove(&key, &subscriber)
    } else {
        service.subscriptions.subscriber_add(&key, subscriber, None)
    };

    // the Master end of the tree has no upstream to tell
    if propagate {
        let _ = service.subscribe_raw(event, protocol, realm, remove, None);
    }

    request.respond(json!({
        "event": event,
        "protocol": protocol,
        "realm": realm,
    }));
}

/// `blade.broadcast`: fan the event out to every subscriber except the
/// session it arrived on and the broadcaster itself, then invoke the
/// local callback if one is installed.
pub(crate) fn broadcast_request_handler(service: &Service, request: InboundRequest<'_>) {
    if !has_params(&request) {
        return;
    }
    let broadcaster = required_str!(request, "broadcaster-nodeid", "Missing params broadcaster-nodeid");
    let event = required_str!(request, "event", "Missing params event");
    let protocol = required_str!(request, "protocol", "Missing params protocol");
    let realm = required_str!(request, "realm", "Missing params realm");
    let params = request.request.param("params");

    let handler = service.broadcast_dispatch(
        broadcaster,
        Some(request.session.id()),
        event,
        protocol,
        realm,
        params,
    );

    if let Some(handler) = handler {
        // the broadcaster does not hear its own event
        if !service.upstream.is_local(broadcaster) {
            handler.on_broadcast(
                service,
                rpc::BroadcastEvent {
                    broadcaster,
                    event,
                    protocol,
                    realm,
                    params,
                },
            );
        }
    }

    request.respond(json!({
        "broadcaster-nodeid": broadcaster,
        "event": event,
        "protocol": protocol,
        "realm": realm,
    }));
}
