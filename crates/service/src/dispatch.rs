use crate::{
    Service,
    ident::{NodeId, SessionId},
    protocol,
    rpc::InboundRequest,
    session::{ResponseCallback, ResponseEvent},
};

use std::sync::Arc;

use codec::{INTERNAL_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND, PARSE_ERROR, Payload, Request, Response};

impl Service {
    /// Entry point for one complete inbound frame.
    ///
    /// The session layer calls this for every text frame, in per-session
    /// arrival order.  Responses complete the session's pending-request
    /// table, requests run their handler to completion on the calling
    /// thread while the session's read guard is held.
    pub fn process(&self, session_id: &SessionId, frame: &str) {
        match codec::decode(frame) {
            Ok(Payload::Request(request)) => self.dispatch_request(session_id, request),
            Ok(Payload::Response(response)) => self.dispatch_response(session_id, response),
            Err(e) => {
                log::debug!("session ({}) undecodable frame: {}", session_id, e);

                // answer with a parse error when the frame still carries a
                // usable id, otherwise there is nothing to correlate
                let id = serde_json::from_str::<serde_json::Value>(frame)
                    .ok()
                    .and_then(|value| Some(value.get("id")?.as_str()?.to_string()));
                if let Some(id) = id {
                    let lock = self.sessions.get(session_id);
                    if let Some(session) = lock.get_ref() {
                        let _ = session.respond(&Response::error(id, PARSE_ERROR, "Parse error"));
                    }
                }
            }
        }
    }

    fn dispatch_response(&self, session_id: &SessionId, response: Response) {
        let callback = {
            let lock = self.sessions.get(session_id);
            lock.get_ref().and_then(|session| session.complete(&response.id))
        };

        // exactly once, outside the session lock
        match callback {
            Some(callback) => callback(ResponseEvent::Reply(response)),
            None => log::debug!(
                "session ({}) uncorrelated response ({}) dropped",
                session_id,
                response.id
            ),
        }
    }

    fn dispatch_request(&self, session_id: &SessionId, request: Request) {
        let lock = self.sessions.get(session_id);
        let Some(session) = lock.get_ref() else {
            log::debug!("session ({}) vanished before dispatch", session_id);
            return;
        };

        let inbound = InboundRequest {
            request: &request,
            session,
        };

        // admission policy hook, default allow
        if let Some(realm) = request.param_str("realm") {
            if !self.handler.authorize_realm(session_id, realm) {
                inbound.reject(INVALID_PARAMS, "Realm not permitted");
                return;
            }
        }

        // a request addressed to another node is relayed, never handled here
        if let Some(responder) = request.param_str("responder-nodeid") {
            if !self.upstream.is_local(responder) {
                self.forward(&inbound, responder);
                return;
            }
        }

        if let Some(handler) = self.rpcs.corerpc_lookup(&request.method) {
            handler(self, inbound);
            return;
        }

        // protocol methods may be addressed directly as well as through
        // blade.execute
        let protocol_name = request.param_str("protocol").unwrap_or_default();
        let realm = request.param_str("realm").unwrap_or_default();
        match self.rpcs.protocolrpc_lookup(&request.method, protocol_name, realm) {
            Some(handler) => protocol::run_execute_handler(self, &inbound, handler, &request.method),
            None => inbound.reject(METHOD_NOT_FOUND, "Method not found"),
        }
    }

    /// Relay a request toward its responder, preserving the original
    /// message id so the response flows back along the reverse path.
    ///
    /// The relay's pending entry is the only state an intermediate node
    /// keeps: when the response arrives it is re-sent on the inbound
    /// session under the same id, when the forward target times out or
    /// tears down the entry is dropped and the requester's own deadline
    /// settles the call.
    fn forward(&self, inbound: &InboundRequest<'_>, responder: &str) {
        let target = self
            .routes
            .lookup(&NodeId::from(responder))
            .or_else(|| self.upstream.session());

        // bouncing the request back where it came from cannot make
        // progress either
        let target = match target {
            Some(target) if &target != inbound.session.id() => target,
            _ => {
                inbound.reject(INTERNAL_ERROR, "No route to responder-nodeid");
                return;
            }
        };

        log::debug!(
            "session ({}) relaying {} ({}) toward {} via session ({})",
            inbound.session.id(),
            inbound.request.method,
            inbound.request.id,
            responder,
            target
        );

        let origin = inbound.session.id().clone();
        let sessions = Arc::downgrade(&self.sessions);
        let relay: ResponseCallback = Box::new(move |event| {
            let Some(sessions) = sessions.upgrade() else {
                return;
            };

            if let ResponseEvent::Reply(response) = event {
                let lock = sessions.get(&origin);
                if let Some(session) = lock.get_ref() {
                    let _ = session.respond(&response);
                }
            }
        });

        let lock = self.sessions.get(&target);
        let delivered = match lock.get_ref() {
            Some(session) => session.send(inbound.request, Some(relay)).is_ok(),
            None => false,
        };

        if !delivered {
            inbound.reject(INTERNAL_ERROR, "No route to responder-nodeid");
        }
    }
}
