use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use codec::{INTERNAL_ERROR, INVALID_PARAMS, Payload, Request, Response};
use parking_lot::Mutex;
use serde_json::{Value, json};

use blade_server_service::{
    BroadcastEvent, Error, EventHandler, ExecuteHandler, ExecuteOutcome, ExecuteReply,
    ExecuteRequest, NodeId,
    Outbound, Realm, ResponseCallback, ResponseEvent, Service, ServiceHandler, ServiceOptions,
    SessionId, execute_result,
};

/// One direction of an in-memory link: frames pushed by one node's
/// session, drained into the peer's dispatcher by the pump.
#[derive(Default, Clone)]
struct Pipe(Arc<Mutex<VecDeque<String>>>);

impl Outbound for Pipe {
    fn send(&self, frame: String) -> Result<(), Error> {
        self.0.lock().push_back(frame);
        Ok(())
    }
}

impl Pipe {
    fn pop(&self) -> Option<String> {
        self.0.lock().pop_front()
    }
}

struct Fabric;

impl ServiceHandler for Fabric {}

struct Edge {
    pipe: Pipe,
    to: Arc<Service>,
    to_session: SessionId,
    seen: Arc<Mutex<Vec<String>>>,
}

/// The wiring between nodes plus a deterministic pump: frames are
/// delivered in order per link until the whole fabric goes quiet.
#[derive(Default)]
struct Net {
    edges: Vec<Edge>,
}

impl Net {
    /// Establish a parent/child session pair.  Links must be created top
    /// down so the parent already knows the master identity it hands out.
    fn link(
        &mut self,
        parent: &Arc<Service>,
        child: &Arc<Service>,
        child_nodeid: &str,
    ) -> (SessionId, SessionId) {
        let down = Pipe::default();
        let up = Pipe::default();

        let parent_session = parent.session_attach(Box::new(down.clone()));
        let child_session = child.session_attach(Box::new(up.clone()));

        child.upstream_connecting().unwrap();
        child.upstream_established(
            &child_session,
            parent.master_id().expect("parent must know the master"),
            parent.realms(),
        );
        parent.downstream_established(&parent_session, NodeId::from(child_nodeid));

        self.edges.push(Edge {
            pipe: down,
            to: child.clone(),
            to_session: child_session.clone(),
            seen: Arc::default(),
        });
        self.edges.push(Edge {
            pipe: up,
            to: parent.clone(),
            to_session: parent_session.clone(),
            seen: Arc::default(),
        });

        (parent_session, child_session)
    }

    fn pump(&self) {
        loop {
            let mut progressed = false;
            for edge in &self.edges {
                while let Some(frame) = edge.pipe.pop() {
                    edge.seen.lock().push(frame.clone());
                    edge.to.process(&edge.to_session, &frame);
                    progressed = true;
                }
            }

            if !progressed {
                break;
            }
        }
    }
}

fn master(nodeid: &str, realms: &[&str]) -> Arc<Service> {
    let service = Arc::new(Service::new(ServiceOptions {
        handler: Fabric,
        request_timeout: 10,
    }));
    service.set_master(NodeId::from(nodeid), realms.iter().map(|realm| Realm::from(*realm)));
    service
}

fn child(nodeid: &str) -> Arc<Service> {
    let service = Arc::new(Service::new(ServiceOptions {
        handler: Fabric,
        request_timeout: 10,
    }));
    service.set_local_id(NodeId::from(nodeid));
    service
}

fn capture() -> (Arc<Mutex<Vec<ResponseEvent>>>, ResponseCallback) {
    let events: Arc<Mutex<Vec<ResponseEvent>>> = Arc::default();
    let sink = events.clone();

    (events, Box::new(move |event| sink.lock().push(event)))
}

fn reply_of(events: &Arc<Mutex<Vec<ResponseEvent>>>) -> Response {
    let events = events.lock();
    assert_eq!(events.len(), 1, "expected exactly one terminal event");
    match &events[0] {
        ResponseEvent::Reply(response) => response.clone(),
        other => panic!("expected a reply, got {:?}", other),
    }
}

#[derive(Default)]
struct Counter {
    count: AtomicUsize,
    last: Mutex<Option<(String, Option<Value>)>>,
}

impl EventHandler for Counter {
    fn on_broadcast(&self, _service: &Service, event: BroadcastEvent<'_>) {
        self.count.fetch_add(1, Ordering::SeqCst);
        *self.last.lock() = Some((
            event.broadcaster_nodeid().to_string(),
            event.params().cloned(),
        ));
    }
}

struct Ping;

impl ExecuteHandler for Ping {
    fn on_execute(&self, _service: &Service, request: ExecuteRequest<'_>) -> ExecuteOutcome {
        assert_eq!(request.method(), "admin.ping");
        assert_eq!(request.params(), Some(&json!({ "seq": 1 })));
        ExecuteOutcome::Reply(json!({ "pong": true }))
    }
}

struct Echo;

impl ExecuteHandler for Echo {
    fn on_execute(&self, _service: &Service, request: ExecuteRequest<'_>) -> ExecuteOutcome {
        ExecuteOutcome::Reply(request.params().cloned().unwrap_or(Value::Null))
    }
}

struct Parker(Arc<Mutex<Option<ExecuteReply>>>);

impl ExecuteHandler for Parker {
    fn on_execute(&self, _service: &Service, request: ExecuteRequest<'_>) -> ExecuteOutcome {
        *self.0.lock() = Some(request.defer());
        ExecuteOutcome::Deferred
    }
}

fn subscribe_frames(seen: &Arc<Mutex<Vec<String>>>, remove: bool) -> usize {
    seen.lock()
        .iter()
        .filter(|frame| match codec::decode(frame) {
            Ok(Payload::Request(request)) => {
                request.method == "blade.subscribe" && request.param_bool("remove") == remove
            }
            _ => false,
        })
        .count()
}

#[test]
fn publish_then_locate() -> anyhow::Result<()> {
    let m = master("m", &["r"]);
    let c1 = child("c1");
    let c2 = child("c2");

    let mut net = Net::default();
    let (m_to_c1, _) = net.link(&m, &c1, "c1");
    net.link(&m, &c2, "c2");
    net.pump();

    assert_eq!(m.routes().lookup(&NodeId::from("c1")), Some(m_to_c1.clone()));

    let (events, callback) = capture();
    c1.publish("p", "r", Some(callback))?;
    net.pump();

    // every addressing field is echoed verbatim
    let response = reply_of(&events);
    let result = response.result.unwrap();
    assert_eq!(result["protocol"], "p");
    assert_eq!(result["realm"], "r");
    assert_eq!(result["requester-nodeid"], "c1");
    assert_eq!(result["responder-nodeid"], "m");

    let (events, callback) = capture();
    c2.locate("p", "r", Some(callback))?;
    net.pump();

    let response = reply_of(&events);
    let result = response.result.unwrap();
    assert_eq!(result["controllers"], json!(["c1"]));
    assert_eq!(result["requester-nodeid"], "c2");

    // the controller disappears with its session toward the master
    m.session_closed(&m_to_c1);

    let (events, callback) = capture();
    c2.locate("p", "r", Some(callback))?;
    net.pump();

    let response = reply_of(&events);
    assert_eq!(response.result.unwrap()["controllers"], json!([]));

    Ok(())
}

#[test]
fn subscribe_refcounts_at_the_edge() {
    let m = master("m", &["r"]);
    let c1 = child("c1");
    let c2 = child("c2");
    let c3 = child("c3");

    let mut net = Net::default();
    net.link(&m, &c1, "c1");
    let c1_to_m = net.edges[1].seen.clone();
    net.link(&c1, &c2, "c2");
    net.link(&c1, &c3, "c3");
    net.pump();

    let c2_events = Arc::new(Counter::default());
    let c3_events = Arc::new(Counter::default());

    // first downstream interest below c1 climbs exactly once
    c2.subscribe("e", "p", "r", c2_events.clone(), None).unwrap();
    net.pump();
    assert_eq!(subscribe_frames(&c1_to_m, false), 1);

    // a second subscriber and a duplicate add stay local
    c3.subscribe("e", "p", "r", c3_events.clone(), None).unwrap();
    c2.subscribe("e", "p", "r", c2_events.clone(), None).unwrap();
    net.pump();
    assert_eq!(subscribe_frames(&c1_to_m, false), 1);

    // first removal leaves one downstream interest, nothing climbs
    c2.unsubscribe("e", "p", "r", None).unwrap();
    net.pump();
    assert_eq!(subscribe_frames(&c1_to_m, true), 0);

    // the last removal climbs exactly once
    c3.unsubscribe("e", "p", "r", None).unwrap();
    net.pump();
    assert_eq!(subscribe_frames(&c1_to_m, true), 1);

    assert!(m.subscriptions().is_empty());
    assert!(c1.subscriptions().is_empty());
}

#[test]
fn broadcast_reaches_each_subscriber_once() {
    let m = master("m", &["r"]);
    let c1 = child("c1");
    let c2 = child("c2");

    let mut net = Net::default();
    net.link(&m, &c1, "c1");
    net.link(&c1, &c2, "c2");
    net.pump();

    let m_events = Arc::new(Counter::default());
    let c1_events = Arc::new(Counter::default());
    let c2_events = Arc::new(Counter::default());

    c2.subscribe("e", "p", "r", c2_events.clone(), None).unwrap();
    c1.subscribe("e", "p", "r", c1_events.clone(), None).unwrap();
    m.subscribe("e", "p", "r", m_events.clone(), None).unwrap();
    net.pump();

    c1.broadcast(None, "e", "p", "r", Some(&json!({ "seq": 7 }))).unwrap();
    net.pump();

    // every subscriber except the broadcaster hears it exactly once
    assert_eq!(m_events.count.load(Ordering::SeqCst), 1);
    assert_eq!(c2_events.count.load(Ordering::SeqCst), 1);
    assert_eq!(c1_events.count.load(Ordering::SeqCst), 0);

    let (broadcaster, params) = m_events.last.lock().clone().unwrap();
    assert_eq!(broadcaster, "c1");
    assert_eq!(params, Some(json!({ "seq": 7 })));

    // a second broadcast from the master fans out downward only
    m.broadcast(None, "e", "p", "r", None).unwrap();
    net.pump();

    assert_eq!(m_events.count.load(Ordering::SeqCst), 1);
    assert_eq!(c1_events.count.load(Ordering::SeqCst), 1);
    assert_eq!(c2_events.count.load(Ordering::SeqCst), 2);
}

#[test]
fn execute_reaches_the_addressed_node() -> anyhow::Result<()> {
    let m = master("m", &["r"]);
    let c1 = child("c1");
    let c2 = child("c2");

    let mut net = Net::default();
    net.link(&m, &c1, "c1");
    net.link(&c1, &c2, "c2");
    net.pump();

    m.protocolrpc_add("admin.ping", "p", "r", Ping);

    // one hop up
    let (events, callback) = capture();
    c1.execute(
        &NodeId::from("m"),
        "admin.ping",
        "p",
        "r",
        Some(json!({ "seq": 1 })),
        Some(callback),
    )?;
    net.pump();

    let response = reply_of(&events);
    assert_eq!(execute_result(&response), Some(&json!({ "pong": true })));
    assert_eq!(response.result_value("responder-nodeid"), Some(&json!("m")));
    assert_eq!(response.result_value("requester-nodeid"), Some(&json!("c1")));

    // two hops up, relayed through c1 with the original message id
    let (events, callback) = capture();
    c2.execute(
        &NodeId::from("m"),
        "admin.ping",
        "p",
        "r",
        Some(json!({ "seq": 1 })),
        Some(callback),
    )?;
    net.pump();
    assert_eq!(execute_result(&reply_of(&events)), Some(&json!({ "pong": true })));

    // two hops down: the master learned the grandchild's route from the
    // re-announced registrations
    c2.protocolrpc_add("admin.echo", "p", "r", Echo);

    let (events, callback) = capture();
    m.execute(
        &NodeId::from("c2"),
        "admin.echo",
        "p",
        "r",
        Some(json!({ "down": true })),
        Some(callback),
    )?;
    net.pump();
    assert_eq!(execute_result(&reply_of(&events)), Some(&json!({ "down": true })));

    // a method nobody registered is refused by the responder
    let (events, callback) = capture();
    c1.execute(&NodeId::from("m"), "admin.missing", "p", "r", None, Some(callback))?;
    net.pump();

    let response = reply_of(&events);
    let error = response.error.unwrap();
    assert_eq!(error.code, INVALID_PARAMS);
    assert_eq!(error.message, "Unknown params method");

    Ok(())
}

#[test]
fn execute_response_may_be_deferred() {
    let m = master("m", &["r"]);
    let c1 = child("c1");

    let mut net = Net::default();
    net.link(&m, &c1, "c1");
    net.pump();

    let parked: Arc<Mutex<Option<ExecuteReply>>> = Arc::default();
    m.protocolrpc_add("admin.slow", "p", "r", Parker(parked.clone()));

    let (events, callback) = capture();
    c1.execute(&NodeId::from("m"), "admin.slow", "p", "r", None, Some(callback))
        .unwrap();
    net.pump();

    // nothing answered yet
    assert!(events.lock().is_empty());

    let reply = parked.lock().take().unwrap();
    reply.result(&m, json!({ "late": true })).unwrap();
    net.pump();

    let response = reply_of(&events);
    assert_eq!(execute_result(&response), Some(&json!({ "late": true })));
    assert_eq!(response.result_value("requester-nodeid"), Some(&json!("c1")));
}

#[test]
fn misdirected_publish_is_refused() {
    let m = master("m", &["r"]);
    let c1 = child("c1");

    let mut net = Net::default();
    let (_, c1_to_m_session) = net.link(&m, &c1, "c1");
    net.pump();

    // a publish that names the non-master itself as responder is handled
    // locally there and refused
    let frame = codec::encode(&Request::new(
        "77".to_string(),
        "blade.publish",
        Some(json!({
            "protocol": "p",
            "realm": "r",
            "requester-nodeid": "m",
            "responder-nodeid": "c1",
        })),
    ))
    .unwrap();

    c1.process(&c1_to_m_session, &frame);
    net.pump();

    let c1_up = net.edges[1].seen.clone();
    let refusal = c1_up
        .lock()
        .iter()
        .find_map(|frame| match codec::decode(frame) {
            Ok(Payload::Response(response)) if response.id == "77" => Some(response),
            _ => None,
        })
        .expect("c1 must answer the misdirected publish");

    let error = refusal.error.unwrap();
    assert_eq!(error.code, INVALID_PARAMS);
    assert_eq!(error.message, "Invalid params responder-nodeid");
}

#[test]
fn generators_fail_synchronously_without_a_path() {
    let isolated = child("x");

    let (events, callback) = capture();
    assert_eq!(
        isolated.execute(&NodeId::from("m"), "admin.ping", "p", "r", None, Some(callback)),
        Err(Error::Disconnected)
    );
    assert_eq!(isolated.publish("p", "r", None), Err(Error::Disconnected));
    assert_eq!(isolated.locate("p", "r", None), Err(Error::Disconnected));
    assert_eq!(
        isolated.subscribe("e", "p", "r", Arc::new(Counter::default()), None),
        Err(Error::Disconnected)
    );
    assert_eq!(isolated.register(&NodeId::from("n"), false, None), Err(Error::Disconnected));

    // no wire frame was sent and no callback fired
    assert!(events.lock().is_empty());
    assert!(isolated.sessions().is_empty());
}

#[test]
fn route_uniqueness_across_register_and_teardown() {
    let m = master("m", &["r"]);
    let c1 = child("c1");

    let mut net = Net::default();
    let (m_to_c1, _) = net.link(&m, &c1, "c1");
    net.pump();

    // a descendant announced through c1 is routed through c1's session
    c1.register(&NodeId::from("n1"), false, None).unwrap();
    net.pump();

    assert_eq!(m.routes().lookup(&NodeId::from("n1")), Some(m_to_c1.clone()));
    {
        let lock = m.sessions().get(&m_to_c1);
        let session = lock.get_ref().unwrap();
        assert!(session.owns_route(&NodeId::from("n1")));
        assert!(session.owns_route(&NodeId::from("c1")));
    }

    // explicit removal
    c1.register(&NodeId::from("n1"), true, None).unwrap();
    net.pump();
    assert!(!m.routes().contains(&NodeId::from("n1")));
    {
        let lock = m.sessions().get(&m_to_c1);
        assert!(!lock.get_ref().unwrap().owns_route(&NodeId::from("n1")));
    }

    // teardown cleans the whole reverse set
    c1.register(&NodeId::from("n1"), false, None).unwrap();
    net.pump();
    m.session_closed(&m_to_c1);

    assert!(!m.routes().contains(&NodeId::from("n1")));
    assert!(!m.routes().contains(&NodeId::from("c1")));
    assert!(m.routes().is_empty());
}

#[test]
fn upstream_is_a_singleton() {
    let m = master("m", &["r"]);
    let c1 = child("c1");

    let mut net = Net::default();
    net.link(&m, &c1, "c1");
    net.pump();

    assert_eq!(c1.upstream_connecting(), Err(Error::DuplicateOperation));
}

#[test]
fn teardown_cancels_pending_and_shutdown_is_idempotent() {
    let m = master("m", &["r"]);
    let c1 = child("c1");

    let mut net = Net::default();
    let (_, c1_to_m) = net.link(&m, &c1, "c1");
    net.pump();

    // leave a request in flight by not pumping
    let (events, callback) = capture();
    c1.locate("p", "r", Some(callback)).unwrap();

    c1.session_closed(&c1_to_m);
    {
        let events = events.lock();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ResponseEvent::Closed));
    }
    assert!(c1.sessions().is_empty());
    assert!(c1.upstream().session().is_none());

    // shutting the master down twice finds nothing the second time
    m.shutdown();
    m.shutdown();
    assert!(m.sessions().is_empty());
    assert!(m.routes().is_empty());
}

#[test]
fn subscriber_session_teardown_withdraws_interest() {
    let m = master("m", &["r"]);
    let c1 = child("c1");
    let c2 = child("c2");

    let mut net = Net::default();
    net.link(&m, &c1, "c1");
    let (c1_to_c2, _) = net.link(&c1, &c2, "c2");
    net.pump();

    c2.subscribe("e", "p", "r", Arc::new(Counter::default()), None).unwrap();
    net.pump();
    assert!(m.subscriptions().subscribed(
        &blade_server_service::SubscriptionKey::new("e", "p", "r")
    ));

    // c2 goes away without unsubscribing; c1 withdraws the branch
    c1.session_closed(&c1_to_c2);
    net.pump();

    assert!(c1.subscriptions().is_empty());
    assert!(m.subscriptions().is_empty());
}

#[test]
fn forwarding_dead_end_is_answered() {
    let m = master("m", &["r"]);
    let c1 = child("c1");

    let mut net = Net::default();
    let (m_to_c1_session, _) = net.link(&m, &c1, "c1");
    net.pump();

    // the master has no route to the responder and no upstream to climb
    let frame = codec::encode(&Request::new(
        "13".to_string(),
        "blade.execute",
        Some(json!({
            "method": "admin.ping",
            "protocol": "p",
            "realm": "r",
            "requester-nodeid": "c1",
            "responder-nodeid": "ghost",
        })),
    ))
    .unwrap();

    m.process(&m_to_c1_session, &frame);

    let m_down = net.edges[0].seen.clone();
    net.pump();

    let refusal = m_down
        .lock()
        .iter()
        .find_map(|frame| match codec::decode(frame) {
            Ok(Payload::Response(response)) if response.id == "13" => Some(response),
            _ => None,
        })
        .expect("the dead end must be answered");

    let error = refusal.error.unwrap();
    assert_eq!(error.code, INTERNAL_ERROR);
    assert_eq!(error.message, "No route to responder-nodeid");
}

#[test]
fn realm_policy_hook_can_refuse() {
    struct ClosedRealm;

    impl ServiceHandler for ClosedRealm {
        fn authorize_realm(&self, _session: &SessionId, realm: &str) -> bool {
            realm != "forbidden"
        }
    }

    let m = Arc::new(Service::new(ServiceOptions {
        handler: ClosedRealm,
        request_timeout: 10,
    }));
    m.set_master(NodeId::from("m"), [Realm::from("r")]);

    let c1 = child("c1");
    let mut net = Net::default();
    net.link(&m, &c1, "c1");
    net.pump();

    let (events, callback) = capture();
    c1.publish("p", "forbidden", Some(callback)).unwrap();
    net.pump();

    let response = reply_of(&events);
    let error = response.error.unwrap();
    assert_eq!(error.code, INVALID_PARAMS);
    assert_eq!(error.message, "Realm not permitted");

    // the allowed realm still goes through
    let (events, callback) = capture();
    c1.publish("p", "r", Some(callback)).unwrap();
    net.pump();
    assert!(!reply_of(&events).is_error());
}

#[test]
fn malformed_core_requests_are_rejected() {
    let m = master("m", &["r"]);
    let c1 = child("c1");

    let mut net = Net::default();
    let (m_to_c1_session, _) = net.link(&m, &c1, "c1");
    net.pump();

    let m_down = net.edges[0].seen.clone();

    let error_for = |net: &Net, id: &str| -> codec::RpcError {
        net.pump();
        m_down
            .lock()
            .iter()
            .find_map(|frame| match codec::decode(frame) {
                Ok(Payload::Response(response)) if response.id == id => response.error,
                _ => None,
            })
            .expect("request must be answered with an error")
    };

    // no params object at all
    let frame = codec::encode(&Request::new("m1".to_string(), "blade.register", None)).unwrap();
    m.process(&m_to_c1_session, &frame);
    let error = error_for(&net, "m1");
    assert_eq!(error.code, INVALID_PARAMS);
    assert_eq!(error.message, "Missing params object");

    // missing field
    let frame = codec::encode(&Request::new(
        "m2".to_string(),
        "blade.subscribe",
        Some(json!({ "protocol": "p", "realm": "r" })),
    ))
    .unwrap();
    m.process(&m_to_c1_session, &frame);
    let error = error_for(&net, "m2");
    assert_eq!(error.code, INVALID_PARAMS);
    assert_eq!(error.message, "Missing params event");

    // unknown method
    let frame = codec::encode(&Request::new("m3".to_string(), "blade.bogus", None)).unwrap();
    m.process(&m_to_c1_session, &frame);
    let error = error_for(&net, "m3");
    assert_eq!(error.code, codec::METHOD_NOT_FOUND);

    // neither request nor response, but the id is still usable
    m.process(&m_to_c1_session, r#"{"jsonrpc":"2.0","id":"m4"}"#);
    let error = error_for(&net, "m4");
    assert_eq!(error.code, codec::PARSE_ERROR);
}
