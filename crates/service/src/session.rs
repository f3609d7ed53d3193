use crate::{
    Error,
    ident::{NodeId, SessionId},
};

use std::{
    hash::Hash,
    ops::{Deref, DerefMut},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread::{self, sleep},
    time::Duration,
};

use ahash::{HashMap, HashMapExt, HashSet, HashSetExt};
use codec::{Request, Response};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};

/// A table of manager state guarded by a read/write lock.
///
/// Iteration holds a read lock, mutation holds a write lock, and the
/// wrapper gives lock guards map access without re-borrowing ceremony.
pub struct Table<K, V>(HashMap<K, V>);

impl<K, V> Default for Table<K, V> {
    fn default() -> Self {
        Self(HashMap::new())
    }
}

impl<K, V> AsRef<HashMap<K, V>> for Table<K, V> {
    fn as_ref(&self) -> &HashMap<K, V> {
        &self.0
    }
}

impl<K, V> Deref for Table<K, V> {
    type Target = HashMap<K, V>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<K, V> DerefMut for Table<K, V> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Used to lengthen the timing of the release of a readable lock guard and
/// to provide a more convenient way for external access to the lock's
/// internal data.
///
/// A handler holds the guard for its whole body, so a writer (session
/// teardown) waits until every in-flight handler on that session drains.
pub struct ReadLock<'a, 'b, K, R> {
    pub key: &'a K,
    pub lock: RwLockReadGuard<'b, R>,
}

impl<'a, 'b, K, V> ReadLock<'a, 'b, K, Table<K, V>>
where
    K: Eq + Hash,
{
    pub fn get_ref(&self) -> Option<&V> {
        self.lock.get(self.key)
    }
}

/// A specially optimised timer.
///
/// This timer does not stack automatically and needs to be stacked
/// externally and manually.
#[derive(Default)]
pub struct Timer(AtomicU64);

impl Timer {
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn add(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// The outbound half of a session.
///
/// The transport implements this over its per-connection send queue, tests
/// implement it over in-memory queues.  Sending must not block for long,
/// a send failure means the session is going away.
pub trait Outbound: Send + Sync {
    fn send(&self, frame: String) -> Result<(), Error>;
}

/// Terminal outcome of an outstanding request, delivered to the request's
/// callback exactly once.
#[derive(Debug)]
pub enum ResponseEvent {
    /// A correlated response arrived on the session.
    Reply(Response),
    /// The per-request deadline passed without a response.
    Timeout,
    /// The session was torn down with the request still outstanding.
    Closed,
}

pub type ResponseCallback = Box<dyn FnOnce(ResponseEvent) + Send>;

struct Pending {
    callback: ResponseCallback,
    expires: u64,
}

/// One established session toward a parent or child node.
///
/// Owns the outbound sink, the pending-request table correlating message
/// ids to response callbacks, and the set of node ids routed through this
/// session (the inverse of the global route table).
pub struct Session {
    id: SessionId,
    outbound: Box<dyn Outbound>,
    timer: Arc<Timer>,
    request_timeout: u64,
    pending: Mutex<HashMap<String, Pending>>,
    routes: Mutex<HashSet<NodeId>>,
}

impl Session {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Send a request on this session.
    ///
    /// When a callback is supplied it is registered against the request's
    /// message id before the frame leaves, and will be invoked exactly once
    /// with a reply, a timeout, or a teardown notice.
    pub fn send(&self, request: &Request, callback: Option<ResponseCallback>) -> Result<(), Error> {
        let frame = codec::encode(request).map_err(|_| Error::Send)?;

        if let Some(callback) = callback {
            self.pending.lock().insert(
                request.id.clone(),
                Pending {
                    expires: self.timer.get() + self.request_timeout,
                    callback,
                },
            );
        }

        if let Err(e) = self.outbound.send(frame) {
            self.pending.lock().remove(&request.id);
            return Err(e);
        }

        Ok(())
    }

    /// Send a response on this session.
    pub fn respond(&self, response: &Response) -> Result<(), Error> {
        self.outbound
            .send(codec::encode(response).map_err(|_| Error::Send)?)
    }

    /// Take the callback registered for a message id, if any.
    pub(crate) fn complete(&self, id: &str) -> Option<ResponseCallback> {
        self.pending.lock().remove(id).map(|pending| pending.callback)
    }

    pub(crate) fn route_add(&self, node: NodeId) {
        self.routes.lock().insert(node);
    }

    pub(crate) fn route_remove(&self, node: &NodeId) {
        self.routes.lock().remove(node);
    }

    pub fn owns_route(&self, node: &NodeId) -> bool {
        self.routes.lock().contains(node)
    }

    pub(crate) fn take_routes(&self) -> HashSet<NodeId> {
        std::mem::take(&mut self.routes.lock())
    }

    fn collect_expired(&self, now: u64, out: &mut Vec<ResponseCallback>) {
        let mut pending = self.pending.lock();
        let expired = pending
            .iter()
            .filter(|(_, entry)| entry.expires <= now)
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>();

        for id in expired {
            if let Some(entry) = pending.remove(&id) {
                out.push(entry.callback);
            }
        }
    }

    pub(crate) fn cancel_all(&self) -> Vec<ResponseCallback> {
        self.pending
            .lock()
            .drain()
            .map(|(_, pending)| pending.callback)
            .collect()
    }
}

/// Owner of every attached session.
///
/// Lookups return a read guard held for the duration of the caller's work,
/// detaching takes the write lock and therefore waits for all readers to
/// drain before the session is destroyed.
pub struct SessionManager {
    sessions: RwLock<Table<SessionId, Session>>,
    timer: Arc<Timer>,
    counter: AtomicU64,
    request_timeout: u64,
}

impl SessionManager {
    pub(crate) fn new(request_timeout: u64) -> Arc<Self> {
        let this = Arc::new(Self {
            sessions: RwLock::new(Table::default()),
            timer: Arc::new(Timer::default()),
            counter: AtomicU64::new(0),
            request_timeout,
        });

        // This is a background thread that silently advances the request
        // timer and expires requests whose deadline has passed.
        let this_ = Arc::downgrade(&this);
        thread::spawn(move || {
            while let Some(this) = this_.upgrade() {
                this.timer.add();
                this.sweep();

                drop(this);
                sleep(Duration::from_secs(1));
            }
        });

        this
    }

    /// Get the session for an id.
    ///
    /// The recursive read guard lets a handler that is already holding its
    /// own session reach another one (forwarding, broadcast fanout) without
    /// deadlocking against a waiting teardown.
    pub fn get<'a, 'b>(
        &'a self,
        key: &'b SessionId,
    ) -> ReadLock<'b, 'a, SessionId, Table<SessionId, Session>> {
        ReadLock {
            lock: self.sessions.read_recursive(),
            key,
        }
    }

    pub(crate) fn attach(&self, outbound: Box<dyn Outbound>) -> SessionId {
        let id = SessionId::from(format!(
            "{:08x}-{:08x}",
            self.counter.fetch_add(1, Ordering::Relaxed),
            rand::random::<u32>()
        ));

        self.sessions.write().insert(
            id.clone(),
            Session {
                id: id.clone(),
                timer: self.timer.clone(),
                request_timeout: self.request_timeout,
                pending: Mutex::new(HashMap::new()),
                routes: Mutex::new(HashSet::new()),
                outbound,
            },
        );

        id
    }

    pub(crate) fn detach(&self, id: &SessionId) -> Option<Session> {
        self.sessions.write().remove(id)
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    fn sweep(&self) {
        let mut expired = Vec::new();
        {
            let now = self.timer.get();
            let sessions = self.sessions.read();
            for session in sessions.values() {
                session.collect_expired(now, &mut expired);
            }
        }

        // Deadlines fire outside every lock.
        for callback in expired {
            callback(ResponseEvent::Timeout);
        }
    }
}

/// Generate a message id for an outgoing request.
pub(crate) fn message_id() -> String {
    format!(
        "{:08x}-{:04x}-{:08x}",
        rand::random::<u32>(),
        rand::random::<u16>(),
        rand::random::<u32>()
    )
}
