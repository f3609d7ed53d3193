use crate::Error;

use std::fmt;

use ahash::{HashSet, HashSetExt};
use parking_lot::RwLock;

macro_rules! opaque_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                debug_assert!(!value.is_empty());
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                debug_assert!(!value.is_empty());
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

opaque_id! {
    /// Opaque identifier of a node, globally unique within the fabric.
    NodeId
}

opaque_id! {
    /// Opaque identifier of a session, assigned at attach time and unique
    /// per process lifetime.
    SessionId
}

opaque_id! {
    /// Administrative scope name qualifying a protocol.
    Realm
}

/// The state of the single upstream session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamState {
    None,
    Connecting,
    Up,
    Disconnected,
}

struct Link {
    state: UpstreamState,
    session: Option<SessionId>,
}

/// Process-wide identity plus the upstream session state machine.
///
/// `local_id` is set once during startup and immutable thereafter, the
/// master id is either configured (on the Master itself) or learned during
/// upstream session establishment, and the realm set is append-only.
pub struct Upstream {
    local_id: RwLock<Option<NodeId>>,
    master_id: RwLock<Option<NodeId>>,
    realms: RwLock<HashSet<Realm>>,
    link: RwLock<Link>,
}

impl Upstream {
    pub(crate) fn new() -> Self {
        Self {
            local_id: RwLock::new(None),
            master_id: RwLock::new(None),
            realms: RwLock::new(HashSet::new()),
            link: RwLock::new(Link {
                state: UpstreamState::None,
                session: None,
            }),
        }
    }

    pub fn local_id(&self) -> Option<NodeId> {
        self.local_id.read().clone()
    }

    pub fn master_id(&self) -> Option<NodeId> {
        self.master_id.read().clone()
    }

    pub fn is_local(&self, id: &str) -> bool {
        self.local_id.read().as_ref().map(NodeId::as_str) == Some(id)
    }

    pub fn is_master(&self, id: &str) -> bool {
        self.master_id.read().as_ref().map(NodeId::as_str) == Some(id)
    }

    /// Whether this node is the Master of the fabric.
    pub fn master_local(&self) -> bool {
        match (&*self.local_id.read(), &*self.master_id.read()) {
            (Some(local), Some(master)) => local == master,
            _ => false,
        }
    }

    pub fn realms(&self) -> Vec<Realm> {
        self.realms.read().iter().cloned().collect()
    }

    pub(crate) fn set_local_id(&self, id: NodeId) {
        let mut local_id = self.local_id.write();
        assert!(
            local_id.is_none() || local_id.as_ref() == Some(&id),
            "local node id is immutable once set"
        );

        *local_id = Some(id);
    }

    pub(crate) fn set_master_id(&self, id: NodeId) {
        *self.master_id.write() = Some(id);
    }

    pub(crate) fn realm_add(&self, realm: Realm) {
        self.realms.write().insert(realm);
    }

    pub fn state(&self) -> UpstreamState {
        self.link.read().state
    }

    /// The upstream session, when established.
    pub fn session(&self) -> Option<SessionId> {
        let link = self.link.read();
        match link.state {
            UpstreamState::Up => link.session.clone(),
            _ => None,
        }
    }

    /// Begin upstream establishment.  At most one upstream session may
    /// exist per node, a second attempt while one is connecting or up is
    /// refused synchronously.
    pub fn connecting(&self) -> Result<(), Error> {
        let mut link = self.link.write();
        match link.state {
            UpstreamState::Connecting | UpstreamState::Up => Err(Error::DuplicateOperation),
            UpstreamState::None | UpstreamState::Disconnected => {
                link.state = UpstreamState::Connecting;
                link.session = None;
                Ok(())
            }
        }
    }

    pub(crate) fn connect_failed(&self) {
        let mut link = self.link.write();
        if link.state == UpstreamState::Connecting {
            link.state = UpstreamState::Disconnected;
            link.session = None;
        }
    }

    pub(crate) fn established(&self, session: SessionId) {
        let mut link = self.link.write();
        link.state = UpstreamState::Up;
        link.session = Some(session);
    }

    /// Mark the upstream as lost if `session` was it.  Returns whether the
    /// torn-down session was the upstream.
    pub(crate) fn lost(&self, session: &SessionId) -> bool {
        let mut link = self.link.write();
        if link.session.as_ref() == Some(session) {
            link.state = UpstreamState::Disconnected;
            link.session = None;
            true
        } else {
            false
        }
    }
}
