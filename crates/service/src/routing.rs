use crate::{
    ident::{NodeId, SessionId},
    session::Table,
};

use parking_lot::RwLock;

/// Downstream reachability: which session a node id can be reached
/// through.
///
/// Upward routing is the default in a tree and needs no table, so only
/// nodes below this one appear here.  A node id is present iff exactly one
/// session's route set owns it, entries are added on registration or
/// session establishment and removed on explicit de-registration or
/// session teardown.
pub struct RouteTable {
    routes: RwLock<Table<NodeId, SessionId>>,
}

impl RouteTable {
    pub(crate) fn new() -> Self {
        Self {
            routes: RwLock::new(Table::default()),
        }
    }

    pub(crate) fn add(&self, node: NodeId, session: SessionId) -> Option<SessionId> {
        self.routes.write().insert(node, session)
    }

    pub(crate) fn remove(&self, node: &NodeId) -> Option<SessionId> {
        self.routes.write().remove(node)
    }

    /// Remove a route only while it still points at the given session.
    ///
    /// Teardown cleanup runs against the torn-down session's route set, a
    /// node that re-registered through another session in the meantime must
    /// survive.
    pub(crate) fn remove_owned(&self, node: &NodeId, session: &SessionId) -> bool {
        let mut routes = self.routes.write();
        if routes.get(node) == Some(session) {
            routes.remove(node);
            true
        } else {
            false
        }
    }

    pub fn lookup(&self, node: &NodeId) -> Option<SessionId> {
        self.routes.read().get(node).cloned()
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.routes.read().contains_key(node)
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_lookup_remove() {
        let routes = RouteTable::new();
        assert!(routes.is_empty());

        assert!(routes.add(NodeId::from("n"), SessionId::from("s1")).is_none());
        assert_eq!(routes.lookup(&NodeId::from("n")), Some(SessionId::from("s1")));
        assert_eq!(routes.len(), 1);

        // re-registration through another session replaces the route
        assert_eq!(
            routes.add(NodeId::from("n"), SessionId::from("s2")),
            Some(SessionId::from("s1"))
        );
        assert_eq!(routes.lookup(&NodeId::from("n")), Some(SessionId::from("s2")));
        assert_eq!(routes.len(), 1);

        assert_eq!(routes.remove(&NodeId::from("n")), Some(SessionId::from("s2")));
        assert!(routes.lookup(&NodeId::from("n")).is_none());
    }

    #[test]
    fn teardown_does_not_steal_moved_routes() {
        let routes = RouteTable::new();
        routes.add(NodeId::from("n"), SessionId::from("s1"));

        // the node moved to another session before s1's teardown ran
        routes.add(NodeId::from("n"), SessionId::from("s2"));
        assert!(!routes.remove_owned(&NodeId::from("n"), &SessionId::from("s1")));
        assert_eq!(routes.lookup(&NodeId::from("n")), Some(SessionId::from("s2")));

        assert!(routes.remove_owned(&NodeId::from("n"), &SessionId::from("s2")));
        assert!(routes.is_empty());
    }
}
