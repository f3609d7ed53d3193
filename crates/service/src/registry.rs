use crate::{ident::NodeId, session::Table};

use ahash::{HashSet, HashSetExt};
use parking_lot::RwLock;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct ProtocolKey {
    pub protocol: String,
    pub realm: String,
}

struct ProtocolRecord {
    controllers: HashSet<NodeId>,
}

/// The protocol directory, authoritative only on the Master.
///
/// Maps `(protocol, realm)` to the set of controller node ids that have
/// published themselves for it.  The Master is the only node that must
/// reconcile controller liveness against session liveness: when a session
/// toward the Master is torn down, every node id routed through it is
/// purged from every record.
pub struct ProtocolRegistry {
    protocols: RwLock<Table<ProtocolKey, ProtocolRecord>>,
}

impl ProtocolRegistry {
    pub(crate) fn new() -> Self {
        Self {
            protocols: RwLock::new(Table::default()),
        }
    }

    pub(crate) fn controller_add(&self, protocol: &str, realm: &str, controller: NodeId) {
        self.protocols
            .write()
            .entry(ProtocolKey {
                protocol: protocol.to_string(),
                realm: realm.to_string(),
            })
            .or_insert_with(|| ProtocolRecord {
                controllers: HashSet::new(),
            })
            .controllers
            .insert(controller);
    }

    /// The current controller set.  Iteration order is unspecified.
    pub fn controllers(&self, protocol: &str, realm: &str) -> Vec<NodeId> {
        self.protocols
            .read()
            .get(&ProtocolKey {
                protocol: protocol.to_string(),
                realm: realm.to_string(),
            })
            .map(|record| record.controllers.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop the given node ids from every record, deleting records that
    /// become empty.
    pub(crate) fn purge(&self, nodes: &HashSet<NodeId>) {
        if nodes.is_empty() {
            return;
        }

        let mut protocols = self.protocols.write();
        protocols.retain(|_, record| {
            record.controllers.retain(|controller| !nodes.contains(controller));
            !record.controllers.is_empty()
        });
    }

    pub fn len(&self) -> usize {
        self.protocols.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.protocols.read().is_empty()
    }
}
