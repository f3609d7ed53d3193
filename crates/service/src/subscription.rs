use crate::{ident::SessionId, rpc::EventHandler, session::Table};

use std::sync::Arc;

use ahash::{HashSet, HashSetExt};
use parking_lot::RwLock;

/// One party interested in an event: either this node's own callback or a
/// downstream session that subscribed over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Subscriber {
    Local,
    Session(SessionId),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub protocol: String,
    pub realm: String,
    pub event: String,
}

impl SubscriptionKey {
    pub fn new(event: &str, protocol: &str, realm: &str) -> Self {
        Self {
            protocol: protocol.to_string(),
            realm: realm.to_string(),
            event: event.to_string(),
        }
    }
}

struct SubscriptionRecord {
    subscribers: HashSet<Subscriber>,
    handler: Option<Arc<dyn EventHandler>>,
}

/// The event-propagation tree, maintained at every node.
///
/// Each node stores only its immediate subscribers: its own local callback
/// and/or the downstream sessions through which at least one
/// `blade.subscribe` arrived and has not been countered by a remove.  A
/// record exists iff its subscriber set is non-empty, and the 0 ↔ 1
/// transitions reported by [`subscriber_add`](Subscriptions::subscriber_add)
/// and [`subscriber_remove`](Subscriptions::subscriber_remove) are what
/// gate upstream propagation: at most one upstream subscribe per key per
/// branch, no matter how many leaves below subscribed.
pub struct Subscriptions {
    tree: RwLock<Table<SubscriptionKey, SubscriptionRecord>>,
}

impl Subscriptions {
    pub(crate) fn new() -> Self {
        Self {
            tree: RwLock::new(Table::default()),
        }
    }

    /// Add a subscriber, returning whether this was the first one for the
    /// key (the caller then propagates upstream).
    pub(crate) fn subscriber_add(
        &self,
        key: &SubscriptionKey,
        subscriber: Subscriber,
        handler: Option<Arc<dyn EventHandler>>,
    ) -> bool {
        let mut tree = self.tree.write();
        let created = !tree.contains_key(key);

        let record = tree.entry(key.clone()).or_insert_with(|| SubscriptionRecord {
            subscribers: HashSet::new(),
            handler: None,
        });

        if subscriber == Subscriber::Local {
            record.handler = handler;
        }
        record.subscribers.insert(subscriber);

        created
    }

    /// Remove a subscriber, returning whether the key's last subscriber
    /// went away (the caller then propagates the removal upstream).
    pub(crate) fn subscriber_remove(&self, key: &SubscriptionKey, subscriber: &Subscriber) -> bool {
        let mut tree = self.tree.write();
        let Some(record) = tree.get_mut(key) else {
            return false;
        };

        if !record.subscribers.remove(subscriber) {
            return false;
        }

        if *subscriber == Subscriber::Local {
            record.handler = None;
        }

        if record.subscribers.is_empty() {
            tree.remove(key);
            true
        } else {
            false
        }
    }

    /// Compute the broadcast fanout for a key under the read lock: the
    /// downstream sessions to re-send on (minus the one the broadcast
    /// arrived on) and the local callback, if installed.  Sends happen
    /// after the lock is released.
    pub(crate) fn fanout(
        &self,
        key: &SubscriptionKey,
        exclude: Option<&SessionId>,
    ) -> (Vec<SessionId>, Option<Arc<dyn EventHandler>>) {
        let tree = self.tree.read();
        let Some(record) = tree.get(key) else {
            return (Vec::new(), None);
        };

        let sessions = record
            .subscribers
            .iter()
            .filter_map(|subscriber| match subscriber {
                Subscriber::Session(session) if Some(session) != exclude => Some(session.clone()),
                _ => None,
            })
            .collect();

        (sessions, record.handler.clone())
    }

    /// Whether the local callback is installed for a key.
    pub fn local_subscribed(&self, key: &SubscriptionKey) -> bool {
        self.tree
            .read()
            .get(key)
            .map(|record| record.subscribers.contains(&Subscriber::Local))
            .unwrap_or(false)
    }

    pub fn subscribed(&self, key: &SubscriptionKey) -> bool {
        self.tree.read().contains_key(key)
    }

    /// Remove a torn-down session from every record, returning the keys
    /// whose subscriber set became empty (their removal still has to be
    /// propagated upstream).
    pub(crate) fn purge_session(&self, session: &SessionId) -> Vec<SubscriptionKey> {
        let subscriber = Subscriber::Session(session.clone());
        let mut emptied = Vec::new();

        let mut tree = self.tree.write();
        tree.retain(|key, record| {
            if record.subscribers.remove(&subscriber) && record.subscribers.is_empty() {
                emptied.push(key.clone());
                false
            } else {
                true
            }
        });

        emptied
    }

    pub fn len(&self) -> usize {
        self.tree.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: &str) -> Subscriber {
        Subscriber::Session(SessionId::from(id))
    }

    #[test]
    fn refcount_transitions() {
        let subscriptions = Subscriptions::new();
        let key = SubscriptionKey::new("e", "p", "r");

        // only the first add and the last remove report a transition
        assert!(subscriptions.subscriber_add(&key, session("s1"), None));
        assert!(!subscriptions.subscriber_add(&key, session("s2"), None));
        assert!(!subscriptions.subscriber_add(&key, session("s2"), None));

        assert!(!subscriptions.subscriber_remove(&key, &session("s1")));
        // removing an absent subscriber changes nothing
        assert!(!subscriptions.subscriber_remove(&key, &session("s1")));
        assert!(subscriptions.subscriber_remove(&key, &session("s2")));

        // record is gone once the last subscriber left
        assert!(!subscriptions.subscribed(&key));
        assert!(subscriptions.is_empty());
    }

    #[test]
    fn distinct_keys_are_independent() {
        let subscriptions = Subscriptions::new();
        let first = SubscriptionKey::new("e1", "p", "r");
        let second = SubscriptionKey::new("e2", "p", "r");

        assert!(subscriptions.subscriber_add(&first, session("s1"), None));
        assert!(subscriptions.subscriber_add(&second, session("s1"), None));
        assert!(subscriptions.subscriber_remove(&first, &session("s1")));
        assert!(subscriptions.subscribed(&second));
    }

    #[test]
    fn fanout_excludes_inbound_session() {
        let subscriptions = Subscriptions::new();
        let key = SubscriptionKey::new("e", "p", "r");

        subscriptions.subscriber_add(&key, session("s1"), None);
        subscriptions.subscriber_add(&key, session("s2"), None);

        let inbound = SessionId::from("s1");
        let (mut sessions, handler) = subscriptions.fanout(&key, Some(&inbound));
        sessions.sort();
        assert_eq!(sessions, vec![SessionId::from("s2")]);
        assert!(handler.is_none());

        let (sessions, _) = subscriptions.fanout(&SubscriptionKey::new("x", "p", "r"), None);
        assert!(sessions.is_empty());
    }

    #[test]
    fn purge_reports_emptied_keys() {
        let subscriptions = Subscriptions::new();
        let shared = SubscriptionKey::new("e1", "p", "r");
        let exclusive = SubscriptionKey::new("e2", "p", "r");

        subscriptions.subscriber_add(&shared, session("s1"), None);
        subscriptions.subscriber_add(&shared, session("s2"), None);
        subscriptions.subscriber_add(&exclusive, session("s1"), None);

        let emptied = subscriptions.purge_session(&SessionId::from("s1"));
        assert_eq!(emptied, vec![exclusive.clone()]);
        assert!(subscriptions.subscribed(&shared));
        assert!(!subscriptions.subscribed(&exclusive));
    }
}
