use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::{Arc, PoisonError, RwLock};

use uuid::Uuid;

use crate::session::Connection;

/// Which connections want messages for which topic.
///
/// A `None` topic is the wildcard: such a connection is returned for every
/// topic. A connection holds at most one subscription per topic.
pub struct SubscriptionManager<K> {
    inner: RwLock<Registry<K>>,
}

struct Registry<K> {
    by_topic: HashMap<K, HashMap<Uuid, Arc<Connection>>>,
    wildcard: HashMap<Uuid, Arc<Connection>>,
    by_connection: HashMap<Uuid, HashSet<Option<K>>>,
}

impl<K> Default for Registry<K> {
    fn default() -> Self {
        Self {
            by_topic: HashMap::new(),
            wildcard: HashMap::new(),
            by_connection: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash + Clone> SubscriptionManager<K> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Registry::default()),
        }
    }

    pub fn subscribe(&self, connection: &Arc<Connection>, topic: Option<K>) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let id = connection.id();
        match &topic {
            Some(key) => {
                inner
                    .by_topic
                    .entry(key.clone())
                    .or_default()
                    .insert(id, connection.clone());
            }
            None => {
                inner.wildcard.insert(id, connection.clone());
            }
        }
        inner.by_connection.entry(id).or_default().insert(topic);
    }

    /// Remove one subscription. No-op if it does not exist.
    pub fn unsubscribe(&self, connection_id: Uuid, topic: Option<&K>) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        match topic {
            Some(key) => {
                if let Some(subscribers) = inner.by_topic.get_mut(key) {
                    subscribers.remove(&connection_id);
                    if subscribers.is_empty() {
                        inner.by_topic.remove(key);
                    }
                }
            }
            None => {
                inner.wildcard.remove(&connection_id);
            }
        }
        if let Some(topics) = inner.by_connection.get_mut(&connection_id) {
            topics.remove(&topic.cloned());
            if topics.is_empty() {
                inner.by_connection.remove(&connection_id);
            }
        }
    }

    /// Connections subscribed to exactly `topic` plus every wildcard
    /// subscriber. For `None` only the wildcard subscribers.
    pub fn get_connections(&self, topic: Option<&K>) -> Vec<Arc<Connection>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut found: HashMap<Uuid, Arc<Connection>> = inner.wildcard.clone();
        if let Some(subscribers) = topic.and_then(|key| inner.by_topic.get(key)) {
            for (id, connection) in subscribers {
                found.entry(*id).or_insert_with(|| connection.clone());
            }
        }
        found.into_values().collect()
    }

    /// Topics `connection_id` is subscribed to.
    pub fn topics(&self, connection_id: Uuid) -> Vec<Option<K>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_connection
            .get(&connection_id)
            .map(|topics| topics.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop every subscription held by `connection_id`.
    pub fn cleanup(&self, connection_id: Uuid) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let Some(topics) = inner.by_connection.remove(&connection_id) else {
            return;
        };
        for topic in topics {
            match topic {
                Some(key) => {
                    if let Some(subscribers) = inner.by_topic.get_mut(&key) {
                        subscribers.remove(&connection_id);
                        if subscribers.is_empty() {
                            inner.by_topic.remove(&key);
                        }
                    }
                }
                None => {
                    inner.wildcard.remove(&connection_id);
                }
            }
        }
    }
}

impl<K: Eq + Hash + Clone> Default for SubscriptionManager<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_connection;

    fn ids(conns: &[Arc<Connection>]) -> HashSet<Uuid> {
        conns.iter().map(|c| c.id()).collect()
    }

    #[test]
    fn duplicate_subscribe_yields_one_entry() {
        let manager = SubscriptionManager::<u32>::new();
        let (c, _rx) = test_connection("/client");
        manager.subscribe(&c, Some(1));
        manager.subscribe(&c, Some(1));
        assert_eq!(manager.get_connections(Some(&1)).len(), 1);
        assert_eq!(manager.topics(c.id()), vec![Some(1)]);
    }

    #[test]
    fn wildcard_is_included_for_every_topic() {
        let manager = SubscriptionManager::<u32>::new();
        let (any, _rx1) = test_connection("/client");
        let (one, _rx2) = test_connection("/client");
        manager.subscribe(&any, None);
        manager.subscribe(&one, Some(1));

        assert_eq!(ids(&manager.get_connections(Some(&1))), HashSet::from([any.id(), one.id()]));
        assert_eq!(ids(&manager.get_connections(Some(&2))), HashSet::from([any.id()]));
        assert_eq!(ids(&manager.get_connections(None)), HashSet::from([any.id()]));
    }

    #[test]
    fn wildcard_and_exact_subscription_are_not_duplicated() {
        let manager = SubscriptionManager::<u32>::new();
        let (c, _rx) = test_connection("/client");
        manager.subscribe(&c, None);
        manager.subscribe(&c, Some(5));
        assert_eq!(manager.get_connections(Some(&5)).len(), 1);
    }

    #[test]
    fn cleanup_removes_every_topic_and_is_idempotent() {
        let manager = SubscriptionManager::<u32>::new();
        let (c, _rx) = test_connection("/client");
        let (other, _rx2) = test_connection("/client");
        for topic in [Some(1), Some(2), None] {
            manager.subscribe(&c, topic);
        }
        manager.subscribe(&other, Some(2));

        manager.cleanup(c.id());
        manager.cleanup(c.id());
        for topic in [1, 2, 3] {
            assert!(!ids(&manager.get_connections(Some(&topic))).contains(&c.id()));
        }
        assert!(manager.get_connections(None).is_empty());
        assert_eq!(ids(&manager.get_connections(Some(&2))), HashSet::from([other.id()]));
        assert!(manager.topics(c.id()).is_empty());
    }

    #[test]
    fn unsubscribe_removes_only_that_topic() {
        let manager = SubscriptionManager::<u32>::new();
        let (c, _rx) = test_connection("/client");
        manager.subscribe(&c, Some(1));
        manager.subscribe(&c, None);

        manager.unsubscribe(c.id(), Some(&1));
        manager.unsubscribe(c.id(), Some(&42));
        assert_eq!(manager.topics(c.id()), vec![None]);
        assert_eq!(manager.get_connections(Some(&1)).len(), 1);

        manager.unsubscribe(c.id(), None);
        assert!(manager.get_connections(Some(&1)).is_empty());
    }

    #[test]
    fn concurrent_mutation_and_reads() {
        let manager = Arc::new(SubscriptionManager::<u32>::new());
        let (c, _rx) = test_connection("/client");
        let writers: Vec<_> = (0..4)
            .map(|n| {
                let manager = manager.clone();
                let c = c.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        manager.subscribe(&c, Some(n * 1000 + i));
                        let _ = manager.get_connections(Some(&(n * 1000 + i)));
                        manager.unsubscribe(c.id(), Some(&(n * 1000 + i)));
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }
        assert!(manager.topics(c.id()).is_empty());
    }
}
