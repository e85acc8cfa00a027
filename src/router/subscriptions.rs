//! Subscription Registry
//!
//! Client -> topic set. Each client's set lives in one DashMap entry, so
//! `remove_client` drops all of a client's subscriptions at once and a
//! concurrent fan-out sees either all of them or none.

use std::collections::{BTreeSet, HashSet};

use dashmap::DashMap;
use tracing::debug;

use super::types::{ClientId, Topic, TopicKind};
use crate::ssh::HostId;

#[derive(Default)]
pub struct SubscriptionRegistry {
    clients: DashMap<ClientId, HashSet<Topic>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a connected client with no subscriptions yet
    pub fn register_client(&self, client_id: &ClientId) {
        self.clients.entry(client_id.clone()).or_default();
    }

    /// Returns false if the client already had this exact subscription or
    /// is not registered (never connected, or already removed)
    pub fn subscribe(&self, client_id: &ClientId, topic: Topic) -> bool {
        let topic = topic.normalized();
        let Some(mut topics) = self.clients.get_mut(client_id) else {
            debug!("Ignoring subscription of unregistered client {}", client_id);
            return false;
        };
        debug!("Client {} subscribed to {}", client_id, topic);
        topics.insert(topic)
    }

    /// Remove exactly this (client, topic) pair
    pub fn unsubscribe(&self, client_id: &ClientId, topic: &Topic) -> bool {
        let topic = topic.clone().normalized();
        let removed = self
            .clients
            .get_mut(client_id)
            .map(|mut topics| topics.remove(&topic))
            .unwrap_or(false);
        if removed {
            debug!("Client {} unsubscribed from {}", client_id, topic);
        }
        removed
    }

    /// Drop a client and all its subscriptions; idempotent
    pub fn remove_client(&self, client_id: &ClientId) -> usize {
        self.clients
            .remove(client_id)
            .map(|(_, topics)| topics.len())
            .unwrap_or(0)
    }

    /// Clients with at least one subscription receiving `event`
    pub fn matching_clients(&self, event: &Topic) -> Vec<ClientId> {
        let mut matched: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|entry| entry.value().iter().any(|t| t.matches(event)))
            .map(|entry| entry.key().clone())
            .collect();
        matched.sort();
        matched
    }

    pub fn subscriptions(&self, client_id: &ClientId) -> Vec<Topic> {
        let mut topics: Vec<Topic> = self
            .clients
            .get(client_id)
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default();
        topics.sort_by(|a, b| a.to_string().cmp(&b.to_string()));
        topics
    }

    /// Every subscription of every client
    pub fn all_topics(&self) -> Vec<Topic> {
        self.clients
            .iter()
            .flat_map(|entry| entry.value().iter().cloned().collect::<Vec<_>>())
            .collect()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Hosts with at least one subscription of `kind`
    pub fn interested_hosts(&self, kind: TopicKind) -> BTreeSet<HostId> {
        self.clients
            .iter()
            .flat_map(|entry| {
                entry
                    .value()
                    .iter()
                    .filter(|t| t.kind == kind)
                    .map(|t| t.host_id)
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(name: &str) -> ClientId {
        name.to_string()
    }

    fn registry_with(names: &[&str]) -> SubscriptionRegistry {
        let registry = SubscriptionRegistry::new();
        for name in names {
            registry.register_client(&client(name));
        }
        registry
    }

    #[test]
    fn test_unsubscribe_removes_only_that_pair() {
        let registry = registry_with(&["a", "b"]);
        let (a, b) = (client("a"), client("b"));
        registry.subscribe(&a, Topic::host_metrics(1));
        registry.subscribe(&a, Topic::host_metrics(2));
        registry.subscribe(&b, Topic::host_metrics(1));

        assert!(registry.unsubscribe(&a, &Topic::host_metrics(1)));
        assert!(!registry.unsubscribe(&a, &Topic::host_metrics(1)));

        assert_eq!(registry.subscriptions(&a), vec![Topic::host_metrics(2)]);
        assert_eq!(registry.matching_clients(&Topic::host_metrics(1)), vec![b.clone()]);
    }

    #[test]
    fn test_matching_respects_host_and_kind() {
        let registry = registry_with(&["a", "b", "c"]);
        let (a, b, c) = (client("a"), client("b"), client("c"));
        registry.subscribe(&a, Topic::host_metrics(1));
        registry.subscribe(&b, Topic::container_metrics(1, None));
        registry.subscribe(&c, Topic::container_metrics(1, Some("web".into())));

        assert_eq!(registry.matching_clients(&Topic::host_metrics(1)), vec![a]);
        assert!(registry.matching_clients(&Topic::host_metrics(2)).is_empty());
        assert_eq!(
            registry.matching_clients(&Topic::container_metrics(1, Some("web".into()))),
            vec![b.clone(), c]
        );
        assert_eq!(
            registry.matching_clients(&Topic::container_metrics(1, Some("db".into()))),
            vec![b]
        );
    }

    #[test]
    fn test_remove_client_is_idempotent() {
        let registry = SubscriptionRegistry::new();
        let a = client("a");
        registry.register_client(&a);
        registry.subscribe(&a, Topic::host_metrics(1));
        registry.subscribe(&a, Topic::terminal(1));
        assert_eq!(registry.client_count(), 1);

        assert_eq!(registry.remove_client(&a), 2);
        assert_eq!(registry.remove_client(&a), 0);
        assert_eq!(registry.client_count(), 0);
        assert!(registry.matching_clients(&Topic::host_metrics(1)).is_empty());
    }

    #[test]
    fn test_duplicate_subscribe() {
        let registry = registry_with(&["a"]);
        let a = client("a");
        assert!(registry.subscribe(&a, Topic::host_metrics(1)));
        assert!(!registry.subscribe(&a, Topic::host_metrics(1)));
        assert_eq!(registry.subscriptions(&a).len(), 1);
    }

    #[test]
    fn test_interest_queries() {
        let registry = registry_with(&["a", "b"]);
        registry.subscribe(&client("a"), Topic::container_metrics(3, None));
        registry.subscribe(&client("b"), Topic::container_metrics(1, Some("web".into())));
        registry.subscribe(&client("b"), Topic::host_metrics(2));

        assert_eq!(
            registry.interested_hosts(TopicKind::ContainerMetrics).into_iter().collect::<Vec<_>>(),
            vec![1, 3]
        );
        assert_eq!(
            registry.interested_hosts(TopicKind::HostMetrics).into_iter().collect::<Vec<_>>(),
            vec![2]
        );
    }

    #[test]
    fn test_subscribe_after_remove_is_ignored() {
        let registry = registry_with(&["a"]);
        assert!(registry.subscribe(&client("a"), Topic::host_metrics(1)));
        registry.remove_client(&client("a"));

        assert!(!registry.subscribe(&client("a"), Topic::host_metrics(1)));
        assert!(!registry.subscribe(&client("ghost"), Topic::terminal(2)));
        assert_eq!(registry.client_count(), 0);
        assert!(registry.matching_clients(&Topic::host_metrics(1)).is_empty());
    }
}
