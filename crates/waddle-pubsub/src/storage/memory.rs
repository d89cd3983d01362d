//! In-memory implementation of PubSub storage.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use jid::{BareJid, Jid};

use super::PubSubStorage;
use crate::node::{Node, NodeConfig};
use crate::types::{
    Affiliation, Item, NodeType, Options, StoredItem, Subscription, SubscriptionState, ROOT_NODE,
};
use crate::PubSubError;

/// Everything stored for one node.
#[derive(Debug, Clone)]
struct NodeEntry {
    node: Node,
    affiliations: HashMap<BareJid, Affiliation>,
    /// Kept in subscription order, unique by exact subscriber address.
    subscriptions: Vec<Subscription>,
    /// Kept in publish order, oldest first.
    items: Vec<StoredItem>,
}

impl NodeEntry {
    fn new(node: Node, owner: BareJid) -> Self {
        let mut affiliations = HashMap::new();
        affiliations.insert(owner, Affiliation::Owner);
        Self {
            node,
            affiliations,
            subscriptions: Vec::new(),
            items: Vec::new(),
        }
    }

    fn require_leaf(&self) -> Result<(), PubSubError> {
        if self.node.is_leaf() {
            Ok(())
        } else {
            Err(PubSubError::Unsupported("persistent-items"))
        }
    }
}

/// In-memory implementation of PubSub storage.
///
/// Uses DashMap for thread-safe concurrent access; every operation on a node
/// runs under that node's entry lock. The root collection node is created
/// on construction. Suitable for development and single-node deployments.
pub struct InMemoryPubSubStorage {
    /// Map of node_id -> node state
    nodes: DashMap<String, NodeEntry>,
}

impl InMemoryPubSubStorage {
    /// Create a new in-memory storage with the root collection node owned by
    /// the service address.
    pub fn new(service: BareJid) -> Self {
        let nodes = DashMap::new();
        let root = Node::new(
            ROOT_NODE,
            NodeType::Collection,
            NodeConfig::collection_default(),
        );
        nodes.insert(ROOT_NODE.to_string(), NodeEntry::new(root, service));

        Self { nodes }
    }

    fn entry(&self, node_id: &str) -> Result<RefMut<'_, String, NodeEntry>, PubSubError> {
        self.nodes
            .get_mut(node_id)
            .ok_or_else(|| PubSubError::NodeNotFound(node_id.to_string()))
    }
}

#[async_trait]
impl PubSubStorage for InMemoryPubSubStorage {
    async fn get_node(&self, node_id: &str) -> Result<Node, PubSubError> {
        self.nodes
            .get(node_id)
            .map(|entry| entry.node.clone())
            .ok_or_else(|| PubSubError::NodeNotFound(node_id.to_string()))
    }

    async fn get_node_ids(&self) -> Result<Vec<String>, PubSubError> {
        Ok(self.nodes.iter().map(|entry| entry.key().clone()).collect())
    }

    async fn create_node(
        &self,
        node_id: &str,
        owner: &BareJid,
        node_type: NodeType,
        config: &NodeConfig,
    ) -> Result<(), PubSubError> {
        match self.nodes.entry(node_id.to_string()) {
            Entry::Occupied(_) => Err(PubSubError::NodeExists(node_id.to_string())),
            Entry::Vacant(vacant) => {
                let node = Node::new(node_id, node_type, config.clone());
                vacant.insert(NodeEntry::new(node, owner.clone()));
                Ok(())
            }
        }
    }

    async fn delete_node(&self, node_id: &str) -> Result<(), PubSubError> {
        self.nodes
            .remove(node_id)
            .map(|_| ())
            .ok_or_else(|| PubSubError::NodeNotFound(node_id.to_string()))
    }

    async fn get_affiliations(
        &self,
        entity: &Jid,
    ) -> Result<Vec<(String, Affiliation)>, PubSubError> {
        let bare = entity.to_bare();
        Ok(self
            .nodes
            .iter()
            .filter_map(|entry| {
                entry
                    .affiliations
                    .get(&bare)
                    .map(|affiliation| (entry.key().clone(), *affiliation))
            })
            .collect())
    }

    async fn get_subscriptions(&self, entity: &Jid) -> Result<Vec<Subscription>, PubSubError> {
        let bare = entity.to_bare();
        Ok(self
            .nodes
            .iter()
            .flat_map(|entry| {
                entry
                    .subscriptions
                    .iter()
                    .filter(|s| s.subscriber.to_bare() == bare)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect())
    }

    async fn set_configuration(
        &self,
        node_id: &str,
        config: &NodeConfig,
    ) -> Result<(), PubSubError> {
        let mut entry = self.entry(node_id)?;
        entry.node.config = config.clone();
        Ok(())
    }

    async fn get_affiliation(
        &self,
        node_id: &str,
        entity: &Jid,
    ) -> Result<Option<Affiliation>, PubSubError> {
        let entry = self.entry(node_id)?;
        Ok(entry.affiliations.get(&entity.to_bare()).copied())
    }

    async fn get_node_affiliations(
        &self,
        node_id: &str,
    ) -> Result<Vec<(BareJid, Affiliation)>, PubSubError> {
        let entry = self.entry(node_id)?;
        Ok(entry
            .affiliations
            .iter()
            .map(|(jid, affiliation)| (jid.clone(), *affiliation))
            .collect())
    }

    async fn set_affiliation(
        &self,
        node_id: &str,
        entity: &BareJid,
        affiliation: Option<Affiliation>,
    ) -> Result<(), PubSubError> {
        let mut entry = self.entry(node_id)?;
        match affiliation {
            Some(affiliation) => {
                entry.affiliations.insert(entity.clone(), affiliation);
            }
            None => {
                entry.affiliations.remove(entity);
            }
        }
        Ok(())
    }

    async fn get_subscription(
        &self,
        node_id: &str,
        subscriber: &Jid,
    ) -> Result<Option<Subscription>, PubSubError> {
        let entry = self.entry(node_id)?;
        Ok(entry
            .subscriptions
            .iter()
            .find(|s| &s.subscriber == subscriber)
            .cloned())
    }

    async fn get_node_subscriptions(
        &self,
        node_id: &str,
        state: Option<SubscriptionState>,
    ) -> Result<Vec<Subscription>, PubSubError> {
        let entry = self.entry(node_id)?;
        Ok(entry
            .subscriptions
            .iter()
            .filter(|s| state.map(|state| s.state == state).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn add_subscription(
        &self,
        node_id: &str,
        subscriber: &Jid,
        state: SubscriptionState,
        options: &Options,
    ) -> Result<(), PubSubError> {
        let mut entry = self.entry(node_id)?;
        if entry.subscriptions.iter().any(|s| &s.subscriber == subscriber) {
            return Err(PubSubError::SubscriptionExists);
        }

        entry.subscriptions.push(Subscription {
            node_id: node_id.to_string(),
            subscriber: subscriber.clone(),
            state,
            options: options.clone(),
        });
        Ok(())
    }

    async fn remove_subscription(
        &self,
        node_id: &str,
        subscriber: &Jid,
    ) -> Result<(), PubSubError> {
        let mut entry = self.entry(node_id)?;
        let position = entry
            .subscriptions
            .iter()
            .position(|s| &s.subscriber == subscriber)
            .ok_or(PubSubError::NotSubscribed)?;

        entry.subscriptions.remove(position);
        Ok(())
    }

    async fn store_items(
        &self,
        node_id: &str,
        items: &[Item],
        publisher: &Jid,
    ) -> Result<(), PubSubError> {
        let mut entry = self.entry(node_id)?;
        entry.require_leaf()?;

        let now = Utc::now();
        for item in items {
            // Republishing an ID replaces the item and moves it to the end
            entry.items.retain(|stored| stored.id != item.id);
            entry.items.push(StoredItem {
                id: item.id.clone(),
                payload: item.payload.clone(),
                publisher: publisher.clone(),
                published_at: now,
            });
        }

        // Enforce max_items limit by dropping the oldest items
        let max_items = entry.node.config.max_items as usize;
        if max_items > 0 && entry.items.len() > max_items {
            let excess = entry.items.len() - max_items;
            entry.items.drain(0..excess);
        }

        Ok(())
    }

    async fn remove_items(
        &self,
        node_id: &str,
        item_ids: &[String],
    ) -> Result<Vec<String>, PubSubError> {
        let mut entry = self.entry(node_id)?;
        entry.require_leaf()?;

        let mut removed = Vec::new();
        for item_id in item_ids {
            if let Some(pos) = entry.items.iter().position(|i| &i.id == item_id) {
                entry.items.remove(pos);
                removed.push(item_id.clone());
            }
        }

        Ok(removed)
    }

    async fn get_items(
        &self,
        node_id: &str,
        max_items: Option<usize>,
    ) -> Result<Vec<StoredItem>, PubSubError> {
        let entry = self.entry(node_id)?;
        entry.require_leaf()?;

        let skip = max_items
            .map(|max| entry.items.len().saturating_sub(max))
            .unwrap_or(0);
        Ok(entry.items[skip..].to_vec())
    }

    async fn get_items_by_id(
        &self,
        node_id: &str,
        item_ids: &[String],
    ) -> Result<Vec<StoredItem>, PubSubError> {
        let entry = self.entry(node_id)?;
        entry.require_leaf()?;

        Ok(entry
            .items
            .iter()
            .filter(|i| item_ids.contains(&i.id))
            .cloned()
            .collect())
    }

    async fn purge(&self, node_id: &str) -> Result<(), PubSubError> {
        let mut entry = self.entry(node_id)?;
        entry.require_leaf()?;

        entry.items.clear();
        Ok(())
    }
}
