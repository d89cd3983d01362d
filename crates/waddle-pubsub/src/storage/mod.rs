//! PubSub storage trait.
//!
//! Defines the storage contract the backend services depend on. Two
//! implementations are provided: [`InMemoryPubSubStorage`] for development and
//! tests, and [`LibSqlPubSubStorage`] for persistent deployments. Both must
//! fail identically for every error condition documented here.

use async_trait::async_trait;
use jid::{BareJid, Jid};

use crate::node::{Node, NodeConfig};
use crate::types::{Affiliation, Item, NodeType, Options, StoredItem, Subscription, SubscriptionState};
use crate::PubSubError;

pub mod memory;
pub mod sql;

pub use memory::InMemoryPubSubStorage;
pub use sql::LibSqlPubSubStorage;

/// Storage trait for PubSub nodes, affiliations, subscriptions and items.
///
/// Every per-node method fails with [`PubSubError::NodeNotFound`] when the
/// node does not exist. Item methods fail with
/// [`PubSubError::Unsupported`] on collection nodes.
///
/// Implementations must make each method atomic with respect to the node it
/// touches.
#[async_trait]
pub trait PubSubStorage: Send + Sync + 'static {
    /// Get a node snapshot.
    async fn get_node(&self, node_id: &str) -> Result<Node, PubSubError>;

    /// List all node identifiers.
    async fn get_node_ids(&self) -> Result<Vec<String>, PubSubError>;

    /// Create a node and seed `owner` as its owner.
    ///
    /// Fails with [`PubSubError::NodeExists`] if the identifier is taken.
    /// Identifiers are never generated here.
    async fn create_node(
        &self,
        node_id: &str,
        owner: &BareJid,
        node_type: NodeType,
        config: &NodeConfig,
    ) -> Result<(), PubSubError>;

    /// Delete a node with all of its affiliations, subscriptions and items.
    async fn delete_node(&self, node_id: &str) -> Result<(), PubSubError>;

    /// All affiliations held by the bare form of `entity`.
    async fn get_affiliations(
        &self,
        entity: &Jid,
    ) -> Result<Vec<(String, Affiliation)>, PubSubError>;

    /// All subscriptions whose bare subscriber equals the bare form of
    /// `entity`, regardless of resource.
    async fn get_subscriptions(&self, entity: &Jid) -> Result<Vec<Subscription>, PubSubError>;

    /// Default configuration for new nodes of the given type.
    fn get_default_configuration(&self, node_type: NodeType) -> NodeConfig {
        NodeConfig::default_for(node_type)
    }

    /// Get a node's configuration.
    async fn get_configuration(&self, node_id: &str) -> Result<NodeConfig, PubSubError> {
        Ok(self.get_node(node_id).await?.config)
    }

    /// Replace a node's configuration.
    async fn set_configuration(
        &self,
        node_id: &str,
        config: &NodeConfig,
    ) -> Result<(), PubSubError>;

    /// Affiliation of the bare form of `entity` on a node.
    async fn get_affiliation(
        &self,
        node_id: &str,
        entity: &Jid,
    ) -> Result<Option<Affiliation>, PubSubError>;

    /// All affiliations on a node.
    async fn get_node_affiliations(
        &self,
        node_id: &str,
    ) -> Result<Vec<(BareJid, Affiliation)>, PubSubError>;

    /// Set or clear the affiliation of an entity on a node.
    async fn set_affiliation(
        &self,
        node_id: &str,
        entity: &BareJid,
        affiliation: Option<Affiliation>,
    ) -> Result<(), PubSubError>;

    /// The subscription of this exact subscriber address, if any.
    async fn get_subscription(
        &self,
        node_id: &str,
        subscriber: &Jid,
    ) -> Result<Option<Subscription>, PubSubError>;

    /// Subscriptions on a node, optionally filtered by state.
    async fn get_node_subscriptions(
        &self,
        node_id: &str,
        state: Option<SubscriptionState>,
    ) -> Result<Vec<Subscription>, PubSubError>;

    /// Add a subscription.
    ///
    /// Fails with [`PubSubError::SubscriptionExists`] if the exact subscriber
    /// address is already subscribed.
    async fn add_subscription(
        &self,
        node_id: &str,
        subscriber: &Jid,
        state: SubscriptionState,
        options: &Options,
    ) -> Result<(), PubSubError>;

    /// Remove a subscription.
    ///
    /// Fails with [`PubSubError::NotSubscribed`] if there is none.
    async fn remove_subscription(&self, node_id: &str, subscriber: &Jid)
        -> Result<(), PubSubError>;

    /// Addresses holding a `subscribed` subscription to the node.
    async fn get_subscribers(&self, node_id: &str) -> Result<Vec<Jid>, PubSubError> {
        Ok(self
            .get_node_subscriptions(node_id, Some(SubscriptionState::Subscribed))
            .await?
            .into_iter()
            .map(|s| s.subscriber)
            .collect())
    }

    /// Whether the bare form of `entity` holds any `subscribed` subscription.
    async fn is_subscribed(&self, node_id: &str, entity: &Jid) -> Result<bool, PubSubError> {
        let bare = entity.to_bare();
        Ok(self
            .get_subscribers(node_id)
            .await?
            .iter()
            .any(|s| s.to_bare() == bare))
    }

    /// Store items on a leaf node.
    ///
    /// An existing item with the same ID is replaced and moves to the end of
    /// the publish order. Enforces the node's `max_items` by evicting the
    /// oldest items.
    async fn store_items(
        &self,
        node_id: &str,
        items: &[Item],
        publisher: &Jid,
    ) -> Result<(), PubSubError>;

    /// Remove items by ID, returning the IDs that were actually removed.
    async fn remove_items(
        &self,
        node_id: &str,
        item_ids: &[String],
    ) -> Result<Vec<String>, PubSubError>;

    /// Items in publish order; with `max_items`, only the most recent ones.
    async fn get_items(
        &self,
        node_id: &str,
        max_items: Option<usize>,
    ) -> Result<Vec<StoredItem>, PubSubError>;

    /// Items with the given IDs, in publish order. Unknown IDs are skipped.
    async fn get_items_by_id(
        &self,
        node_id: &str,
        item_ids: &[String],
    ) -> Result<Vec<StoredItem>, PubSubError>;

    /// Remove every item from a leaf node.
    async fn purge(&self, node_id: &str) -> Result<(), PubSubError>;
}
