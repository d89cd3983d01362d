//! Common types for the PubSub backend.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use jid::Jid;
use minidom::Element;
use serde::{Deserialize, Serialize};

/// Identifier of the root collection node.
pub const ROOT_NODE: &str = "";

/// Opaque option mapping (subscription options, data-form submissions).
pub type Options = BTreeMap<String, String>;

/// Subscription option selecting which notifications a subscription receives.
pub const SUBSCRIPTION_TYPE_OPTION: &str = "pubsub#subscription_type";

/// Kind of a PubSub node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    /// Holds items.
    Leaf,
    /// Holds only subscriptions; receives notifications for its leaves.
    Collection,
}

impl NodeType {
    /// Parse a node type from a string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "leaf" => Some(NodeType::Leaf),
            "collection" => Some(NodeType::Collection),
            _ => None,
        }
    }

    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Leaf => "leaf",
            NodeType::Collection => "collection",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Administrative role of an entity on a node.
///
/// No affiliation is represented as `Option::None` by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Affiliation {
    /// Full control over the node
    Owner,
    /// May publish and retract items
    Publisher,
    /// Banned from the node
    Outcast,
}

impl Affiliation {
    /// Parse an affiliation from a string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "owner" => Some(Affiliation::Owner),
            "publisher" => Some(Affiliation::Publisher),
            "outcast" => Some(Affiliation::Outcast),
            _ => None,
        }
    }

    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Affiliation::Owner => "owner",
            Affiliation::Publisher => "publisher",
            Affiliation::Outcast => "outcast",
        }
    }
}

impl fmt::Display for Affiliation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subscription state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionState {
    /// Awaiting approval
    Pending,
    /// Active subscription
    Subscribed,
}

impl SubscriptionState {
    /// Parse a subscription state from a string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SubscriptionState::Pending),
            "subscribed" => Some(SubscriptionState::Subscribed),
            _ => None,
        }
    }

    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionState::Pending => "pending",
            SubscriptionState::Subscribed => "subscribed",
        }
    }
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A subscriber's relationship to one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Node the subscription belongs to
    pub node_id: String,
    /// Subscriber address, possibly including a resource
    pub subscriber: Jid,
    /// Current state
    pub state: SubscriptionState,
    /// Subscription options
    pub options: Options,
}

impl Subscription {
    /// Create a subscription with no options.
    pub fn new(node_id: impl Into<String>, subscriber: Jid, state: SubscriptionState) -> Self {
        Self {
            node_id: node_id.into(),
            subscriber,
            state,
            options: Options::new(),
        }
    }

    /// Whether this subscription receives item notifications.
    ///
    /// Subscriptions of type `nodes` only track node lifecycle.
    pub fn wants_items(&self) -> bool {
        self.options
            .get(SUBSCRIPTION_TYPE_OPTION)
            .map(|t| t != "nodes")
            .unwrap_or(true)
    }
}

/// An item as submitted by a publisher.
#[derive(Debug, Clone, PartialEq)]
pub struct PubSubItem {
    /// Item ID, generated by the service when absent
    pub id: Option<String>,
    /// Item payload
    pub payload: Option<Element>,
}

impl PubSubItem {
    /// Create a new item.
    pub fn new(id: Option<String>, payload: Option<Element>) -> Self {
        Self { id, payload }
    }
}

/// An item with its identifier assigned, as stored and notified.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    /// Item ID
    pub id: String,
    /// Item payload, stripped when the node does not deliver payloads
    pub payload: Option<Element>,
}

impl Item {
    /// Create a new item.
    pub fn new(id: impl Into<String>, payload: Option<Element>) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }

    /// Copy of this item without its payload.
    pub fn without_payload(&self) -> Self {
        Self {
            id: self.id.clone(),
            payload: None,
        }
    }
}

/// Stored representation of a published item.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredItem {
    /// Item ID
    pub id: String,
    /// Item payload
    pub payload: Option<Element>,
    /// Publisher's address
    pub publisher: Jid,
    /// When the item was (last) published
    pub published_at: DateTime<Utc>,
}

impl StoredItem {
    /// Convert to an [`Item`] for notifications.
    pub fn to_item(&self) -> Item {
        Item {
            id: self.id.clone(),
            payload: self.payload.clone(),
        }
    }
}

/// One row of an affiliations query: an entity's affiliation and/or
/// subscription on a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffiliationEntry {
    /// Node identifier
    pub node_id: String,
    /// Affiliated or subscribed address
    pub jid: Jid,
    /// Affiliation, if any
    pub affiliation: Option<Affiliation>,
    /// Subscription state, if any
    pub subscription: Option<SubscriptionState>,
}

/// Result of a subscribe request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeResult {
    /// Node subscribed to
    pub node_id: String,
    /// Subscriber's affiliation on the node
    pub affiliation: Option<Affiliation>,
    /// Resulting subscription state
    pub state: SubscriptionState,
}

/// Compare two addresses by their bare form.
pub fn same_bare(a: &Jid, b: &Jid) -> bool {
    a.to_bare() == b.to_bare()
}

/// Bare address of an entity as a [`Jid`].
pub fn bare_jid(entity: &Jid) -> Jid {
    Jid::from(entity.to_bare())
}
