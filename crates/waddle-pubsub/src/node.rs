//! PubSub node configuration.
//!
//! Defines the typed node configuration and its data-form option mapping.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{NodeType, Options};
use crate::PubSubError;

/// Option key: whether items are stored.
pub const PERSIST_ITEMS: &str = "pubsub#persist_items";
/// Option key: whether notifications carry item payloads.
pub const DELIVER_PAYLOADS: &str = "pubsub#deliver_payloads";
/// Option key: when to send the last published item.
pub const SEND_LAST_PUBLISHED_ITEM: &str = "pubsub#send_last_published_item";
/// Option key: maximum number of stored items.
pub const MAX_ITEMS: &str = "pubsub#max_items";
/// Option key: whether retractions are notified.
pub const NOTIFY_RETRACT: &str = "pubsub#notify_retract";
/// Option key: whether node deletion is notified.
pub const NOTIFY_DELETE: &str = "pubsub#notify_delete";
/// Metadata key carrying the node type.
pub const NODE_TYPE: &str = "pubsub#node_type";

const FORM_TYPE: &str = "FORM_TYPE";

/// When to send the last published item to a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendLastPublishedItem {
    /// Never send last item automatically.
    #[default]
    Never,
    /// Send on subscription.
    OnSub,
}

impl SendLastPublishedItem {
    /// Parse from a string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "never" => Some(SendLastPublishedItem::Never),
            "on_sub" => Some(SendLastPublishedItem::OnSub),
            _ => None,
        }
    }
}

impl fmt::Display for SendLastPublishedItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SendLastPublishedItem::Never => "never",
            SendLastPublishedItem::OnSub => "on_sub",
        };
        write!(f, "{}", s)
    }
}

/// Configuration for a PubSub node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Whether to store published items.
    pub persist_items: bool,
    /// Whether to deliver payloads in notifications.
    pub deliver_payloads: bool,
    /// Whether to send last published item on subscription.
    pub send_last_published_item: SendLastPublishedItem,
    /// Maximum number of items to persist (0 = unlimited).
    #[serde(default)]
    pub max_items: u32,
    /// Whether to notify on item retraction.
    #[serde(default = "default_true")]
    pub notify_retract: bool,
    /// Whether to notify on node deletion.
    #[serde(default = "default_true")]
    pub notify_delete: bool,
}

fn default_true() -> bool {
    true
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::leaf_default()
    }
}

impl NodeConfig {
    /// Default configuration for leaf nodes.
    ///
    /// - Persist items: true
    /// - Deliver payloads: true
    /// - Send last published item: on subscription
    pub fn leaf_default() -> Self {
        Self {
            persist_items: true,
            deliver_payloads: true,
            send_last_published_item: SendLastPublishedItem::OnSub,
            max_items: 0,
            notify_retract: true,
            notify_delete: true,
        }
    }

    /// Default configuration for collection nodes.
    pub fn collection_default() -> Self {
        Self {
            persist_items: false,
            deliver_payloads: true,
            send_last_published_item: SendLastPublishedItem::Never,
            max_items: 0,
            notify_retract: true,
            notify_delete: true,
        }
    }

    /// Default configuration for a node type.
    pub fn default_for(node_type: NodeType) -> Self {
        match node_type {
            NodeType::Leaf => Self::leaf_default(),
            NodeType::Collection => Self::collection_default(),
        }
    }

    /// Apply submitted options on top of this configuration.
    ///
    /// Only supplied keys are changed. Every key is validated before any is
    /// applied, so a rejected submission leaves the configuration untouched.
    pub fn apply_options(&mut self, options: &Options) -> Result<(), PubSubError> {
        let mut updated = self.clone();

        for (key, value) in options {
            match key.as_str() {
                FORM_TYPE => {}
                PERSIST_ITEMS => updated.persist_items = parse_bool(key, value)?,
                DELIVER_PAYLOADS => updated.deliver_payloads = parse_bool(key, value)?,
                NOTIFY_RETRACT => updated.notify_retract = parse_bool(key, value)?,
                NOTIFY_DELETE => updated.notify_delete = parse_bool(key, value)?,
                SEND_LAST_PUBLISHED_ITEM => {
                    updated.send_last_published_item = SendLastPublishedItem::from_str(value)
                        .ok_or_else(|| invalid_value(key, value))?;
                }
                MAX_ITEMS => {
                    updated.max_items = value.parse().map_err(|_| invalid_value(key, value))?;
                }
                _ => return Err(PubSubError::InvalidConfigurationOption(key.clone())),
            }
        }

        *self = updated;
        Ok(())
    }

    /// Render this configuration as data-form options.
    pub fn to_options(&self) -> Options {
        let mut options = Options::new();
        options.insert(PERSIST_ITEMS.to_string(), bool_str(self.persist_items));
        options.insert(DELIVER_PAYLOADS.to_string(), bool_str(self.deliver_payloads));
        options.insert(
            SEND_LAST_PUBLISHED_ITEM.to_string(),
            self.send_last_published_item.to_string(),
        );
        options.insert(MAX_ITEMS.to_string(), self.max_items.to_string());
        options.insert(NOTIFY_RETRACT.to_string(), bool_str(self.notify_retract));
        options.insert(NOTIFY_DELETE.to_string(), bool_str(self.notify_delete));
        options
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, PubSubError> {
    match value {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        _ => Err(invalid_value(key, value)),
    }
}

fn invalid_value(key: &str, value: &str) -> PubSubError {
    PubSubError::InvalidConfigurationValue {
        option: key.to_string(),
        value: value.to_string(),
    }
}

fn bool_str(value: bool) -> String {
    let s = if value { "1" } else { "0" };
    s.to_string()
}

/// Snapshot of a node as returned by storage.
///
/// Never cached across operations; services re-fetch on every call.
#[derive(Debug, Clone)]
pub struct Node {
    /// Unique node identifier; the root collection uses the empty string.
    pub node_id: String,
    /// Leaf or collection.
    pub node_type: NodeType,
    /// Node configuration.
    pub config: NodeConfig,
    /// When the node was created.
    pub created_at: DateTime<Utc>,
}

impl Node {
    /// Create a new node snapshot with the given configuration.
    pub fn new(node_id: impl Into<String>, node_type: NodeType, config: NodeConfig) -> Self {
        Self {
            node_id: node_id.into(),
            node_type,
            config,
            created_at: Utc::now(),
        }
    }

    /// Whether this node holds items.
    pub fn is_leaf(&self) -> bool {
        self.node_type == NodeType::Leaf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(pairs: &[(&str, &str)]) -> Options {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_send_last_published_item_parse() {
        assert_eq!(
            SendLastPublishedItem::from_str("never"),
            Some(SendLastPublishedItem::Never)
        );
        assert_eq!(
            SendLastPublishedItem::from_str("on_sub"),
            Some(SendLastPublishedItem::OnSub)
        );
        assert_eq!(SendLastPublishedItem::from_str("always"), None);
    }

    #[test]
    fn test_leaf_default() {
        let config = NodeConfig::leaf_default();
        assert!(config.persist_items);
        assert!(config.deliver_payloads);
        assert_eq!(config.send_last_published_item, SendLastPublishedItem::OnSub);
        assert_eq!(config.max_items, 0);
    }

    #[test]
    fn test_collection_default() {
        let config = NodeConfig::default_for(NodeType::Collection);
        assert!(!config.persist_items);
        assert!(config.deliver_payloads);
    }

    #[test]
    fn test_apply_options_overwrites_only_supplied_keys() {
        let mut config = NodeConfig::leaf_default();
        config
            .apply_options(&options(&[
                ("FORM_TYPE", "http://jabber.org/protocol/pubsub#node_config"),
                (PERSIST_ITEMS, "0"),
                (MAX_ITEMS, "5"),
            ]))
            .expect("valid options");

        assert!(!config.persist_items);
        assert_eq!(config.max_items, 5);
        assert!(config.deliver_payloads);
        assert_eq!(config.send_last_published_item, SendLastPublishedItem::OnSub);
    }

    #[test]
    fn test_apply_options_unknown_key() {
        let mut config = NodeConfig::leaf_default();
        let err = config
            .apply_options(&options(&[("pubsub#title", "News")]))
            .unwrap_err();

        assert!(matches!(err, PubSubError::InvalidConfigurationOption(key) if key == "pubsub#title"));
    }

    #[test]
    fn test_apply_options_is_all_or_nothing() {
        let mut config = NodeConfig::leaf_default();
        let err = config
            .apply_options(&options(&[
                (DELIVER_PAYLOADS, "false"),
                (PERSIST_ITEMS, "sometimes"),
            ]))
            .unwrap_err();

        assert!(matches!(err, PubSubError::InvalidConfigurationValue { .. }));
        assert_eq!(config, NodeConfig::leaf_default());
    }

    #[test]
    fn test_to_options_roundtrips_through_apply() {
        let mut original = NodeConfig::collection_default();
        original.max_items = 3;

        let mut config = NodeConfig::leaf_default();
        config
            .apply_options(&original.to_options())
            .expect("rendered options are valid");
        assert_eq!(config, original);
    }
}
