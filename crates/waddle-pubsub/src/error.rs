//! Error types for the PubSub backend.

use thiserror::Error;

/// Errors raised by the PubSub backend services and storage.
///
/// Every kind is terminal for the request that triggered it; nothing here is
/// retried internally.
#[derive(Debug, Error)]
pub enum PubSubError {
    /// The requested node does not exist.
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// A node with this identifier already exists.
    #[error("Node already exists: {0}")]
    NodeExists(String),

    /// The requestor lacks the affiliation or identity the operation requires.
    #[error("Not authorized")]
    NotAuthorized,

    /// The requestor is banned from the node.
    #[error("Forbidden")]
    Forbidden,

    /// The entity holds no subscription to the node.
    #[error("Not subscribed")]
    NotSubscribed,

    /// The exact (node, subscriber) subscription already exists.
    #[error("Subscription already exists")]
    SubscriptionExists,

    /// The node configuration requires items, but none were published.
    #[error("Payload expected")]
    PayloadExpected,

    /// The node neither persists nor delivers items, but items were published.
    #[error("No payload allowed")]
    NoPayloadAllowed,

    /// Node creation without an identifier is disabled.
    #[error("Instant nodes are not supported")]
    NoInstantNodes,

    /// Collection nodes are disabled for this deployment.
    #[error("Collection nodes are not supported")]
    NoCollections,

    /// The node does not persist items.
    #[error("Node does not persist items")]
    NodeNotPersistent,

    /// An unknown configuration option was supplied.
    #[error("Invalid configuration option: {0}")]
    InvalidConfigurationOption(String),

    /// A configuration option had a value that could not be coerced.
    #[error("Invalid value '{value}' for configuration option {option}")]
    InvalidConfigurationValue {
        /// Option key
        option: String,
        /// Rejected value
        value: String,
    },

    /// The change would leave the node without an owner.
    #[error("Node must keep at least one owner")]
    LastOwner,

    /// The node type does not support the requested feature.
    #[error("Unsupported feature: {0}")]
    Unsupported(&'static str),

    /// Storage backend failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PubSubError {
    /// Create a new storage error.
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a new internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Map this error onto the stanza error the protocol layer should return.
    pub fn condition(&self) -> ErrorCondition {
        use PubSubCondition as P;

        match self {
            Self::NodeNotFound(_) => ErrorCondition::new("item-not-found", "cancel", None),
            Self::NodeExists(_) => ErrorCondition::new("conflict", "cancel", None),
            Self::NotAuthorized => ErrorCondition::new("forbidden", "auth", None),
            Self::Forbidden => ErrorCondition::new("forbidden", "auth", None),
            Self::NotSubscribed => {
                ErrorCondition::new("unexpected-request", "cancel", Some(P::NotSubscribed))
            }
            Self::SubscriptionExists => ErrorCondition::new("conflict", "cancel", None),
            Self::PayloadExpected => {
                ErrorCondition::new("bad-request", "modify", Some(P::PayloadRequired))
            }
            Self::NoPayloadAllowed => {
                ErrorCondition::new("bad-request", "modify", Some(P::ItemForbidden))
            }
            Self::NoInstantNodes => {
                ErrorCondition::new("not-acceptable", "modify", Some(P::NodeIdRequired))
            }
            Self::NoCollections => ErrorCondition::new(
                "feature-not-implemented",
                "cancel",
                Some(P::Unsupported("collections")),
            ),
            Self::NodeNotPersistent => ErrorCondition::new(
                "feature-not-implemented",
                "cancel",
                Some(P::Unsupported("persistent-items")),
            ),
            Self::InvalidConfigurationOption(_) | Self::InvalidConfigurationValue { .. } => {
                ErrorCondition::new("not-acceptable", "modify", None)
            }
            Self::LastOwner => ErrorCondition::new("not-acceptable", "cancel", None),
            Self::Unsupported(feature) => ErrorCondition::new(
                "feature-not-implemented",
                "cancel",
                Some(P::Unsupported(feature)),
            ),
            Self::Storage(_) | Self::Internal(_) => {
                ErrorCondition::new("internal-server-error", "wait", None)
            }
        }
    }
}

/// Stanza error rendering hints for a [`PubSubError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCondition {
    /// RFC 6120 defined condition element name
    pub condition: &'static str,
    /// Error type attribute value
    pub error_type: &'static str,
    /// XEP-0060 application-specific condition, if any
    pub pubsub: Option<PubSubCondition>,
}

impl ErrorCondition {
    fn new(
        condition: &'static str,
        error_type: &'static str,
        pubsub: Option<PubSubCondition>,
    ) -> Self {
        Self {
            condition,
            error_type,
            pubsub,
        }
    }
}

/// Application-specific conditions from the `pubsub#errors` namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PubSubCondition {
    /// `<not-subscribed/>`
    NotSubscribed,
    /// `<payload-required/>`
    PayloadRequired,
    /// `<item-forbidden/>`
    ItemForbidden,
    /// `<nodeid-required/>`
    NodeIdRequired,
    /// `<unsupported feature='...'/>`
    Unsupported(&'static str),
}

impl PubSubCondition {
    /// Element name within the `pubsub#errors` namespace.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotSubscribed => "not-subscribed",
            Self::PayloadRequired => "payload-required",
            Self::ItemForbidden => "item-forbidden",
            Self::NodeIdRequired => "nodeid-required",
            Self::Unsupported(_) => "unsupported",
        }
    }

    /// Value of the `feature` attribute for `unsupported`.
    pub fn feature(&self) -> Option<&'static str> {
        match self {
            Self::Unsupported(feature) => Some(feature),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for PubSubError {
    fn from(e: serde_json::Error) -> Self {
        PubSubError::Storage(format!("Serialization error: {}", e))
    }
}
