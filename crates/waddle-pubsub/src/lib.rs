//! # waddle-pubsub
//!
//! XEP-0060 publish-subscribe backend for Waddle Social.
//!
//! This crate holds the service layer behind a PubSub component: node
//! lifecycle, affiliations, subscriptions, item storage and notification
//! fan-out. Stanza parsing and rendering live in the protocol layer; errors
//! raised here carry a [`PubSubError::condition`] mapping for that layer.
//!
//! ## Architecture
//!
//! - **Service**: [`PubSubService`] checks authorization and drives storage
//! - **Storage**: [`PubSubStorage`] with in-memory and libSQL backends
//! - **Notifications**: computed per bare subscriber, delivered to
//!   registered [`Notifier`]s
//!
//! Nodes form a one-level hierarchy: a root collection node (identifier
//! `""`) whose subscribers receive the events of every leaf.

pub mod auth;
pub mod config;
pub mod metrics;
pub mod node;
pub mod notify;
pub mod service;
pub mod storage;

mod error;
mod types;

pub use config::ServiceConfig;
pub use error::{ErrorCondition, PubSubCondition, PubSubError};
pub use node::{Node, NodeConfig, SendLastPublishedItem};
pub use notify::{
    ChannelNotifier, DeleteNotificationHook, Notification, NotificationKind, Notifier,
    PostDeleteAction, PreDeleteHook, PreDeleteRequest,
};
pub use service::{PubSubService, NS_PUBSUB};
pub use storage::{InMemoryPubSubStorage, LibSqlPubSubStorage, PubSubStorage};
pub use types::*;
