//! Notification fan-out.
//!
//! Computes which subscribers receive an event on a node and hands the
//! result to every registered [`Notifier`]. Subscribers of the root
//! collection node receive the events of every leaf (one-level hierarchy).
//!
//! Node deletion does not go through [`get_notifications`]; it is announced
//! by pre-delete hooks such as [`DeleteNotificationHook`], which collect
//! subscribers before the node is removed and notify them afterwards.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use futures::future::BoxFuture;
use jid::BareJid;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::metrics;
use crate::storage::PubSubStorage;
use crate::types::{Item, Subscription, SubscriptionState, ROOT_NODE};
use crate::PubSubError;

/// What happened on the node.
#[derive(Debug, Clone, PartialEq)]
pub enum NotificationKind {
    /// Items were published. Payloads are absent if the node does not
    /// deliver them.
    Items(Arc<[Item]>),
    /// Items were retracted.
    Retract(Arc<[String]>),
    /// All items were removed.
    Purge,
    /// The node was deleted, optionally pointing at a successor.
    Delete {
        /// Where subscribers should go instead
        redirect_uri: Option<String>,
    },
}

impl NotificationKind {
    fn label(&self) -> &'static str {
        match self {
            NotificationKind::Items(_) => "items",
            NotificationKind::Retract(_) => "retract",
            NotificationKind::Purge => "purge",
            NotificationKind::Delete { .. } => "delete",
        }
    }
}

/// One notification entry: an event for one subscribed entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Node the event happened on
    pub node_id: String,
    /// Entity to notify
    pub recipient: BareJid,
    /// The recipient's subscriptions that matched, on the node or the root
    pub subscriptions: Vec<Subscription>,
    /// The event
    pub kind: NotificationKind,
}

/// A subscribed entity and the subscriptions that make it one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationTarget {
    /// Entity to notify
    pub recipient: BareJid,
    /// Matching subscriptions
    pub subscriptions: Vec<Subscription>,
}

impl NotificationTarget {
    /// Turn this target into a notification for an event on `node_id`.
    pub fn into_notification(self, node_id: &str, kind: NotificationKind) -> Notification {
        Notification {
            node_id: node_id.to_string(),
            recipient: self.recipient,
            subscriptions: self.subscriptions,
            kind,
        }
    }
}

/// Group subscriptions by bare subscriber, keeping first-seen order.
pub fn group_by_subscriber(subscriptions: Vec<Subscription>) -> Vec<NotificationTarget> {
    let mut index: HashMap<BareJid, usize> = HashMap::new();
    let mut targets: Vec<NotificationTarget> = Vec::new();

    for subscription in subscriptions {
        let recipient = subscription.subscriber.to_bare();
        match index.get(&recipient) {
            Some(&i) => {
                let subs = &mut targets[i].subscriptions;
                if !subs.contains(&subscription) {
                    subs.push(subscription);
                }
            }
            None => {
                index.insert(recipient.clone(), targets.len());
                targets.push(NotificationTarget {
                    recipient,
                    subscriptions: vec![subscription],
                });
            }
        }
    }

    targets
}

/// Collect the entities to notify about item events on a node.
///
/// Gathers `subscribed` subscriptions of the node and, unless the node is
/// the root itself, of the root collection. A missing root node contributes
/// nothing. Subscriptions of type `nodes` are skipped.
pub async fn collect_targets<S: PubSubStorage + ?Sized>(
    storage: &S,
    node_id: &str,
) -> Result<Vec<NotificationTarget>, PubSubError> {
    let node_subscriptions =
        storage.get_node_subscriptions(node_id, Some(SubscriptionState::Subscribed));
    let root_subscriptions = async {
        if node_id == ROOT_NODE {
            return Ok(Vec::new());
        }
        match storage
            .get_node_subscriptions(ROOT_NODE, Some(SubscriptionState::Subscribed))
            .await
        {
            Err(PubSubError::NodeNotFound(_)) => Ok(Vec::new()),
            other => other,
        }
    };

    let (mut subscriptions, root) =
        futures::future::try_join(node_subscriptions, root_subscriptions).await?;
    subscriptions.extend(root);
    subscriptions.retain(Subscription::wants_items);

    Ok(group_by_subscriber(subscriptions))
}

/// Compute the notifications for a batch of published items.
pub async fn get_notifications<S: PubSubStorage + ?Sized>(
    storage: &S,
    node_id: &str,
    items: Vec<Item>,
) -> Result<Vec<Notification>, PubSubError> {
    let items: Arc<[Item]> = items.into();
    let targets = collect_targets(storage, node_id).await?;

    Ok(targets
        .into_iter()
        .map(|target| target.into_notification(node_id, NotificationKind::Items(items.clone())))
        .collect())
}

/// Receives computed notifications.
///
/// Called synchronously once per notification entry; implementations should
/// hand off to a queue or connection rather than do slow work inline. Errors
/// are logged and never reach the operation that triggered them.
pub trait Notifier: Send + Sync {
    /// Deliver one notification.
    fn notify(&self, notification: &Notification) -> anyhow::Result<()>;
}

impl<F> Notifier for F
where
    F: Fn(&Notification) -> anyhow::Result<()> + Send + Sync,
{
    fn notify(&self, notification: &Notification) -> anyhow::Result<()> {
        self(notification)
    }
}

/// Notifier forwarding into a tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotifier {
    /// Create a notifier and the receiving half of its channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, notification: &Notification) -> anyhow::Result<()> {
        self.tx
            .send(notification.clone())
            .map_err(|_| anyhow::anyhow!("notification receiver dropped"))
    }
}

/// Ordered collection of notifiers owned by one service instance.
#[derive(Clone, Default)]
pub struct NotifierRegistry {
    notifiers: Arc<RwLock<Vec<Arc<dyn Notifier>>>>,
}

impl NotifierRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a notifier.
    pub fn register(&self, notifier: Arc<dyn Notifier>) {
        self.notifiers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(notifier);
    }

    /// Number of registered notifiers.
    pub fn len(&self) -> usize {
        self.notifiers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no notifier is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every notifier once per notification entry.
    ///
    /// Failures are logged per notifier and do not stop the fan-out.
    pub fn dispatch(&self, notifications: &[Notification]) {
        if notifications.is_empty() {
            return;
        }

        let notifiers: Vec<Arc<dyn Notifier>> = self
            .notifiers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for notification in notifications {
            let kind = notification.kind.label();
            for notifier in &notifiers {
                match notifier.notify(notification) {
                    Ok(()) => metrics::record_notification(kind),
                    Err(e) => {
                        warn!(
                            node = %notification.node_id,
                            recipient = %notification.recipient,
                            kind,
                            error = %e,
                            "Notifier failed"
                        );
                        metrics::record_notifier_failure(kind);
                    }
                }
            }
        }

        debug!(
            entries = notifications.len(),
            notifiers = notifiers.len(),
            "Dispatched notifications"
        );
    }
}

/// Arguments passed to pre-delete hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreDeleteRequest {
    /// Node about to be deleted
    pub node_id: String,
    /// Successor node subscribers may be pointed at
    pub redirect_uri: Option<String>,
}

/// Work to run once the node has been physically deleted.
pub type PostDeleteAction = BoxFuture<'static, ()>;

/// Hook run before a node is deleted.
///
/// Returns the continuations to run after deletion. A failing hook aborts
/// the deletion before storage is touched.
#[async_trait]
pub trait PreDeleteHook: Send + Sync {
    /// Collect post-deletion work for the node.
    async fn pre_delete(
        &self,
        request: &PreDeleteRequest,
    ) -> Result<Vec<PostDeleteAction>, PubSubError>;
}

/// Pre-delete hook announcing node deletion to the node's subscribers.
pub struct DeleteNotificationHook<S> {
    storage: Arc<S>,
    notifiers: NotifierRegistry,
}

impl<S: PubSubStorage> DeleteNotificationHook<S> {
    /// Create a hook notifying through the given registry.
    pub fn new(storage: Arc<S>, notifiers: NotifierRegistry) -> Self {
        Self { storage, notifiers }
    }
}

#[async_trait]
impl<S: PubSubStorage> PreDeleteHook for DeleteNotificationHook<S> {
    async fn pre_delete(
        &self,
        request: &PreDeleteRequest,
    ) -> Result<Vec<PostDeleteAction>, PubSubError> {
        let node = self.storage.get_node(&request.node_id).await?;
        if !node.config.notify_delete {
            return Ok(Vec::new());
        }

        let subscriptions = self
            .storage
            .get_node_subscriptions(&request.node_id, Some(SubscriptionState::Subscribed))
            .await?;
        if subscriptions.is_empty() {
            return Ok(Vec::new());
        }

        let kind = NotificationKind::Delete {
            redirect_uri: request.redirect_uri.clone(),
        };
        let notifications: Vec<Notification> = group_by_subscriber(subscriptions)
            .into_iter()
            .map(|target| target.into_notification(&request.node_id, kind.clone()))
            .collect();

        let notifiers = self.notifiers.clone();
        let action: PostDeleteAction = Box::pin(async move {
            notifiers.dispatch(&notifications);
        });
        Ok(vec![action])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeConfig;
    use crate::storage::InMemoryPubSubStorage;
    use crate::types::{NodeType, Options, SUBSCRIPTION_TYPE_OPTION};
    use jid::Jid;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn jid(s: &str) -> Jid {
        s.parse().expect("valid jid")
    }

    async fn storage_with_leaf() -> InMemoryPubSubStorage {
        let storage = InMemoryPubSubStorage::new("pubsub.example.com".parse().expect("valid jid"));
        storage
            .create_node(
                "news",
                &"owner@example.com".parse().expect("valid jid"),
                NodeType::Leaf,
                &NodeConfig::leaf_default(),
            )
            .await
            .expect("should succeed");
        storage
    }

    async fn subscribe(storage: &InMemoryPubSubStorage, node_id: &str, subscriber: &str) {
        storage
            .add_subscription(
                node_id,
                &jid(subscriber),
                SubscriptionState::Subscribed,
                &Options::new(),
            )
            .await
            .expect("should succeed");
    }

    #[tokio::test]
    async fn test_leaf_and_root_subscriptions_are_merged() {
        let storage = storage_with_leaf().await;
        subscribe(&storage, "news", "user@example.com/phone").await;
        subscribe(&storage, ROOT_NODE, "user@example.com").await;
        subscribe(&storage, ROOT_NODE, "other@example.com").await;

        let notifications = get_notifications(&storage, "news", vec![Item::new("a", None)])
            .await
            .expect("should succeed");

        assert_eq!(notifications.len(), 2);
        let user = &notifications[0];
        assert_eq!(user.recipient.to_string(), "user@example.com");
        assert_eq!(user.subscriptions.len(), 2);
        assert!(user.subscriptions.iter().any(|s| s.node_id == "news"));
        assert!(user.subscriptions.iter().any(|s| s.node_id == ROOT_NODE));
        assert_eq!(notifications[1].recipient.to_string(), "other@example.com");

        match (&notifications[0].kind, &notifications[1].kind) {
            (NotificationKind::Items(a), NotificationKind::Items(b)) => {
                assert!(Arc::ptr_eq(a, b));
                assert_eq!(a[0].id, "a");
            }
            other => panic!("unexpected kinds: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_pending_and_node_type_subscriptions_skipped() {
        let storage = storage_with_leaf().await;
        storage
            .add_subscription(
                "news",
                &jid("pending@example.com"),
                SubscriptionState::Pending,
                &Options::new(),
            )
            .await
            .expect("should succeed");

        let mut options = Options::new();
        options.insert(SUBSCRIPTION_TYPE_OPTION.to_string(), "nodes".to_string());
        storage
            .add_subscription(
                ROOT_NODE,
                &jid("watcher@example.com"),
                SubscriptionState::Subscribed,
                &options,
            )
            .await
            .expect("should succeed");

        let targets = collect_targets(&storage, "news").await.expect("should succeed");
        assert!(targets.is_empty());
    }

    #[tokio::test]
    async fn test_root_node_not_counted_twice() {
        let storage = storage_with_leaf().await;
        subscribe(&storage, ROOT_NODE, "user@example.com").await;

        let targets = collect_targets(&storage, ROOT_NODE).await.expect("should succeed");
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].subscriptions.len(), 1);
    }

    #[test]
    fn test_dispatch_isolates_failing_notifier() {
        let registry = NotifierRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));

        registry.register(Arc::new(|_: &Notification| -> anyhow::Result<()> {
            anyhow::bail!("connection closed")
        }));
        let counter = calls.clone();
        registry.register(Arc::new(move |_: &Notification| -> anyhow::Result<()> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        let notification = Notification {
            node_id: "news".to_string(),
            recipient: "user@example.com".parse().expect("valid jid"),
            subscriptions: Vec::new(),
            kind: NotificationKind::Purge,
        };
        registry.dispatch(&[notification.clone(), notification]);

        assert_eq!(registry.len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_delete_hook_notifies_after_continuation_runs() {
        let storage = Arc::new(storage_with_leaf().await);
        subscribe(&storage, "news", "user@example.com/phone").await;

        let registry = NotifierRegistry::new();
        let (notifier, mut rx) = ChannelNotifier::new();
        registry.register(Arc::new(notifier));

        let hook = DeleteNotificationHook::new(storage.clone(), registry);
        let request = PreDeleteRequest {
            node_id: "news".to_string(),
            redirect_uri: Some("xmpp:pubsub.example.com?;node=news2".to_string()),
        };
        let actions = hook.pre_delete(&request).await.expect("should succeed");
        assert_eq!(actions.len(), 1);
        assert!(rx.try_recv().is_err());

        futures::future::join_all(actions).await;

        let notification = rx.try_recv().expect("delete notification");
        assert_eq!(notification.recipient.to_string(), "user@example.com");
        assert_eq!(
            notification.kind,
            NotificationKind::Delete {
                redirect_uri: Some("xmpp:pubsub.example.com?;node=news2".to_string())
            }
        );
    }

    #[tokio::test]
    async fn test_delete_hook_respects_notify_delete() {
        let storage = Arc::new(storage_with_leaf().await);
        subscribe(&storage, "news", "user@example.com").await;

        let mut config = NodeConfig::leaf_default();
        config.notify_delete = false;
        storage
            .set_configuration("news", &config)
            .await
            .expect("should succeed");

        let hook = DeleteNotificationHook::new(storage, NotifierRegistry::new());
        let actions = hook
            .pre_delete(&PreDeleteRequest {
                node_id: "news".to_string(),
                redirect_uri: None,
            })
            .await
            .expect("should succeed");
        assert!(actions.is_empty());
    }
}
