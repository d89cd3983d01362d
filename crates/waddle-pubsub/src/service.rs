//! PubSub backend service.
//!
//! [`PubSubService`] is the entry point for the protocol and HTTP layers. It
//! resolves the node, checks authorization, performs the mutation through
//! storage and then fans out notifications. Node state is never cached here;
//! every operation re-fetches what it needs.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use dashmap::DashMap;
use futures::future::{join_all, try_join};
use jid::{BareJid, Jid};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::auth::{self, Action};
use crate::config::ServiceConfig;
use crate::metrics;
use crate::node::{NodeConfig, SendLastPublishedItem, NODE_TYPE};
use crate::notify::{
    self, DeleteNotificationHook, Notification, NotificationKind, Notifier, NotifierRegistry,
    PostDeleteAction, PreDeleteHook, PreDeleteRequest,
};
use crate::storage::PubSubStorage;
use crate::types::{
    bare_jid, Affiliation, AffiliationEntry, Item, NodeType, Options, PubSubItem, StoredItem,
    SubscribeResult, Subscription, SubscriptionState,
};
use crate::PubSubError;

/// PubSub namespace, prefix of advertised features.
pub const NS_PUBSUB: &str = "http://jabber.org/protocol/pubsub";

/// Per-node mutex table serializing mutating operations on the same node.
#[derive(Default)]
struct NodeLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl NodeLocks {
    async fn lock(&self, node_id: &str) -> NodeGuard<'_> {
        let lock = self
            .locks
            .entry(node_id.to_string())
            .or_default()
            .clone();

        // Armed before waiting so a cancelled waiter still releases the entry
        let mut guard = NodeGuard {
            locks: &self.locks,
            node_id: node_id.to_string(),
            lock: Some(lock.clone()),
            held: None,
        };
        guard.held = Some(lock.lock_owned().await);
        guard
    }
}

/// Held for the duration of a mutating operation.
///
/// Drops the table entry once nobody else holds or waits on it.
struct NodeGuard<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    node_id: String,
    lock: Option<Arc<Mutex<()>>>,
    held: Option<OwnedMutexGuard<()>>,
}

impl Drop for NodeGuard<'_> {
    fn drop(&mut self) {
        drop(self.held.take());
        drop(self.lock.take());
        self.locks
            .remove_if(&self.node_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// The PubSub backend service.
///
/// Generic over the storage backend; owns its notifier and pre-delete hook
/// registries, so separate instances never share callbacks.
pub struct PubSubService<S: PubSubStorage> {
    storage: Arc<S>,
    config: ServiceConfig,
    notifiers: NotifierRegistry,
    pre_delete_hooks: RwLock<Vec<Arc<dyn PreDeleteHook>>>,
    locks: NodeLocks,
}

impl<S: PubSubStorage> PubSubService<S> {
    /// Create a new service over the given storage.
    pub fn new(storage: Arc<S>, config: ServiceConfig) -> Self {
        Self {
            storage,
            config,
            notifiers: NotifierRegistry::new(),
            pre_delete_hooks: RwLock::new(Vec::new()),
            locks: NodeLocks::default(),
        }
    }

    /// The underlying storage.
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// The service configuration.
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Register a notifier invoked for every notification entry.
    pub fn register_notifier(&self, notifier: Arc<dyn Notifier>) {
        self.notifiers.register(notifier);
    }

    /// Register a hook run before node deletion.
    pub fn register_pre_delete(&self, hook: Arc<dyn PreDeleteHook>) {
        self.pre_delete_hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(hook);
    }

    /// Announce node deletion to subscribers through the registered notifiers.
    pub fn register_delete_notifications(&self) {
        self.register_pre_delete(Arc::new(DeleteNotificationHook::new(
            self.storage.clone(),
            self.notifiers.clone(),
        )));
    }

    /// Features supported by this service, for service discovery.
    pub fn features(&self) -> Vec<String> {
        let mut features = vec![
            "create-nodes",
            "config-node",
            "delete-nodes",
            "last-published",
            "meta-data",
            "modify-affiliations",
            "outcast-affiliation",
            "persistent-items",
            "publish",
            "publisher-affiliation",
            "purge-nodes",
            "retract-items",
            "retrieve-affiliations",
            "retrieve-default",
            "retrieve-items",
            "retrieve-subscriptions",
            "subscribe",
        ];
        if self.config.instant_nodes {
            features.push("instant-nodes");
        }
        if self.config.collections {
            features.push("collections");
        }

        features
            .into_iter()
            .map(|feature| format!("{}#{}", NS_PUBSUB, feature))
            .collect()
    }

    // ------------------------------------------------------------------
    // Nodes
    // ------------------------------------------------------------------

    /// Create a leaf node with default configuration.
    ///
    /// Without an identifier, one is generated. Returns the node identifier.
    pub async fn create_node(
        &self,
        node_id: Option<&str>,
        requestor: &Jid,
    ) -> Result<String, PubSubError> {
        self.create_configured_node(node_id, NodeType::Leaf, &Options::new(), requestor)
            .await
    }

    /// Create a node of the given type, applying `options` on top of the
    /// default configuration.
    #[instrument(skip(self, options), fields(node = ?node_id, requestor = %requestor))]
    pub async fn create_configured_node(
        &self,
        node_id: Option<&str>,
        node_type: NodeType,
        options: &Options,
        requestor: &Jid,
    ) -> Result<String, PubSubError> {
        let mut config = self.get_default_configuration(node_type)?;

        let node_id = match node_id.filter(|id| !id.is_empty()) {
            Some(id) => id.to_string(),
            None if self.config.instant_nodes => generate_id(),
            None => return Err(PubSubError::NoInstantNodes),
        };

        config.apply_options(options)?;

        self.storage
            .create_node(&node_id, &requestor.to_bare(), node_type, &config)
            .await?;

        metrics::record_node_created(node_type.as_str());
        info!(node = %node_id, %node_type, "Created PubSub node");

        Ok(node_id)
    }

    /// Default configuration for new nodes of a type.
    pub fn get_default_configuration(&self, node_type: NodeType) -> Result<NodeConfig, PubSubError> {
        if node_type == NodeType::Collection && !self.config.collections {
            return Err(PubSubError::NoCollections);
        }
        Ok(self.storage.get_default_configuration(node_type))
    }

    /// Current configuration of a node.
    pub async fn get_node_configuration(&self, node_id: &str) -> Result<NodeConfig, PubSubError> {
        self.storage.get_configuration(node_id).await
    }

    /// Change node configuration. Requires owner affiliation.
    #[instrument(skip(self, options), fields(node = %node_id, requestor = %requestor))]
    pub async fn set_node_configuration(
        &self,
        node_id: &str,
        options: &Options,
        requestor: &Jid,
    ) -> Result<(), PubSubError> {
        let _guard = self.locks.lock(node_id).await;

        let node = self.storage.get_node(node_id).await?;
        let affiliation = auth::resolve_affiliation(self.storage.as_ref(), node_id, requestor).await?;
        auth::authorize(Action::Configure, affiliation)?;

        let mut config = node.config;
        config.apply_options(options)?;
        self.storage.set_configuration(node_id, &config).await?;

        debug!("Node configuration updated");
        Ok(())
    }

    /// Type of a node.
    pub async fn get_node_type(&self, node_id: &str) -> Result<NodeType, PubSubError> {
        Ok(self.storage.get_node(node_id).await?.node_type)
    }

    /// Node metadata: configuration options plus `pubsub#node_type`.
    pub async fn get_node_meta_data(&self, node_id: &str) -> Result<Options, PubSubError> {
        let node = self.storage.get_node(node_id).await?;

        let mut meta = node.config.to_options();
        meta.insert(NODE_TYPE.to_string(), node.node_type.to_string());
        Ok(meta)
    }

    /// Identifiers of all nodes.
    pub async fn get_nodes(&self) -> Result<Vec<String>, PubSubError> {
        self.storage.get_node_ids().await
    }

    /// Delete a node. Requires owner affiliation.
    ///
    /// Pre-delete hooks run first and must all succeed; otherwise storage is
    /// left untouched. Their continuations run after the node is gone.
    #[instrument(skip(self), fields(node = %node_id, requestor = %requestor))]
    pub async fn delete_node(
        &self,
        node_id: &str,
        requestor: &Jid,
        redirect_uri: Option<&str>,
    ) -> Result<(), PubSubError> {
        let _guard = self.locks.lock(node_id).await;

        self.storage.get_node(node_id).await?;
        let affiliation = auth::resolve_affiliation(self.storage.as_ref(), node_id, requestor).await?;
        auth::authorize(Action::Delete, affiliation)?;

        let request = PreDeleteRequest {
            node_id: node_id.to_string(),
            redirect_uri: redirect_uri.map(str::to_string),
        };
        let hooks: Vec<Arc<dyn PreDeleteHook>> = self
            .pre_delete_hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        // Every hook settles before the outcome is decided
        let results = join_all(hooks.iter().map(|hook| hook.pre_delete(&request))).await;
        let mut actions: Vec<PostDeleteAction> = Vec::new();
        for result in results {
            match result {
                Ok(collected) => actions.extend(collected),
                Err(e) => {
                    warn!(error = %e, "Pre-delete hook failed, node not deleted");
                    return Err(e);
                }
            }
        }

        self.storage.delete_node(node_id).await?;
        metrics::record_node_deleted();
        info!(continuations = actions.len(), "Deleted PubSub node");

        join_all(actions).await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Items
    // ------------------------------------------------------------------

    /// Publish items to a leaf node. Requires owner or publisher affiliation.
    ///
    /// Returns the item identifiers, including generated ones, in order.
    #[instrument(skip(self, items), fields(node = %node_id, requestor = %requestor, count = items.len()))]
    pub async fn publish(
        &self,
        node_id: &str,
        items: Vec<PubSubItem>,
        requestor: &Jid,
    ) -> Result<Vec<String>, PubSubError> {
        let _guard = self.locks.lock(node_id).await;

        let node = self.storage.get_node(node_id).await?;
        let affiliation = auth::resolve_affiliation(self.storage.as_ref(), node_id, requestor).await?;
        auth::authorize(Action::Publish, affiliation)?;

        if !node.is_leaf() {
            return Err(PubSubError::Unsupported("publish"));
        }

        let persist_items = node.config.persist_items;
        let deliver_payloads = node.config.deliver_payloads;

        if !items.is_empty() && !persist_items && !deliver_payloads {
            return Err(PubSubError::NoPayloadAllowed);
        }
        if items.is_empty() && (persist_items || deliver_payloads) {
            return Err(PubSubError::PayloadExpected);
        }

        let items: Vec<Item> = items
            .into_iter()
            .map(|item| Item {
                id: item
                    .id
                    .filter(|id| !id.is_empty())
                    .unwrap_or_else(generate_id),
                payload: item.payload,
            })
            .collect();
        let item_ids: Vec<String> = items.iter().map(|item| item.id.clone()).collect();

        if persist_items {
            self.storage.store_items(node_id, &items, requestor).await?;
        }
        metrics::record_publish(items.len(), persist_items);
        debug!(items = ?item_ids, persisted = persist_items, "Published items");

        let items = if deliver_payloads {
            items
        } else {
            items.iter().map(Item::without_payload).collect()
        };
        match notify::get_notifications(self.storage.as_ref(), node_id, items).await {
            Ok(notifications) => self.notifiers.dispatch(&notifications),
            Err(e) => warn!(error = %e, "Failed to compute publish notifications"),
        }

        Ok(item_ids)
    }

    /// Retrieve items from a leaf node.
    ///
    /// With `item_ids`, returns those items; otherwise the most recent
    /// `max_items` (all when `None`). Outcasts are refused; collection nodes
    /// hold no items.
    #[instrument(skip(self, item_ids), fields(node = %node_id, requestor = %requestor))]
    pub async fn get_items(
        &self,
        node_id: &str,
        requestor: &Jid,
        max_items: Option<usize>,
        item_ids: &[String],
    ) -> Result<Vec<StoredItem>, PubSubError> {
        let node = self.storage.get_node(node_id).await?;
        let affiliation = auth::resolve_affiliation(self.storage.as_ref(), node_id, requestor).await?;
        if affiliation == Some(Affiliation::Outcast) {
            return Err(PubSubError::Forbidden);
        }

        if !node.is_leaf() {
            return Ok(Vec::new());
        }

        if item_ids.is_empty() {
            self.storage.get_items(node_id, max_items).await
        } else {
            self.storage.get_items_by_id(node_id, item_ids).await
        }
    }

    /// Retract items. Requires owner or publisher affiliation and a
    /// persistent node.
    ///
    /// Returns the identifiers that were actually removed.
    #[instrument(skip(self, item_ids), fields(node = %node_id, requestor = %requestor))]
    pub async fn retract_item(
        &self,
        node_id: &str,
        item_ids: &[String],
        requestor: &Jid,
    ) -> Result<Vec<String>, PubSubError> {
        let _guard = self.locks.lock(node_id).await;

        let node = self.storage.get_node(node_id).await?;
        let affiliation = auth::resolve_affiliation(self.storage.as_ref(), node_id, requestor).await?;
        auth::authorize(Action::Retract, affiliation)?;

        if !node.config.persist_items {
            return Err(PubSubError::NodeNotPersistent);
        }

        let removed = self.storage.remove_items(node_id, item_ids).await?;
        debug!(removed = ?removed, "Retracted items");

        if !removed.is_empty() && node.config.notify_retract {
            let kind = NotificationKind::Retract(removed.clone().into());
            self.notify_targets(node_id, kind).await;
        }

        Ok(removed)
    }

    /// Remove all items from a node. Requires owner affiliation and a
    /// persistent node.
    #[instrument(skip(self), fields(node = %node_id, requestor = %requestor))]
    pub async fn purge_node(&self, node_id: &str, requestor: &Jid) -> Result<(), PubSubError> {
        let _guard = self.locks.lock(node_id).await;

        let node = self.storage.get_node(node_id).await?;
        let affiliation = auth::resolve_affiliation(self.storage.as_ref(), node_id, requestor).await?;
        auth::authorize(Action::Purge, affiliation)?;

        if !node.config.persist_items {
            return Err(PubSubError::NodeNotPersistent);
        }

        self.storage.purge(node_id).await?;
        debug!("Purged node");

        self.notify_targets(node_id, NotificationKind::Purge).await;
        Ok(())
    }

    /// Compute the fan-out for a batch of items published to a node.
    pub async fn get_notifications(
        &self,
        node_id: &str,
        items: Vec<Item>,
    ) -> Result<Vec<Notification>, PubSubError> {
        notify::get_notifications(self.storage.as_ref(), node_id, items).await
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Subscribe `subscriber` to a node on behalf of `requestor`.
    ///
    /// Subscribing again returns the existing subscription state. When the
    /// node sends its last item on subscription, that item goes to this
    /// subscriber only.
    #[instrument(skip(self), fields(node = %node_id, subscriber = %subscriber, requestor = %requestor))]
    pub async fn subscribe(
        &self,
        node_id: &str,
        subscriber: &Jid,
        requestor: &Jid,
    ) -> Result<SubscribeResult, PubSubError> {
        auth::check_subscriber(requestor, subscriber)?;

        let _guard = self.locks.lock(node_id).await;

        let node = self.storage.get_node(node_id).await?;
        let affiliation =
            auth::resolve_affiliation(self.storage.as_ref(), node_id, subscriber).await?;
        auth::check_not_outcast(affiliation)?;

        let subscription = match self
            .storage
            .add_subscription(node_id, subscriber, SubscriptionState::Subscribed, &Options::new())
            .await
        {
            Ok(()) => {
                debug!("Subscription added");
                Subscription::new(node_id, subscriber.clone(), SubscriptionState::Subscribed)
            }
            Err(PubSubError::SubscriptionExists) => self
                .storage
                .get_subscription(node_id, subscriber)
                .await?
                .ok_or_else(|| PubSubError::internal("subscription vanished after conflict"))?,
            Err(e) => return Err(e),
        };
        let state = subscription.state;

        if state == SubscriptionState::Subscribed
            && node.is_leaf()
            && node.config.send_last_published_item == SendLastPublishedItem::OnSub
        {
            self.send_last_published(node_id, node.config.deliver_payloads, subscription)
                .await;
        }

        Ok(SubscribeResult {
            node_id: node_id.to_string(),
            affiliation,
            state,
        })
    }

    /// Remove the subscription of `subscriber` on behalf of `requestor`.
    #[instrument(skip(self), fields(node = %node_id, subscriber = %subscriber, requestor = %requestor))]
    pub async fn unsubscribe(
        &self,
        node_id: &str,
        subscriber: &Jid,
        requestor: &Jid,
    ) -> Result<(), PubSubError> {
        auth::check_subscriber(requestor, subscriber)?;

        let _guard = self.locks.lock(node_id).await;
        self.storage.remove_subscription(node_id, subscriber).await?;

        debug!("Subscription removed");
        Ok(())
    }

    /// Addresses subscribed to a node.
    pub async fn get_subscribers(&self, node_id: &str) -> Result<Vec<Jid>, PubSubError> {
        self.storage.get_subscribers(node_id).await
    }

    /// All subscriptions held by an entity, across resources.
    pub async fn get_subscriptions(&self, entity: &Jid) -> Result<Vec<Subscription>, PubSubError> {
        self.storage.get_subscriptions(entity).await
    }

    // ------------------------------------------------------------------
    // Affiliations
    // ------------------------------------------------------------------

    /// Affiliations and subscriptions of an entity, merged per
    /// (node, address).
    #[instrument(skip(self), fields(entity = %entity))]
    pub async fn get_affiliations(
        &self,
        entity: &Jid,
    ) -> Result<Vec<AffiliationEntry>, PubSubError> {
        let (affiliations, subscriptions) = try_join(
            self.storage.get_affiliations(entity),
            self.storage.get_subscriptions(entity),
        )
        .await?;

        let mut entries: Vec<AffiliationEntry> = Vec::new();
        let mut index: HashMap<(String, Jid), usize> = HashMap::new();
        let bare = bare_jid(entity);

        for (node_id, affiliation) in affiliations {
            index.insert((node_id.clone(), bare.clone()), entries.len());
            entries.push(AffiliationEntry {
                node_id,
                jid: bare.clone(),
                affiliation: Some(affiliation),
                subscription: None,
            });
        }

        for subscription in subscriptions {
            let key = (subscription.node_id.clone(), subscription.subscriber.clone());
            match index.get(&key) {
                Some(&i) => entries[i].subscription = Some(subscription.state),
                None => {
                    index.insert(key, entries.len());
                    entries.push(AffiliationEntry {
                        node_id: subscription.node_id,
                        jid: subscription.subscriber,
                        affiliation: None,
                        subscription: Some(subscription.state),
                    });
                }
            }
        }

        Ok(entries)
    }

    /// All affiliations on a node. Requires owner affiliation.
    pub async fn get_node_affiliations(
        &self,
        node_id: &str,
        requestor: &Jid,
    ) -> Result<Vec<(BareJid, Affiliation)>, PubSubError> {
        self.storage.get_node(node_id).await?;
        let affiliation = auth::resolve_affiliation(self.storage.as_ref(), node_id, requestor).await?;
        auth::authorize(Action::ModifyAffiliations, affiliation)?;

        self.storage.get_node_affiliations(node_id).await
    }

    /// Set or clear an entity's affiliation. Requires owner affiliation.
    ///
    /// The last owner of a node cannot be removed or demoted.
    #[instrument(skip(self), fields(node = %node_id, entity = %entity, requestor = %requestor))]
    pub async fn set_affiliation(
        &self,
        node_id: &str,
        entity: &BareJid,
        affiliation: Option<Affiliation>,
        requestor: &Jid,
    ) -> Result<(), PubSubError> {
        let _guard = self.locks.lock(node_id).await;

        self.storage.get_node(node_id).await?;
        let requestor_affiliation =
            auth::resolve_affiliation(self.storage.as_ref(), node_id, requestor).await?;
        auth::authorize(Action::ModifyAffiliations, requestor_affiliation)?;

        if affiliation != Some(Affiliation::Owner) {
            let other_owners = self
                .storage
                .get_node_affiliations(node_id)
                .await?
                .into_iter()
                .filter(|(jid, a)| *a == Affiliation::Owner && jid != entity)
                .count();
            if other_owners == 0 {
                return Err(PubSubError::LastOwner);
            }
        }

        self.storage.set_affiliation(node_id, entity, affiliation).await?;
        debug!(?affiliation, "Affiliation updated");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Notification helpers
    // ------------------------------------------------------------------

    /// Notify every target of a node about a non-publish event.
    async fn notify_targets(&self, node_id: &str, kind: NotificationKind) {
        match notify::collect_targets(self.storage.as_ref(), node_id).await {
            Ok(targets) => {
                let notifications: Vec<Notification> = targets
                    .into_iter()
                    .map(|target| target.into_notification(node_id, kind.clone()))
                    .collect();
                self.notifiers.dispatch(&notifications);
            }
            Err(e) => warn!(error = %e, "Failed to compute notifications"),
        }
    }

    /// Send the most recent item of a node to one new subscriber.
    async fn send_last_published(
        &self,
        node_id: &str,
        deliver_payloads: bool,
        subscription: Subscription,
    ) {
        let last = match self.storage.get_items(node_id, Some(1)).await {
            Ok(items) => items,
            Err(e) => {
                warn!(error = %e, "Failed to load last published item");
                return;
            }
        };
        let Some(last) = last.last() else {
            return;
        };

        let item = if deliver_payloads {
            last.to_item()
        } else {
            last.to_item().without_payload()
        };
        let notification = Notification {
            node_id: node_id.to_string(),
            recipient: subscription.subscriber.to_bare(),
            subscriptions: vec![subscription],
            kind: NotificationKind::Items(vec![item].into()),
        };
        self.notifiers.dispatch(&[notification]);
    }
}

/// Generate a unique node or item identifier.
fn generate_id() -> String {
    Uuid::new_v4().to_string()
}
