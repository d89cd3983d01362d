//! libSQL implementation of PubSub storage.
//!
//! Nodes, affiliations, subscriptions and items live in four tables. Node
//! configuration and subscription options are stored as JSON. Item publish
//! order follows an autoincrement sequence, so republishing an item ID
//! (`INSERT OR REPLACE`) moves it to the end.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jid::{BareJid, Jid};
use libsql::Connection;
use minidom::Element;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use super::PubSubStorage;
use crate::node::{Node, NodeConfig};
use crate::types::{
    Affiliation, Item, NodeType, Options, StoredItem, Subscription, SubscriptionState, ROOT_NODE,
};
use crate::PubSubError;

impl From<libsql::Error> for PubSubError {
    fn from(e: libsql::Error) -> Self {
        PubSubError::Storage(format!("Database error: {}", e))
    }
}

/// SQL schema for PubSub storage.
pub const PUBSUB_SCHEMA: &str = r#"
-- PubSub nodes (XEP-0060)
CREATE TABLE IF NOT EXISTS pubsub_nodes (
    node_id TEXT PRIMARY KEY,
    -- 'leaf' or 'collection'
    node_type TEXT NOT NULL,
    -- NodeConfig as JSON
    config TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pubsub_affiliations (
    node_id TEXT NOT NULL,
    -- Bare JID
    entity TEXT NOT NULL,
    -- 'owner', 'publisher' or 'outcast'
    affiliation TEXT NOT NULL,
    PRIMARY KEY (node_id, entity)
);

CREATE INDEX IF NOT EXISTS idx_pubsub_affiliations_entity
    ON pubsub_affiliations(entity);

CREATE TABLE IF NOT EXISTS pubsub_subscriptions (
    node_id TEXT NOT NULL,
    -- Full subscriber JID as given
    subscriber TEXT NOT NULL,
    -- Bare form, for entity lookups
    subscriber_bare TEXT NOT NULL,
    -- 'pending' or 'subscribed'
    state TEXT NOT NULL,
    -- Subscription options as JSON
    options TEXT NOT NULL DEFAULT '{}',
    PRIMARY KEY (node_id, subscriber)
);

CREATE INDEX IF NOT EXISTS idx_pubsub_subscriptions_bare
    ON pubsub_subscriptions(subscriber_bare);

CREATE TABLE IF NOT EXISTS pubsub_items (
    -- Publish order
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    node_id TEXT NOT NULL,
    item_id TEXT NOT NULL,
    publisher TEXT NOT NULL,
    -- Payload XML, NULL when published without payload
    payload TEXT,
    published_at TEXT NOT NULL,
    UNIQUE (node_id, item_id)
);

CREATE INDEX IF NOT EXISTS idx_pubsub_items_node_seq
    ON pubsub_items(node_id, seq);
"#;

/// libSQL-based PubSub storage implementation.
///
/// The connection mutex is held for the whole of each operation, and
/// multi-statement mutations run inside a transaction. A transaction left
/// open by a cancelled operation is rolled back by the next caller.
#[derive(Clone)]
pub struct LibSqlPubSubStorage {
    /// Database connection.
    /// For in-memory databases, this must be a persistent connection.
    conn: Arc<Mutex<Connection>>,
    /// Whether the schema has been initialized.
    initialized: Arc<AtomicBool>,
    /// Set between `BEGIN` and its `COMMIT`/`ROLLBACK`.
    in_transaction: Arc<AtomicBool>,
}

impl LibSqlPubSubStorage {
    /// Create a new libSQL PubSub storage with the given connection.
    pub fn new(conn: Connection) -> Self {
        Self::from_shared(Arc::new(Mutex::new(conn)))
    }

    /// Create from an Arc<Mutex<Connection>> (for sharing with other components).
    pub fn from_shared(conn: Arc<Mutex<Connection>>) -> Self {
        Self {
            conn,
            initialized: Arc::new(AtomicBool::new(false)),
            in_transaction: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Initialize the database schema if not already done.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> Result<(), PubSubError> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }

        let conn = self.conn.lock().await;
        conn.execute_batch(PUBSUB_SCHEMA).await?;

        self.initialized.store(true, Ordering::Release);
        debug!("PubSub storage schema initialized");

        Ok(())
    }

    /// Create the root collection node, owned by the service address, if it
    /// does not exist yet.
    pub async fn ensure_root_node(&self, service: &BareJid) -> Result<(), PubSubError> {
        match self
            .create_node(
                ROOT_NODE,
                service,
                NodeType::Collection,
                &NodeConfig::collection_default(),
            )
            .await
        {
            Ok(()) | Err(PubSubError::NodeExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Lock the connection, initializing the schema first.
    async fn connection(&self) -> Result<tokio::sync::MutexGuard<'_, Connection>, PubSubError> {
        self.initialize().await?;
        let conn = self.conn.lock().await;

        if self.in_transaction.load(Ordering::Acquire) {
            warn!("Rolling back PubSub transaction abandoned by a cancelled operation");
            self.rollback(&conn).await;
        }

        Ok(conn)
    }

    async fn begin(&self, conn: &Connection) -> Result<(), PubSubError> {
        conn.execute_batch("BEGIN IMMEDIATE").await?;
        self.in_transaction.store(true, Ordering::Release);
        Ok(())
    }

    async fn finish<T>(
        &self,
        conn: &Connection,
        result: Result<T, PubSubError>,
    ) -> Result<T, PubSubError> {
        match result {
            Ok(value) => match conn.execute_batch("COMMIT").await {
                Ok(_) => {
                    self.in_transaction.store(false, Ordering::Release);
                    Ok(value)
                }
                Err(e) => {
                    self.rollback(conn).await;
                    Err(e.into())
                }
            },
            Err(e) => {
                self.rollback(conn).await;
                Err(e)
            }
        }
    }

    async fn rollback(&self, conn: &Connection) {
        if let Err(e) = conn.execute_batch("ROLLBACK").await {
            warn!(error = %e, "Failed to roll back PubSub transaction");
        }
        self.in_transaction.store(false, Ordering::Release);
    }

    async fn fetch_node(conn: &Connection, node_id: &str) -> Result<Node, PubSubError> {
        let mut rows = conn
            .query(
                "SELECT node_type, config, created_at FROM pubsub_nodes WHERE node_id = ?1",
                [node_id],
            )
            .await?;

        let row = rows
            .next()
            .await?
            .ok_or_else(|| PubSubError::NodeNotFound(node_id.to_string()))?;

        let node_type: String = row.get(0)?;
        let config: String = row.get(1)?;
        let created_at: String = row.get(2)?;

        Ok(Node {
            node_id: node_id.to_string(),
            node_type: NodeType::from_str(&node_type).ok_or_else(|| {
                PubSubError::storage(format!("Invalid node type: {}", node_type))
            })?,
            config: serde_json::from_str(&config)?,
            created_at: parse_timestamp(&created_at)?,
        })
    }

    async fn fetch_leaf(conn: &Connection, node_id: &str) -> Result<Node, PubSubError> {
        let node = Self::fetch_node(conn, node_id).await?;
        if node.is_leaf() {
            Ok(node)
        } else {
            Err(PubSubError::Unsupported("persistent-items"))
        }
    }

    async fn query_items(
        conn: &Connection,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<StoredItem>, PubSubError> {
        let mut rows = conn.query(sql, params).await?;
        let mut items = Vec::new();

        while let Some(row) = rows.next().await? {
            let id: String = row.get(0)?;
            let publisher: String = row.get(1)?;
            let payload: Option<String> = row.get(2)?;
            let published_at: String = row.get(3)?;

            items.push(StoredItem {
                id,
                payload: payload.as_deref().map(parse_payload).transpose()?,
                publisher: parse_jid(&publisher)?,
                published_at: parse_timestamp(&published_at)?,
            });
        }

        Ok(items)
    }

    async fn query_subscriptions(
        conn: &Connection,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<Subscription>, PubSubError> {
        let mut rows = conn.query(sql, params).await?;
        let mut subscriptions = Vec::new();

        while let Some(row) = rows.next().await? {
            let node_id: String = row.get(0)?;
            let subscriber: String = row.get(1)?;
            let state: String = row.get(2)?;
            let options: String = row.get(3)?;

            subscriptions.push(Subscription {
                node_id,
                subscriber: parse_jid(&subscriber)?,
                state: SubscriptionState::from_str(&state).ok_or_else(|| {
                    PubSubError::storage(format!("Invalid subscription state: {}", state))
                })?,
                options: serde_json::from_str::<Options>(&options)?,
            });
        }

        Ok(subscriptions)
    }

    async fn create_node_tx(
        conn: &Connection,
        node_id: &str,
        owner: &BareJid,
        node_type: NodeType,
        config: &NodeConfig,
    ) -> Result<(), PubSubError> {
        let exists = {
            let mut rows = conn
                .query("SELECT 1 FROM pubsub_nodes WHERE node_id = ?1", [node_id])
                .await?;
            rows.next().await?.is_some()
        };
        if exists {
            return Err(PubSubError::NodeExists(node_id.to_string()));
        }

        let config = serde_json::to_string(config)?;
        let created_at = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO pubsub_nodes (node_id, node_type, config, created_at) VALUES (?1, ?2, ?3, ?4)",
            (node_id, node_type.as_str(), config.as_str(), created_at.as_str()),
        )
        .await?;

        let owner = owner.to_string();
        conn.execute(
            "INSERT INTO pubsub_affiliations (node_id, entity, affiliation) VALUES (?1, ?2, ?3)",
            (node_id, owner.as_str(), Affiliation::Owner.as_str()),
        )
        .await?;

        Ok(())
    }

    async fn delete_node_tx(conn: &Connection, node_id: &str) -> Result<(), PubSubError> {
        let deleted = conn
            .execute("DELETE FROM pubsub_nodes WHERE node_id = ?1", [node_id])
            .await?;
        if deleted == 0 {
            return Err(PubSubError::NodeNotFound(node_id.to_string()));
        }

        for table in ["pubsub_affiliations", "pubsub_subscriptions", "pubsub_items"] {
            conn.execute(
                &format!("DELETE FROM {} WHERE node_id = ?1", table),
                [node_id],
            )
            .await?;
        }

        Ok(())
    }

    async fn store_items_tx(
        conn: &Connection,
        node_id: &str,
        items: &[Item],
        publisher: &Jid,
    ) -> Result<(), PubSubError> {
        let node = Self::fetch_leaf(conn, node_id).await?;
        let publisher = publisher.to_string();
        let published_at = Utc::now().to_rfc3339();

        for item in items {
            let payload = item.payload.as_ref().map(String::from);
            conn.execute(
                r#"
                INSERT OR REPLACE INTO pubsub_items (node_id, item_id, publisher, payload, published_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                (
                    node_id,
                    item.id.as_str(),
                    publisher.as_str(),
                    payload.as_deref(),
                    published_at.as_str(),
                ),
            )
            .await?;
        }

        if node.config.max_items > 0 {
            let evicted = conn
                .execute(
                    r#"
                    DELETE FROM pubsub_items
                    WHERE node_id = ?1 AND seq NOT IN (
                        SELECT seq FROM pubsub_items WHERE node_id = ?1
                        ORDER BY seq DESC LIMIT ?2
                    )
                    "#,
                    (node_id, i64::from(node.config.max_items)),
                )
                .await?;
            if evicted > 0 {
                debug!(node = %node_id, evicted, "Evicted items over max_items");
            }
        }

        Ok(())
    }

    async fn remove_items_tx(
        conn: &Connection,
        node_id: &str,
        item_ids: &[String],
    ) -> Result<Vec<String>, PubSubError> {
        Self::fetch_leaf(conn, node_id).await?;

        let mut removed = Vec::new();
        for item_id in item_ids {
            let deleted = conn
                .execute(
                    "DELETE FROM pubsub_items WHERE node_id = ?1 AND item_id = ?2",
                    [node_id, item_id.as_str()],
                )
                .await?;
            if deleted > 0 {
                removed.push(item_id.clone());
            }
        }

        Ok(removed)
    }
}

#[async_trait]
impl PubSubStorage for LibSqlPubSubStorage {
    async fn get_node(&self, node_id: &str) -> Result<Node, PubSubError> {
        let conn = self.connection().await?;
        Self::fetch_node(&conn, node_id).await
    }

    async fn get_node_ids(&self) -> Result<Vec<String>, PubSubError> {
        let conn = self.connection().await?;
        let mut rows = conn
            .query("SELECT node_id FROM pubsub_nodes ORDER BY node_id", ())
            .await?;

        let mut node_ids = Vec::new();
        while let Some(row) = rows.next().await? {
            node_ids.push(row.get::<String>(0)?);
        }
        Ok(node_ids)
    }

    #[instrument(skip(self, config), fields(node = %node_id))]
    async fn create_node(
        &self,
        node_id: &str,
        owner: &BareJid,
        node_type: NodeType,
        config: &NodeConfig,
    ) -> Result<(), PubSubError> {
        let conn = self.connection().await?;
        self.begin(&conn).await?;
        let result = Self::create_node_tx(&conn, node_id, owner, node_type, config).await;
        self.finish(&conn, result).await
    }

    #[instrument(skip(self), fields(node = %node_id))]
    async fn delete_node(&self, node_id: &str) -> Result<(), PubSubError> {
        let conn = self.connection().await?;
        self.begin(&conn).await?;
        let result = Self::delete_node_tx(&conn, node_id).await;
        self.finish(&conn, result).await
    }

    async fn get_affiliations(
        &self,
        entity: &Jid,
    ) -> Result<Vec<(String, Affiliation)>, PubSubError> {
        let conn = self.connection().await?;
        let entity = entity.to_bare().to_string();
        let mut rows = conn
            .query(
                "SELECT node_id, affiliation FROM pubsub_affiliations WHERE entity = ?1 ORDER BY node_id",
                [entity.as_str()],
            )
            .await?;

        let mut affiliations = Vec::new();
        while let Some(row) = rows.next().await? {
            let node_id: String = row.get(0)?;
            let affiliation: String = row.get(1)?;
            affiliations.push((node_id, parse_affiliation(&affiliation)?));
        }
        Ok(affiliations)
    }

    async fn get_subscriptions(&self, entity: &Jid) -> Result<Vec<Subscription>, PubSubError> {
        let conn = self.connection().await?;
        let bare = entity.to_bare().to_string();
        Self::query_subscriptions(
            &conn,
            r#"
            SELECT node_id, subscriber, state, options FROM pubsub_subscriptions
            WHERE subscriber_bare = ?1 ORDER BY rowid
            "#,
            [bare.as_str()],
        )
        .await
    }

    async fn set_configuration(
        &self,
        node_id: &str,
        config: &NodeConfig,
    ) -> Result<(), PubSubError> {
        let conn = self.connection().await?;
        let config = serde_json::to_string(config)?;
        let updated = conn
            .execute(
                "UPDATE pubsub_nodes SET config = ?2 WHERE node_id = ?1",
                [node_id, config.as_str()],
            )
            .await?;

        if updated == 0 {
            return Err(PubSubError::NodeNotFound(node_id.to_string()));
        }
        Ok(())
    }

    async fn get_affiliation(
        &self,
        node_id: &str,
        entity: &Jid,
    ) -> Result<Option<Affiliation>, PubSubError> {
        let conn = self.connection().await?;
        Self::fetch_node(&conn, node_id).await?;

        let entity = entity.to_bare().to_string();
        let mut rows = conn
            .query(
                "SELECT affiliation FROM pubsub_affiliations WHERE node_id = ?1 AND entity = ?2",
                [node_id, entity.as_str()],
            )
            .await?;

        match rows.next().await? {
            Some(row) => {
                let affiliation: String = row.get(0)?;
                Ok(Some(parse_affiliation(&affiliation)?))
            }
            None => Ok(None),
        }
    }

    async fn get_node_affiliations(
        &self,
        node_id: &str,
    ) -> Result<Vec<(BareJid, Affiliation)>, PubSubError> {
        let conn = self.connection().await?;
        Self::fetch_node(&conn, node_id).await?;

        let mut rows = conn
            .query(
                "SELECT entity, affiliation FROM pubsub_affiliations WHERE node_id = ?1",
                [node_id],
            )
            .await?;

        let mut affiliations = Vec::new();
        while let Some(row) = rows.next().await? {
            let entity: String = row.get(0)?;
            let affiliation: String = row.get(1)?;
            let entity: BareJid = entity
                .parse()
                .map_err(|e| PubSubError::storage(format!("Invalid JID {}: {}", entity, e)))?;
            affiliations.push((entity, parse_affiliation(&affiliation)?));
        }
        Ok(affiliations)
    }

    async fn set_affiliation(
        &self,
        node_id: &str,
        entity: &BareJid,
        affiliation: Option<Affiliation>,
    ) -> Result<(), PubSubError> {
        let conn = self.connection().await?;
        Self::fetch_node(&conn, node_id).await?;

        let entity = entity.to_string();
        match affiliation {
            Some(affiliation) => {
                conn.execute(
                    "INSERT OR REPLACE INTO pubsub_affiliations (node_id, entity, affiliation) VALUES (?1, ?2, ?3)",
                    [node_id, entity.as_str(), affiliation.as_str()],
                )
                .await?;
            }
            None => {
                conn.execute(
                    "DELETE FROM pubsub_affiliations WHERE node_id = ?1 AND entity = ?2",
                    [node_id, entity.as_str()],
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn get_subscription(
        &self,
        node_id: &str,
        subscriber: &Jid,
    ) -> Result<Option<Subscription>, PubSubError> {
        let conn = self.connection().await?;
        Self::fetch_node(&conn, node_id).await?;

        let subscriber = subscriber.to_string();
        let mut subscriptions = Self::query_subscriptions(
            &conn,
            r#"
            SELECT node_id, subscriber, state, options FROM pubsub_subscriptions
            WHERE node_id = ?1 AND subscriber = ?2
            "#,
            [node_id, subscriber.as_str()],
        )
        .await?;

        Ok(subscriptions.pop())
    }

    async fn get_node_subscriptions(
        &self,
        node_id: &str,
        state: Option<SubscriptionState>,
    ) -> Result<Vec<Subscription>, PubSubError> {
        let conn = self.connection().await?;
        Self::fetch_node(&conn, node_id).await?;

        match state {
            Some(state) => {
                Self::query_subscriptions(
                    &conn,
                    r#"
                    SELECT node_id, subscriber, state, options FROM pubsub_subscriptions
                    WHERE node_id = ?1 AND state = ?2 ORDER BY rowid
                    "#,
                    [node_id, state.as_str()],
                )
                .await
            }
            None => {
                Self::query_subscriptions(
                    &conn,
                    r#"
                    SELECT node_id, subscriber, state, options FROM pubsub_subscriptions
                    WHERE node_id = ?1 ORDER BY rowid
                    "#,
                    [node_id],
                )
                .await
            }
        }
    }

    async fn add_subscription(
        &self,
        node_id: &str,
        subscriber: &Jid,
        state: SubscriptionState,
        options: &Options,
    ) -> Result<(), PubSubError> {
        let conn = self.connection().await?;
        Self::fetch_node(&conn, node_id).await?;

        let full = subscriber.to_string();
        let bare = subscriber.to_bare().to_string();
        let options = serde_json::to_string(options)?;

        let inserted = conn
            .execute(
                r#"
                INSERT OR IGNORE INTO pubsub_subscriptions (node_id, subscriber, subscriber_bare, state, options)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                [
                    node_id,
                    full.as_str(),
                    bare.as_str(),
                    state.as_str(),
                    options.as_str(),
                ],
            )
            .await?;

        if inserted == 0 {
            return Err(PubSubError::SubscriptionExists);
        }
        Ok(())
    }

    async fn remove_subscription(
        &self,
        node_id: &str,
        subscriber: &Jid,
    ) -> Result<(), PubSubError> {
        let conn = self.connection().await?;
        Self::fetch_node(&conn, node_id).await?;

        let subscriber = subscriber.to_string();
        let deleted = conn
            .execute(
                "DELETE FROM pubsub_subscriptions WHERE node_id = ?1 AND subscriber = ?2",
                [node_id, subscriber.as_str()],
            )
            .await?;

        if deleted == 0 {
            return Err(PubSubError::NotSubscribed);
        }
        Ok(())
    }

    #[instrument(skip(self, items), fields(node = %node_id, count = items.len()))]
    async fn store_items(
        &self,
        node_id: &str,
        items: &[Item],
        publisher: &Jid,
    ) -> Result<(), PubSubError> {
        let conn = self.connection().await?;
        self.begin(&conn).await?;
        let result = Self::store_items_tx(&conn, node_id, items, publisher).await;
        self.finish(&conn, result).await
    }

    async fn remove_items(
        &self,
        node_id: &str,
        item_ids: &[String],
    ) -> Result<Vec<String>, PubSubError> {
        let conn = self.connection().await?;
        self.begin(&conn).await?;
        let result = Self::remove_items_tx(&conn, node_id, item_ids).await;
        self.finish(&conn, result).await
    }

    async fn get_items(
        &self,
        node_id: &str,
        max_items: Option<usize>,
    ) -> Result<Vec<StoredItem>, PubSubError> {
        let conn = self.connection().await?;
        Self::fetch_leaf(&conn, node_id).await?;

        match max_items {
            Some(max) => {
                let max = i64::try_from(max).unwrap_or(i64::MAX);
                Self::query_items(
                    &conn,
                    r#"
                    SELECT item_id, publisher, payload, published_at FROM (
                        SELECT seq, item_id, publisher, payload, published_at FROM pubsub_items
                        WHERE node_id = ?1 ORDER BY seq DESC LIMIT ?2
                    ) ORDER BY seq ASC
                    "#,
                    (node_id, max),
                )
                .await
            }
            None => {
                Self::query_items(
                    &conn,
                    r#"
                    SELECT item_id, publisher, payload, published_at FROM pubsub_items
                    WHERE node_id = ?1 ORDER BY seq ASC
                    "#,
                    [node_id],
                )
                .await
            }
        }
    }

    async fn get_items_by_id(
        &self,
        node_id: &str,
        item_ids: &[String],
    ) -> Result<Vec<StoredItem>, PubSubError> {
        let conn = self.connection().await?;
        Self::fetch_leaf(&conn, node_id).await?;

        let items = Self::query_items(
            &conn,
            r#"
            SELECT item_id, publisher, payload, published_at FROM pubsub_items
            WHERE node_id = ?1 ORDER BY seq ASC
            "#,
            [node_id],
        )
        .await?;

        Ok(items
            .into_iter()
            .filter(|item| item_ids.contains(&item.id))
            .collect())
    }

    async fn purge(&self, node_id: &str) -> Result<(), PubSubError> {
        let conn = self.connection().await?;
        Self::fetch_leaf(&conn, node_id).await?;

        let purged = conn
            .execute("DELETE FROM pubsub_items WHERE node_id = ?1", [node_id])
            .await?;
        debug!(node = %node_id, purged, "Purged node items");
        Ok(())
    }
}

fn parse_jid(s: &str) -> Result<Jid, PubSubError> {
    s.parse()
        .map_err(|e| PubSubError::storage(format!("Invalid JID {}: {}", s, e)))
}

fn parse_affiliation(s: &str) -> Result<Affiliation, PubSubError> {
    Affiliation::from_str(s)
        .ok_or_else(|| PubSubError::storage(format!("Invalid affiliation: {}", s)))
}

fn parse_payload(xml: &str) -> Result<Element, PubSubError> {
    xml.parse()
        .map_err(|e| PubSubError::storage(format!("Invalid item payload: {}", e)))
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, PubSubError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| PubSubError::storage(format!("Invalid timestamp: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn create_test_storage() -> LibSqlPubSubStorage {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        let conn = db.connect().unwrap();
        LibSqlPubSubStorage::new(conn)
    }

    fn owner() -> BareJid {
        "owner@example.com".parse().unwrap()
    }

    fn jid(s: &str) -> Jid {
        s.parse().unwrap()
    }

    async fn create_leaf(storage: &LibSqlPubSubStorage, node_id: &str) {
        storage
            .create_node(node_id, &owner(), NodeType::Leaf, &NodeConfig::leaf_default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_create_and_get_node() {
        let storage = create_test_storage().await;
        create_leaf(&storage, "news").await;

        let node = storage.get_node("news").await.unwrap();
        assert_eq!(node.node_type, NodeType::Leaf);
        assert_eq!(node.config, NodeConfig::leaf_default());

        let affiliation = storage
            .get_affiliation("news", &jid("owner@example.com/laptop"))
            .await
            .unwrap();
        assert_eq!(affiliation, Some(Affiliation::Owner));

        let err = storage
            .create_node("news", &owner(), NodeType::Leaf, &NodeConfig::leaf_default())
            .await
            .unwrap_err();
        assert!(matches!(err, PubSubError::NodeExists(_)));
    }

    #[tokio::test]
    async fn test_root_node_is_optional() {
        let storage = create_test_storage().await;
        let err = storage.get_node(ROOT_NODE).await.unwrap_err();
        assert!(matches!(err, PubSubError::NodeNotFound(_)));

        let service: BareJid = "pubsub.example.com".parse().unwrap();
        storage.ensure_root_node(&service).await.unwrap();
        storage.ensure_root_node(&service).await.unwrap();

        let root = storage.get_node(ROOT_NODE).await.unwrap();
        assert_eq!(root.node_type, NodeType::Collection);
    }

    #[tokio::test]
    async fn test_delete_node_removes_everything() {
        let storage = create_test_storage().await;
        create_leaf(&storage, "news").await;

        let subscriber = jid("user@example.com/phone");
        storage
            .add_subscription("news", &subscriber, SubscriptionState::Subscribed, &Options::new())
            .await
            .unwrap();
        storage
            .store_items("news", &[Item::new("a", None)], &jid("owner@example.com"))
            .await
            .unwrap();

        storage.delete_node("news").await.unwrap();

        assert!(matches!(
            storage.get_node("news").await.unwrap_err(),
            PubSubError::NodeNotFound(_)
        ));
        assert!(storage.get_subscriptions(&subscriber).await.unwrap().is_empty());
        assert!(storage
            .get_affiliations(&jid("owner@example.com"))
            .await
            .unwrap()
            .is_empty());
        assert!(matches!(
            storage.delete_node("news").await.unwrap_err(),
            PubSubError::NodeNotFound(_)
        ));

        // Recreating the node starts from a clean slate
        create_leaf(&storage, "news").await;
        assert!(storage.get_items("news", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_subscription_lifecycle() {
        let storage = create_test_storage().await;
        create_leaf(&storage, "news").await;

        let subscriber = jid("user@example.com/phone");
        let mut options = Options::new();
        options.insert("pubsub#subscription_type".to_string(), "items".to_string());

        storage
            .add_subscription("news", &subscriber, SubscriptionState::Subscribed, &options)
            .await
            .unwrap();
        let err = storage
            .add_subscription("news", &subscriber, SubscriptionState::Subscribed, &options)
            .await
            .unwrap_err();
        assert!(matches!(err, PubSubError::SubscriptionExists));

        let subscription = storage
            .get_subscription("news", &subscriber)
            .await
            .unwrap()
            .expect("subscription exists");
        assert_eq!(subscription.state, SubscriptionState::Subscribed);
        assert_eq!(subscription.options, options);

        assert!(storage
            .is_subscribed("news", &jid("user@example.com"))
            .await
            .unwrap());

        storage.remove_subscription("news", &subscriber).await.unwrap();
        let err = storage
            .remove_subscription("news", &subscriber)
            .await
            .unwrap_err();
        assert!(matches!(err, PubSubError::NotSubscribed));
    }

    #[tokio::test]
    async fn test_items_publish_order_and_payloads() {
        let storage = create_test_storage().await;
        create_leaf(&storage, "news").await;

        let payload = Element::builder("entry", "http://www.w3.org/2005/Atom")
            .append(Element::builder("title", "http://www.w3.org/2005/Atom").build())
            .build();
        let publisher = jid("owner@example.com/laptop");

        storage
            .store_items(
                "news",
                &[Item::new("a", Some(payload.clone())), Item::new("b", None)],
                &publisher,
            )
            .await
            .unwrap();
        storage
            .store_items("news", &[Item::new("a", Some(payload.clone()))], &publisher)
            .await
            .unwrap();

        let items = storage.get_items("news", None).await.unwrap();
        let ids: Vec<_> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(items[1].payload.as_ref(), Some(&payload));
        assert_eq!(items[1].publisher, publisher);
        assert!(items[0].payload.is_none());

        let last = storage.get_items("news", Some(1)).await.unwrap();
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].id, "a");
    }

    #[tokio::test]
    async fn test_max_items_and_retract() {
        let storage = create_test_storage().await;
        create_leaf(&storage, "news").await;

        let mut config = NodeConfig::leaf_default();
        config.max_items = 2;
        storage.set_configuration("news", &config).await.unwrap();

        let publisher = jid("owner@example.com");
        for i in 1..=3 {
            storage
                .store_items("news", &[Item::new(format!("item-{}", i), None)], &publisher)
                .await
                .unwrap();
        }

        let items = storage.get_items("news", None).await.unwrap();
        let ids: Vec<_> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["item-2", "item-3"]);

        let removed = storage
            .remove_items("news", &["item-2".to_string(), "item-1".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, vec!["item-2".to_string()]);

        storage.purge("news").await.unwrap();
        assert!(storage.get_items("news", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_store_items_on_missing_node_rolls_back() {
        let storage = create_test_storage().await;
        let err = storage
            .store_items("missing", &[Item::new("a", None)], &jid("owner@example.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, PubSubError::NodeNotFound(_)));

        // The connection is usable again after the rollback
        create_leaf(&storage, "news").await;
        assert_eq!(storage.get_node_ids().await.unwrap(), vec!["news".to_string()]);
    }

    #[tokio::test]
    async fn test_affiliations_by_entity() {
        let storage = create_test_storage().await;
        create_leaf(&storage, "a").await;
        create_leaf(&storage, "b").await;

        let publisher: BareJid = "writer@example.com".parse().unwrap();
        storage
            .set_affiliation("b", &publisher, Some(Affiliation::Publisher))
            .await
            .unwrap();

        let owned = storage
            .get_affiliations(&jid("owner@example.com/phone"))
            .await
            .unwrap();
        assert_eq!(
            owned,
            vec![
                ("a".to_string(), Affiliation::Owner),
                ("b".to_string(), Affiliation::Owner)
            ]
        );

        let written = storage
            .get_affiliations(&Jid::from(publisher.clone()))
            .await
            .unwrap();
        assert_eq!(written, vec![("b".to_string(), Affiliation::Publisher)]);

        storage.set_affiliation("b", &publisher, None).await.unwrap();
        assert!(storage
            .get_affiliations(&Jid::from(publisher))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_transaction_is_rolled_back() {
        let storage = create_test_storage().await;

        // An operation cancelled between BEGIN and COMMIT
        {
            let conn = storage.connection().await.unwrap();
            storage.begin(&conn).await.unwrap();
            LibSqlPubSubStorage::create_node_tx(
                &conn,
                "ghost",
                &owner(),
                NodeType::Leaf,
                &NodeConfig::leaf_default(),
            )
            .await
            .unwrap();
        }

        create_leaf(&storage, "news").await;
        assert!(storage.get_node("news").await.is_ok());
        assert!(matches!(
            storage.get_node("ghost").await,
            Err(PubSubError::NodeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_connection_usable() {
        let storage = create_test_storage().await;

        {
            let conn = storage.connection().await.unwrap();
            storage.begin(&conn).await.unwrap();
            // Ends the transaction behind finish's back so its COMMIT fails
            conn.execute_batch("COMMIT").await.unwrap();

            let result = storage.finish(&conn, Ok(())).await;
            assert!(matches!(result, Err(PubSubError::Storage(_))));
        }

        create_leaf(&storage, "news").await;
        storage
            .store_items("news", &[Item::new("a", None)], &jid("owner@example.com"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_an_error() {
        let storage = create_test_storage().await;
        create_leaf(&storage, "news").await;

        {
            let conn = storage.connection().await.unwrap();
            conn.execute(
                "INSERT INTO pubsub_items (node_id, item_id, publisher, payload, published_at) VALUES ('news', 'bad', 'owner@example.com', 42, ?1)",
                [Utc::now().to_rfc3339()],
            )
            .await
            .unwrap();
        }

        assert!(matches!(
            storage.get_items("news", None).await,
            Err(PubSubError::Storage(_))
        ));
    }
}
