//! Shared helpers for PubSub service integration tests.
//!
//! Each scenario runs against both storage backends through the
//! [`Harness`], which wires a service to a channel notifier.

#![allow(dead_code)]

use std::sync::{Arc, Once};

use jid::{BareJid, Jid};
use minidom::Element;
use tokio::sync::mpsc;
use waddle_pubsub::{
    ChannelNotifier, InMemoryPubSubStorage, LibSqlPubSubStorage, Notification, Options,
    PubSubItem, PubSubService, PubSubStorage, ServiceConfig,
};

/// Address of the PubSub service itself.
pub const SERVICE: &str = "pubsub.example.com";

/// Install a test subscriber once so `RUST_LOG` works in tests.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn jid(s: &str) -> Jid {
    s.parse().expect("valid jid")
}

pub fn bare(s: &str) -> BareJid {
    s.parse().expect("valid jid")
}

/// An Atom entry payload carrying `title`.
pub fn entry(title: &str) -> Element {
    Element::builder("entry", "http://www.w3.org/2005/Atom")
        .append(
            Element::builder("title", "http://www.w3.org/2005/Atom")
                .append(title)
                .build(),
        )
        .build()
}

pub fn item(id: &str, title: &str) -> PubSubItem {
    PubSubItem {
        id: Some(id.to_string()),
        payload: Some(entry(title)),
    }
}

pub fn options(pairs: &[(&str, &str)]) -> Options {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// A service with a channel notifier attached.
pub struct Harness<S: PubSubStorage> {
    pub service: PubSubService<S>,
    pub rx: mpsc::UnboundedReceiver<Notification>,
    /// Keeps an in-memory libSQL database alive for the test.
    _db: Option<libsql::Database>,
}

impl<S: PubSubStorage> Harness<S> {
    fn wrap(storage: S, config: ServiceConfig, db: Option<libsql::Database>) -> Self {
        init_tracing();
        let service = PubSubService::new(Arc::new(storage), config);
        let (notifier, rx) = ChannelNotifier::new();
        service.register_notifier(Arc::new(notifier));
        service.register_delete_notifications();
        Self {
            service,
            rx,
            _db: db,
        }
    }

    /// Take every notification delivered so far.
    pub fn drain(&mut self) -> Vec<Notification> {
        let mut notifications = Vec::new();
        while let Ok(notification) = self.rx.try_recv() {
            notifications.push(notification);
        }
        notifications
    }
}

pub fn memory_harness(config: ServiceConfig) -> Harness<InMemoryPubSubStorage> {
    Harness::wrap(InMemoryPubSubStorage::new(bare(SERVICE)), config, None)
}

pub async fn libsql_harness(config: ServiceConfig) -> Harness<LibSqlPubSubStorage> {
    let db = libsql::Builder::new_local(":memory:")
        .build()
        .await
        .expect("in-memory database");
    let conn = db.connect().expect("connection");

    let storage = LibSqlPubSubStorage::new(conn);
    storage.initialize().await.expect("schema");
    storage
        .ensure_root_node(&bare(SERVICE))
        .await
        .expect("root node");

    Harness::wrap(storage, config, Some(db))
}
