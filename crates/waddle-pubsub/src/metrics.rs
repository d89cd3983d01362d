//! PubSub metrics for observability.
//!
//! Uses the global OpenTelemetry meter provider which must be initialized
//! by the host application. Without one, recording is a no-op.

use opentelemetry::metrics::{Counter, Meter};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

static METER: OnceLock<Meter> = OnceLock::new();

fn meter() -> &'static Meter {
    METER.get_or_init(|| opentelemetry::global::meter("waddle-pubsub"))
}

// ============================================================================
// Counters (Cumulative)
// ============================================================================

/// Counter for published items.
pub fn items_published() -> Counter<u64> {
    meter()
        .u64_counter("pubsub.items.published")
        .with_description("Total items published to PubSub nodes")
        .with_unit("item")
        .build()
}

/// Counter for notifications handed to notifiers.
pub fn notifications_dispatched() -> Counter<u64> {
    meter()
        .u64_counter("pubsub.notifications.dispatched")
        .with_description("Total notification entries delivered to notifiers")
        .with_unit("notification")
        .build()
}

/// Counter for failed notifier invocations.
pub fn notifier_failures() -> Counter<u64> {
    meter()
        .u64_counter("pubsub.notifier.failures")
        .with_description("Total notifier invocations that returned an error")
        .with_unit("notification")
        .build()
}

/// Counter for created nodes.
pub fn nodes_created() -> Counter<u64> {
    meter()
        .u64_counter("pubsub.nodes.created")
        .with_description("Total PubSub nodes created")
        .with_unit("node")
        .build()
}

/// Counter for deleted nodes.
pub fn nodes_deleted() -> Counter<u64> {
    meter()
        .u64_counter("pubsub.nodes.deleted")
        .with_description("Total PubSub nodes deleted")
        .with_unit("node")
        .build()
}

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Record items being published.
pub fn record_publish(count: usize, persisted: bool) {
    items_published().add(count as u64, &[KeyValue::new("persisted", persisted)]);
}

/// Record a notification delivered to a notifier.
pub fn record_notification(kind: &'static str) {
    notifications_dispatched().add(1, &[KeyValue::new("kind", kind)]);
}

/// Record a notifier failure.
pub fn record_notifier_failure(kind: &'static str) {
    notifier_failures().add(1, &[KeyValue::new("kind", kind)]);
}

/// Record a node creation.
pub fn record_node_created(node_type: &'static str) {
    nodes_created().add(1, &[KeyValue::new("type", node_type)]);
}

/// Record a node deletion.
pub fn record_node_deleted() {
    nodes_deleted().add(1, &[]);
}
