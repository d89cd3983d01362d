//! PubSub service configuration.
//!
//! # Environment Variables
//!
//! - `WADDLE_PUBSUB_INSTANT_NODES`: Allow node creation without an identifier. Default: `true`
//! - `WADDLE_PUBSUB_COLLECTIONS`: Allow creating collection nodes. Default: `false`

use serde::{Deserialize, Serialize};
use tracing::info;

/// Deployment options for the PubSub service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Generate identifiers for nodes created without one.
    pub instant_nodes: bool,
    /// Allow creating collection nodes besides the root.
    pub collections: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            instant_nodes: true,
            collections: false,
        }
    }
}

impl ServiceConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            instant_nodes: env_flag("WADDLE_PUBSUB_INSTANT_NODES")
                .unwrap_or(defaults.instant_nodes),
            collections: env_flag("WADDLE_PUBSUB_COLLECTIONS").unwrap_or(defaults.collections),
        }
    }

    /// Log the current configuration.
    pub fn log_config(&self) {
        info!(
            instant_nodes = self.instant_nodes,
            collections = self.collections,
            "PubSub service configured"
        );
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|value| parse_flag(&value))
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
