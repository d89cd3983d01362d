//! Authorization checks for PubSub operations.
//!
//! Every mutating service operation resolves the requestor's affiliation and
//! checks it here before touching storage.

use jid::Jid;
use tracing::debug;

use crate::storage::PubSubStorage;
use crate::types::{same_bare, Affiliation};
use crate::PubSubError;

/// Operations gated on the requestor's affiliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Publish items
    Publish,
    /// Change node configuration
    Configure,
    /// Delete the node
    Delete,
    /// Retract items
    Retract,
    /// Remove all items
    Purge,
    /// Change affiliations
    ModifyAffiliations,
}

impl Action {
    /// Affiliations allowed to perform this action.
    pub fn allowed(&self) -> &'static [Affiliation] {
        match self {
            Action::Publish | Action::Retract => &[Affiliation::Owner, Affiliation::Publisher],
            Action::Configure | Action::Delete | Action::Purge | Action::ModifyAffiliations => {
                &[Affiliation::Owner]
            }
        }
    }
}

/// Resolve the affiliation of `entity` (by its bare form) on a node.
pub async fn resolve_affiliation<S: PubSubStorage + ?Sized>(
    storage: &S,
    node_id: &str,
    entity: &Jid,
) -> Result<Option<Affiliation>, PubSubError> {
    storage.get_affiliation(node_id, entity).await
}

/// Check that an affiliation permits an action.
pub fn authorize(action: Action, affiliation: Option<Affiliation>) -> Result<(), PubSubError> {
    match affiliation {
        Some(affiliation) if action.allowed().contains(&affiliation) => Ok(()),
        _ => {
            debug!(?action, ?affiliation, "Affiliation does not permit action");
            Err(PubSubError::NotAuthorized)
        }
    }
}

/// Check that a requestor may manage a subscriber's subscriptions.
///
/// The requestor's bare address must equal the subscriber's.
pub fn check_subscriber(requestor: &Jid, subscriber: &Jid) -> Result<(), PubSubError> {
    if same_bare(requestor, subscriber) {
        Ok(())
    } else {
        debug!(%requestor, %subscriber, "Requestor does not match subscriber");
        Err(PubSubError::NotAuthorized)
    }
}

/// Check that a subscriber is not banned from the node.
pub fn check_not_outcast(affiliation: Option<Affiliation>) -> Result<(), PubSubError> {
    if affiliation == Some(Affiliation::Outcast) {
        Err(PubSubError::NotAuthorized)
    } else {
        Ok(())
    }
}
