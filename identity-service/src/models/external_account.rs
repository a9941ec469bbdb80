//! External account model - third-party identities linked to platform users.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Link between an identity at an external provider and a platform user.
/// `(provider, external_id)` maps to at most one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalAccount {
    pub provider: String,
    pub external_id: String,
    pub user_id: String,
    pub linked_at: DateTime<Utc>,
}

impl ExternalAccount {
    pub fn new(provider: String, external_id: String, user_id: String, now: DateTime<Utc>) -> Self {
        Self {
            provider,
            external_id,
            user_id,
            linked_at: now,
        }
    }
}
