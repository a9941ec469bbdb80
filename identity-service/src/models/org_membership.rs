//! Organization membership model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Membership roles. Ordering is total: `Member < Admin < Owner`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrgRole {
    Member,
    Admin,
    Owner,
}

impl OrgRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrgRole::Member => "member",
            OrgRole::Admin => "admin",
            OrgRole::Owner => "owner",
        }
    }
}

impl std::fmt::Display for OrgRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OrgRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "member" => Ok(OrgRole::Member),
            "admin" => Ok(OrgRole::Admin),
            "owner" => Ok(OrgRole::Owner),
            _ => Err(format!("Invalid org role: {}", s)),
        }
    }
}

/// One row per `(org_id, user_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgMembership {
    pub org_id: String,
    pub user_id: String,
    pub role: OrgRole,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrgMembership {
    pub fn new(org_id: String, user_id: String, role: OrgRole, now: DateTime<Utc>) -> Self {
        Self {
            org_id,
            user_id,
            role,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Principal performing a membership mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    /// Trusted internal caller (bootstrap, invitation acceptance).
    System,
    User(String),
}

impl Actor {
    pub fn user(user_id: impl Into<String>) -> Self {
        Actor::User(user_id.into())
    }
}
