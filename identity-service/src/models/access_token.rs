use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use service_core::utils::digest::sha256_hex;
use uuid::Uuid;

/// Prefix of every plaintext access token.
pub const TOKEN_PREFIX: &str = "ist_";

/// Access token row. Only the digest of the secret is kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    pub id: Uuid,

    pub user_id: String,

    pub scopes: BTreeSet<String>,

    /// Free-form label chosen by the owner ("CI", "laptop", ...)
    #[serde(default)]
    pub note: String,

    /// SHA-256 of the plaintext secret, hex encoded
    pub secret_hash: String,

    pub created_at: DateTime<Utc>,

    pub expires_at: Option<DateTime<Utc>>,

    pub revoked_at: Option<DateTime<Utc>>,
}

impl AccessToken {
    pub fn new(
        user_id: String,
        scopes: BTreeSet<String>,
        note: String,
        secret: &str,
        now: DateTime<Utc>,
        ttl: Option<Duration>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            scopes,
            note,
            secret_hash: Self::hash_secret(secret),
            created_at: now,
            expires_at: ttl.map(|ttl| now + ttl),
            revoked_at: None,
        }
    }

    /// Hash a plaintext secret using SHA-256
    pub fn hash_secret(secret: &str) -> String {
        sha256_hex(secret.as_bytes())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    /// Valid iff not revoked and not past `expires_at`.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_revoked() && !self.is_expired_at(now)
    }

    pub fn metadata(&self) -> AccessTokenMetadata {
        AccessTokenMetadata {
            id: self.id,
            user_id: self.user_id.clone(),
            scopes: self.scopes.clone(),
            note: self.note.clone(),
            created_at: self.created_at,
            expires_at: self.expires_at,
            revoked_at: self.revoked_at,
        }
    }
}

/// Token listing entry. Carries neither the secret nor its digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessTokenMetadata {
    pub id: Uuid,
    pub user_id: String,
    pub scopes: BTreeSet<String>,
    pub note: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
}

/// Result of issuing a token. The plaintext is not recoverable later.
#[derive(Clone)]
pub struct IssuedToken {
    pub token_id: Uuid,
    pub plaintext: String,
}

impl fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedToken")
            .field("token_id", &self.token_id)
            .field("plaintext", &"<redacted>")
            .finish()
    }
}

/// Who a validated token speaks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenIdentity {
    pub token_id: Uuid,
    pub user_id: String,
    pub scopes: BTreeSet<String>,
}
