//! Access token issuance, validation and revocation.
//!
//! Rows live under `access_token:{id}`. Validation never scans: the
//! plaintext is digested and resolved through `access_token_digest:{hex}`,
//! then the stored digest is compared in constant time.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Duration;
use service_core::error::StorageError;
use service_core::persistence::{PersistenceGateway, TxnOutcome, WriteOp};
use service_core::utils::digest::constant_time_eq;
use uuid::Uuid;

use super::{
    contention, decode, encode, key_part, require_non_empty, Clock, IdentityError,
    SecretGenerator, MAX_CAS_RETRIES,
};
use crate::config::TokenConfig;
use crate::models::{AccessToken, AccessTokenMetadata, IssuedToken, TokenIdentity, TOKEN_PREFIX};

fn token_key(token_id: &Uuid) -> String {
    format!("access_token:{}", token_id)
}

fn digest_key(secret_hash: &str) -> String {
    format!("access_token_digest:{}", secret_hash)
}

fn user_index_prefix(user_id: &str) -> String {
    format!("user_access_token:{}:", key_part(user_id))
}

fn user_index_key(user_id: &str, token_id: &Uuid) -> String {
    format!("{}{}", user_index_prefix(user_id), token_id)
}

#[derive(Clone)]
pub struct AccessTokenStore {
    gateway: Arc<dyn PersistenceGateway>,
    clock: Arc<dyn Clock>,
    secrets: Arc<dyn SecretGenerator>,
    config: TokenConfig,
}

impl AccessTokenStore {
    pub fn new(
        gateway: Arc<dyn PersistenceGateway>,
        clock: Arc<dyn Clock>,
        secrets: Arc<dyn SecretGenerator>,
        config: TokenConfig,
    ) -> Self {
        Self {
            gateway,
            clock,
            secrets,
            config,
        }
    }

    /// Issue a token for `user_id` carrying `scopes`, which must be a subset
    /// of `permitted_scopes`. The returned plaintext is shown once.
    pub async fn issue(
        &self,
        user_id: &str,
        scopes: &BTreeSet<String>,
        permitted_scopes: &BTreeSet<String>,
        ttl: Option<Duration>,
    ) -> Result<IssuedToken, IdentityError> {
        self.issue_with_note(user_id, scopes, permitted_scopes, ttl, "")
            .await
    }

    #[tracing::instrument(skip_all, fields(user_id = %user_id))]
    pub async fn issue_with_note(
        &self,
        user_id: &str,
        scopes: &BTreeSet<String>,
        permitted_scopes: &BTreeSet<String>,
        ttl: Option<Duration>,
        note: &str,
    ) -> Result<IssuedToken, IdentityError> {
        require_non_empty("user_id", user_id)?;

        for scope in scopes {
            if scope.is_empty() || scope.chars().any(char::is_whitespace) {
                return Err(IdentityError::InvalidScope(format!("{:?}", scope)));
            }
            if !permitted_scopes.contains(scope) {
                tracing::warn!(scope = %scope, "Requested scope not permitted");
                return Err(IdentityError::InvalidScope(scope.clone()));
            }
        }

        let ttl = ttl.or_else(|| self.config.default_ttl());
        if ttl.is_some_and(|ttl| ttl <= Duration::zero()) {
            return Err(IdentityError::Validation(
                "token TTL must be positive".to_string(),
            ));
        }

        let plaintext = self.generate_secret();
        let token = AccessToken::new(
            user_id.to_string(),
            scopes.clone(),
            note.to_string(),
            &plaintext,
            self.clock.now(),
            ttl,
        );

        let ops = vec![
            WriteOp::CompareAndSet {
                key: digest_key(&token.secret_hash),
                expected_version: None,
                value: token.id.to_string().into_bytes(),
            },
            WriteOp::CompareAndSet {
                key: token_key(&token.id),
                expected_version: None,
                value: encode(&token)?,
            },
            WriteOp::Put {
                key: user_index_key(user_id, &token.id),
                value: token.id.to_string().into_bytes(),
            },
        ];

        match self.gateway.transaction(ops).await? {
            TxnOutcome::Committed => {
                tracing::info!(
                    token_id = %token.id,
                    scopes = ?token.scopes,
                    expires_at = ?token.expires_at,
                    "Access token issued"
                );
                Ok(IssuedToken {
                    token_id: token.id,
                    plaintext,
                })
            }
            TxnOutcome::Aborted => {
                tracing::error!(token_id = %token.id, "Access token digest collision");
                Err(IdentityError::Conflict(
                    "access token digest already registered".to_string(),
                ))
            }
        }
    }

    /// Resolve a plaintext token to its owner and scopes.
    ///
    /// Fails with `Unauthenticated` for unknown input, `Revoked` once
    /// revoked, and `Expired` once past `expires_at`.
    #[tracing::instrument(skip_all)]
    pub async fn validate(&self, plaintext: &str) -> Result<TokenIdentity, IdentityError> {
        if !plaintext.starts_with(TOKEN_PREFIX) {
            tracing::debug!("Malformed access token");
            return Err(IdentityError::Unauthenticated);
        }

        let presented_hash = AccessToken::hash_secret(plaintext);

        let Some(index) = self.gateway.get(&digest_key(&presented_hash)).await? else {
            tracing::debug!("Unknown access token");
            return Err(IdentityError::Unauthenticated);
        };
        let token_id = parse_token_id(&index.value)?;

        let Some(record) = self.gateway.get(&token_key(&token_id)).await? else {
            tracing::warn!(token_id = %token_id, "Digest index points at a missing token");
            return Err(IdentityError::Unauthenticated);
        };
        let token: AccessToken = decode(&record.value)?;

        if !constant_time_eq(token.secret_hash.as_bytes(), presented_hash.as_bytes()) {
            return Err(IdentityError::Unauthenticated);
        }

        if token.is_revoked() {
            tracing::debug!(token_id = %token.id, "Revoked access token presented");
            return Err(IdentityError::Revoked);
        }
        if token.is_expired_at(self.clock.now()) {
            tracing::debug!(token_id = %token.id, "Expired access token presented");
            return Err(IdentityError::Expired);
        }

        Ok(TokenIdentity {
            token_id: token.id,
            user_id: token.user_id,
            scopes: token.scopes,
        })
    }

    /// [`validate`](Self::validate), then require `required_scope`.
    pub async fn validate_scope(
        &self,
        plaintext: &str,
        required_scope: &str,
    ) -> Result<TokenIdentity, IdentityError> {
        let identity = self.validate(plaintext).await?;
        if !identity.scopes.contains(required_scope) {
            return Err(IdentityError::Forbidden(format!(
                "access token lacks scope {}",
                required_scope
            )));
        }
        Ok(identity)
    }

    /// Idempotent: revoking a revoked token keeps the first `revoked_at`.
    #[tracing::instrument(skip_all, fields(token_id = %token_id))]
    pub async fn revoke(&self, token_id: Uuid) -> Result<(), IdentityError> {
        let key = token_key(&token_id);

        for _ in 0..MAX_CAS_RETRIES {
            let record = self
                .gateway
                .get(&key)
                .await?
                .ok_or_else(|| IdentityError::NotFound("Access token".to_string()))?;
            let mut token: AccessToken = decode(&record.value)?;

            if token.is_revoked() {
                return Ok(());
            }
            token.revoked_at = Some(self.clock.now());

            match self
                .gateway
                .compare_and_set(&key, Some(record.version), encode(&token)?)
                .await
            {
                Ok(_) => {
                    tracing::info!(user_id = %token.user_id, "Access token revoked");
                    return Ok(());
                }
                Err(StorageError::Conflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(contention("access token"))
    }

    pub async fn get(&self, token_id: Uuid) -> Result<AccessTokenMetadata, IdentityError> {
        let record = self
            .gateway
            .get(&token_key(&token_id))
            .await?
            .ok_or_else(|| IdentityError::NotFound("Access token".to_string()))?;
        let token: AccessToken = decode(&record.value)?;
        Ok(token.metadata())
    }

    /// Tokens owned by `user_id`, oldest first, revoked and expired included.
    pub async fn list(&self, user_id: &str) -> Result<Vec<AccessTokenMetadata>, IdentityError> {
        let index = self.gateway.scan_prefix(&user_index_prefix(user_id)).await?;

        let mut tokens = Vec::with_capacity(index.len());
        for (_, entry) in index {
            let token_id = parse_token_id(&entry.value)?;
            if let Some(record) = self.gateway.get(&token_key(&token_id)).await? {
                let token: AccessToken = decode(&record.value)?;
                tokens.push(token.metadata());
            }
        }

        tokens.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(tokens)
    }

    fn generate_secret(&self) -> String {
        let mut bytes = vec![0u8; self.config.secret_bytes];
        self.secrets.fill(&mut bytes);
        format!("{}{}", TOKEN_PREFIX, hex::encode(bytes))
    }
}

fn parse_token_id(raw: &[u8]) -> Result<Uuid, IdentityError> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| IdentityError::Internal(anyhow::anyhow!("corrupt access token index entry")))
}
