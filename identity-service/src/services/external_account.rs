//! Links between third-party identities and platform users.

use std::sync::Arc;

use service_core::persistence::{PersistenceGateway, TxnOutcome, WriteOp};

use super::{
    contention, decode, encode, key_part, require_non_empty, Clock, IdentityError,
    MAX_CAS_RETRIES,
};
use crate::models::ExternalAccount;

fn account_key(provider: &str, external_id: &str) -> String {
    format!(
        "external_account:{}:{}",
        key_part(provider),
        key_part(external_id)
    )
}

fn user_index_prefix(user_id: &str) -> String {
    format!("user_external_account:{}:", key_part(user_id))
}

fn user_index_key(user_id: &str, provider: &str, external_id: &str) -> String {
    format!(
        "{}{}:{}",
        user_index_prefix(user_id),
        key_part(provider),
        key_part(external_id)
    )
}

#[derive(Clone)]
pub struct ExternalAccountStore {
    gateway: Arc<dyn PersistenceGateway>,
    clock: Arc<dyn Clock>,
}

impl ExternalAccountStore {
    pub fn new(gateway: Arc<dyn PersistenceGateway>, clock: Arc<dyn Clock>) -> Self {
        Self { gateway, clock }
    }

    /// Link `(provider, external_id)` to `user_id`.
    ///
    /// The insert expects the account key to be absent, so of several
    /// concurrent linkers exactly one commits; the others re-read and see
    /// either their own user (no-op) or a `Conflict`.
    #[tracing::instrument(skip_all, fields(provider = %provider, user_id = %user_id))]
    pub async fn link(
        &self,
        provider: &str,
        external_id: &str,
        user_id: &str,
    ) -> Result<ExternalAccount, IdentityError> {
        require_non_empty("provider", provider)?;
        require_non_empty("external_id", external_id)?;
        require_non_empty("user_id", user_id)?;

        let key = account_key(provider, external_id);

        for _ in 0..MAX_CAS_RETRIES {
            if let Some(record) = self.gateway.get(&key).await? {
                let existing: ExternalAccount = decode(&record.value)?;
                if existing.user_id == user_id {
                    return Ok(existing);
                }
                tracing::warn!(
                    linked_user_id = %existing.user_id,
                    "External account already linked to another user"
                );
                return Err(IdentityError::Conflict(format!(
                    "{} account is already linked to another user",
                    provider
                )));
            }

            let account = ExternalAccount::new(
                provider.to_string(),
                external_id.to_string(),
                user_id.to_string(),
                self.clock.now(),
            );
            let ops = vec![
                WriteOp::CompareAndSet {
                    key: key.clone(),
                    expected_version: None,
                    value: encode(&account)?,
                },
                WriteOp::Put {
                    key: user_index_key(user_id, provider, external_id),
                    value: key.clone().into_bytes(),
                },
            ];

            match self.gateway.transaction(ops).await? {
                TxnOutcome::Committed => {
                    tracing::info!("External account linked");
                    return Ok(account);
                }
                TxnOutcome::Aborted => continue,
            }
        }

        Err(contention("external account"))
    }

    /// Idempotent. The row and the owner's index entry go together.
    #[tracing::instrument(skip_all, fields(provider = %provider))]
    pub async fn unlink(&self, provider: &str, external_id: &str) -> Result<(), IdentityError> {
        let key = account_key(provider, external_id);

        for _ in 0..MAX_CAS_RETRIES {
            let Some(record) = self.gateway.get(&key).await? else {
                return Ok(());
            };
            let existing: ExternalAccount = decode(&record.value)?;

            let ops = vec![
                WriteOp::CompareAndDelete {
                    key: key.clone(),
                    expected_version: record.version,
                },
                WriteOp::Delete {
                    key: user_index_key(&existing.user_id, provider, external_id),
                },
            ];

            match self.gateway.transaction(ops).await? {
                TxnOutcome::Committed => {
                    tracing::info!(user_id = %existing.user_id, "External account unlinked");
                    return Ok(());
                }
                TxnOutcome::Aborted => continue,
            }
        }

        Err(contention("external account"))
    }

    pub async fn lookup(&self, provider: &str, external_id: &str) -> Result<String, IdentityError> {
        let record = self
            .gateway
            .get(&account_key(provider, external_id))
            .await?
            .ok_or_else(|| IdentityError::NotFound("External account".to_string()))?;
        let account: ExternalAccount = decode(&record.value)?;
        Ok(account.user_id)
    }

    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<ExternalAccount>, IdentityError> {
        let index = self.gateway.scan_prefix(&user_index_prefix(user_id)).await?;

        let mut accounts = Vec::with_capacity(index.len());
        for (_, entry) in index {
            let Ok(key) = String::from_utf8(entry.value) else {
                tracing::warn!(user_id = %user_id, "Skipping corrupt external account index entry");
                continue;
            };
            if let Some(record) = self.gateway.get(&key).await? {
                let account: ExternalAccount = decode(&record.value)?;
                // Index entries can outlive a relink to another user.
                if account.user_id == user_id {
                    accounts.push(account);
                }
            }
        }
        Ok(accounts)
    }
}
