//! Organization membership rows, keyed `org_member:{org}:{user}`.

use std::sync::Arc;

use service_core::persistence::{PersistenceGateway, WriteOp};

use super::{decode, encode, key_part, require_non_empty, Clock, IdentityError};
use crate::models::{Actor, OrgMembership, OrgRole};

fn org_prefix(org_id: &str) -> String {
    format!("org_member:{}:", key_part(org_id))
}

pub(crate) fn membership_key(org_id: &str, user_id: &str) -> String {
    format!("{}{}", org_prefix(org_id), key_part(user_id))
}

#[derive(Clone)]
pub struct OrgMembershipStore {
    gateway: Arc<dyn PersistenceGateway>,
    clock: Arc<dyn Clock>,
}

impl OrgMembershipStore {
    pub fn new(gateway: Arc<dyn PersistenceGateway>, clock: Arc<dyn Clock>) -> Self {
        Self { gateway, clock }
    }

    /// Upsert: an existing membership has its role overwritten.
    ///
    /// User actors need `Admin` in the org and cannot grant above their own
    /// role. Changing another member's row also needs a role at least that
    /// member's current one, the same bar as `remove`.
    #[tracing::instrument(skip_all, fields(org_id = %org_id, user_id = %user_id, role = %role))]
    pub async fn add(
        &self,
        actor: &Actor,
        org_id: &str,
        user_id: &str,
        role: OrgRole,
    ) -> Result<OrgMembership, IdentityError> {
        require_non_empty("org_id", org_id)?;
        require_non_empty("user_id", user_id)?;

        let current = self.get(org_id, user_id).await?;

        if let Actor::User(acting_user) = actor {
            let actor_role = self.role_of(org_id, acting_user).await?;
            let outranks_target = acting_user == user_id
                || current.as_ref().is_none_or(|existing| {
                    actor_role.is_some_and(|r| r >= existing.role)
                });
            let allowed = outranks_target
                && actor_role.is_some_and(|r| r >= OrgRole::Admin && role <= r);
            if !allowed {
                tracing::warn!(actor = %acting_user, "Membership grant denied");
                return Err(IdentityError::Forbidden(format!(
                    "{} cannot grant {} in org {}",
                    acting_user, role, org_id
                )));
            }
        }

        let now = self.clock.now();
        let membership = match current {
            Some(existing) => OrgMembership {
                role,
                updated_at: now,
                ..existing
            },
            None => OrgMembership::new(org_id.to_string(), user_id.to_string(), role, now),
        };

        self.gateway
            .put(&membership_key(org_id, user_id), encode(&membership)?)
            .await?;

        tracing::info!("Org membership saved");
        Ok(membership)
    }

    /// Idempotent. Allowed for the member themself, for system callers, and
    /// for admins whose role is at least the target's.
    #[tracing::instrument(skip_all, fields(org_id = %org_id, user_id = %user_id))]
    pub async fn remove(
        &self,
        actor: &Actor,
        org_id: &str,
        user_id: &str,
    ) -> Result<(), IdentityError> {
        let Some(target) = self.get(org_id, user_id).await? else {
            return Ok(());
        };

        if let Actor::User(acting_user) = actor {
            if acting_user != user_id {
                let actor_role = self.role_of(org_id, acting_user).await?;
                let allowed = actor_role
                    .is_some_and(|r| r >= OrgRole::Admin && r >= target.role);
                if !allowed {
                    return Err(IdentityError::Forbidden(format!(
                        "{} cannot remove members of org {}",
                        acting_user, org_id
                    )));
                }
            }
        }

        self.gateway.delete(&membership_key(org_id, user_id)).await?;
        tracing::info!("Org membership removed");
        Ok(())
    }

    /// True iff the user is a member with at least `min_role`.
    pub async fn has_role(
        &self,
        org_id: &str,
        user_id: &str,
        min_role: OrgRole,
    ) -> Result<bool, IdentityError> {
        Ok(self
            .role_of(org_id, user_id)
            .await?
            .is_some_and(|role| role >= min_role))
    }

    pub async fn get(
        &self,
        org_id: &str,
        user_id: &str,
    ) -> Result<Option<OrgMembership>, IdentityError> {
        Ok(self
            .get_versioned(org_id, user_id)
            .await?
            .map(|(_, membership)| membership))
    }

    pub async fn list_members(&self, org_id: &str) -> Result<Vec<OrgMembership>, IdentityError> {
        self.gateway
            .scan_prefix(&org_prefix(org_id))
            .await?
            .into_iter()
            .map(|(_, record)| decode(&record.value))
            .collect()
    }

    pub(crate) async fn role_of(
        &self,
        org_id: &str,
        user_id: &str,
    ) -> Result<Option<OrgRole>, IdentityError> {
        Ok(self.get(org_id, user_id).await?.map(|m| m.role))
    }

    pub(crate) async fn get_versioned(
        &self,
        org_id: &str,
        user_id: &str,
    ) -> Result<Option<(u64, OrgMembership)>, IdentityError> {
        match self.gateway.get(&membership_key(org_id, user_id)).await? {
            Some(record) => Ok(Some((record.version, decode(&record.value)?))),
            None => Ok(None),
        }
    }

    /// Write that grants `role` to `user_id`, to be committed together with
    /// an invitation transition. Never lowers an existing role; the
    /// conditional write aborts the transaction if the row changed since
    /// `current` was read.
    pub(crate) fn grant_op(
        &self,
        org_id: &str,
        user_id: &str,
        role: OrgRole,
        current: Option<(u64, OrgMembership)>,
    ) -> Result<(WriteOp, OrgMembership), IdentityError> {
        let now = self.clock.now();
        let (expected_version, membership) = match current {
            Some((version, existing)) => {
                let granted = OrgMembership {
                    role: existing.role.max(role),
                    updated_at: now,
                    ..existing
                };
                (Some(version), granted)
            }
            None => (
                None,
                OrgMembership::new(org_id.to_string(), user_id.to_string(), role, now),
            ),
        };

        let op = WriteOp::CompareAndSet {
            key: membership_key(org_id, user_id),
            expected_version,
            value: encode(&membership)?,
        };
        Ok((op, membership))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::MockClock;
    use service_core::persistence::MemoryGateway;

    fn store() -> OrgMembershipStore {
        OrgMembershipStore::new(
            Arc::new(MemoryGateway::new()),
            Arc::new(MockClock::default()),
        )
    }

    #[tokio::test]
    async fn test_grant_op_never_downgrades() {
        let store = store();
        store
            .add(&Actor::System, "7", "u1", OrgRole::Owner)
            .await
            .unwrap();
        let current = store.get_versioned("7", "u1").await.unwrap();

        let (_, granted) = store.grant_op("7", "u1", OrgRole::Member, current).unwrap();
        assert_eq!(granted.role, OrgRole::Owner);
    }

    #[tokio::test]
    async fn test_ids_with_separators_do_not_collide() {
        let store = store();
        store
            .add(&Actor::System, "a:b", "c", OrgRole::Member)
            .await
            .unwrap();
        store
            .add(&Actor::System, "a", "b:c", OrgRole::Admin)
            .await
            .unwrap();

        assert_eq!(store.list_members("a:b").await.unwrap().len(), 1);
        assert_eq!(store.list_members("a").await.unwrap().len(), 1);
        assert!(!store.has_role("a:b", "c", OrgRole::Admin).await.unwrap());
    }
}
