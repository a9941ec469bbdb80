//! Organization invitations.
//!
//! Each invitation row is `org_invitation:{id}`. While an invitation is
//! pending, `org_invitation_pending:{org}:{recipient}` holds its id; the
//! slot is claimed with a compare-and-set, which is what keeps a recipient
//! to one pending invitation per org. Every state change is a
//! compare-and-set on the row's version committed together with the slot
//! release (and, on accept, the membership write).

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use service_core::persistence::{PersistenceGateway, TxnOutcome, WriteOp};
use uuid::Uuid;

use super::{
    contention, decode, encode, key_part, require_non_empty, Clock, IdentityError,
    OrgMembershipStore, MAX_CAS_RETRIES,
};
use crate::config::InvitationConfig;
use crate::models::{InvitationRecipient, InvitationState, OrgInvitation, OrgMembership, OrgRole};

fn invitation_key(id: &Uuid) -> String {
    format!("org_invitation:{}", id)
}

fn pending_prefix(org_id: &str) -> String {
    format!("org_invitation_pending:{}:", key_part(org_id))
}

fn pending_key(org_id: &str, recipient: &InvitationRecipient) -> String {
    format!("{}{}", pending_prefix(org_id), key_part(&recipient.key()))
}

fn parse_invitation_id(raw: &[u8]) -> Option<Uuid> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| Uuid::parse_str(s).ok())
}

#[derive(Clone)]
pub struct OrgInvitationStore {
    gateway: Arc<dyn PersistenceGateway>,
    clock: Arc<dyn Clock>,
    members: OrgMembershipStore,
    config: InvitationConfig,
}

impl OrgInvitationStore {
    pub fn new(
        gateway: Arc<dyn PersistenceGateway>,
        clock: Arc<dyn Clock>,
        members: OrgMembershipStore,
        config: InvitationConfig,
    ) -> Self {
        Self {
            gateway,
            clock,
            members,
            config,
        }
    }

    /// Invite `recipient` into `org_id` as a `Member`.
    pub async fn invite(
        &self,
        org_id: &str,
        inviter_user_id: &str,
        recipient: InvitationRecipient,
        ttl: Option<Duration>,
    ) -> Result<Uuid, IdentityError> {
        self.invite_with_role(org_id, inviter_user_id, recipient, OrgRole::Member, ttl)
            .await
    }

    #[tracing::instrument(skip_all, fields(org_id = %org_id, inviter = %inviter_user_id, role = %role))]
    pub async fn invite_with_role(
        &self,
        org_id: &str,
        inviter_user_id: &str,
        recipient: InvitationRecipient,
        role: OrgRole,
        ttl: Option<Duration>,
    ) -> Result<Uuid, IdentityError> {
        require_non_empty("org_id", org_id)?;
        require_non_empty("inviter_user_id", inviter_user_id)?;
        if recipient.is_empty() {
            return Err(IdentityError::Validation(
                "recipient must not be empty".to_string(),
            ));
        }

        let ttl = ttl.unwrap_or_else(|| self.config.default_ttl());
        if ttl <= Duration::zero() {
            return Err(IdentityError::Validation(
                "invitation TTL must be positive".to_string(),
            ));
        }

        match self.members.role_of(org_id, inviter_user_id).await? {
            Some(inviter_role) if inviter_role >= OrgRole::Admin => {
                if role > inviter_role {
                    return Err(IdentityError::Forbidden(format!(
                        "{} cannot invite with role {}",
                        inviter_user_id, role
                    )));
                }
            }
            _ => {
                tracing::warn!("Invitation denied: inviter is not an org admin");
                return Err(IdentityError::Forbidden(format!(
                    "{} is not an admin of org {}",
                    inviter_user_id, org_id
                )));
            }
        }

        if let InvitationRecipient::User(user_id) = &recipient {
            if self.members.get(org_id, user_id).await?.is_some() {
                return Err(IdentityError::Conflict(format!(
                    "{} is already a member of org {}",
                    user_id, org_id
                )));
            }
        }

        let slot_key = pending_key(org_id, &recipient);

        for _ in 0..MAX_CAS_RETRIES {
            let now = self.clock.now();

            let expected_slot_version = match self.gateway.get(&slot_key).await? {
                None => None,
                Some(slot) => {
                    let current = match parse_invitation_id(&slot.value) {
                        Some(id) => self.load(&id).await?,
                        None => None,
                    };
                    match current {
                        Some((version, existing)) if existing.state == InvitationState::Pending => {
                            if !existing.is_expired_at(now) {
                                return Err(IdentityError::Conflict(format!(
                                    "a pending invitation already exists for {}",
                                    recipient.key()
                                )));
                            }
                            // Expire the stale one, then claim the freed slot.
                            self.commit_transition(
                                version,
                                &existing,
                                InvitationState::Expired,
                                Vec::new(),
                                now,
                            )
                            .await?;
                            continue;
                        }
                        // Slot left behind by a finished invitation.
                        _ => Some(slot.version),
                    }
                }
            };

            let invitation = OrgInvitation::new(
                org_id.to_string(),
                inviter_user_id.to_string(),
                recipient.clone(),
                role,
                now,
                ttl,
            );
            let ops = vec![
                WriteOp::CompareAndSet {
                    key: slot_key.clone(),
                    expected_version: expected_slot_version,
                    value: invitation.id.to_string().into_bytes(),
                },
                WriteOp::CompareAndSet {
                    key: invitation_key(&invitation.id),
                    expected_version: None,
                    value: encode(&invitation)?,
                },
            ];

            match self.gateway.transaction(ops).await? {
                TxnOutcome::Committed => {
                    tracing::info!(
                        invitation_id = %invitation.id,
                        expires_at = %invitation.expires_at,
                        "Org invitation created"
                    );
                    return Ok(invitation.id);
                }
                TxnOutcome::Aborted => continue,
            }
        }

        Err(contention("invitation"))
    }

    /// Accept on behalf of `responding_user_id` and grant the invitation's
    /// role. The state change and the membership write commit together.
    #[tracing::instrument(skip_all, fields(invitation_id = %invitation_id, user_id = %responding_user_id))]
    pub async fn accept(
        &self,
        invitation_id: Uuid,
        responding_user_id: &str,
    ) -> Result<OrgMembership, IdentityError> {
        require_non_empty("responding_user_id", responding_user_id)?;

        for _ in 0..MAX_CAS_RETRIES {
            let now = self.clock.now();
            let (version, invitation) = self.load_pending(&invitation_id, now).await?;

            if let InvitationRecipient::User(recipient) = &invitation.recipient {
                if recipient != responding_user_id {
                    return Err(IdentityError::Forbidden(
                        "invitation is addressed to another user".to_string(),
                    ));
                }
            }

            let current = self
                .members
                .get_versioned(&invitation.org_id, responding_user_id)
                .await?;
            let (grant, membership) = self.members.grant_op(
                &invitation.org_id,
                responding_user_id,
                invitation.role,
                current,
            )?;

            match self
                .commit_transition(version, &invitation, InvitationState::Accepted, vec![grant], now)
                .await?
            {
                TxnOutcome::Committed => {
                    tracing::info!(
                        org_id = %invitation.org_id,
                        role = %membership.role,
                        "Org invitation accepted"
                    );
                    return Ok(membership);
                }
                TxnOutcome::Aborted => continue,
            }
        }

        Err(contention("invitation"))
    }

    #[tracing::instrument(skip_all, fields(invitation_id = %invitation_id))]
    pub async fn decline(&self, invitation_id: Uuid) -> Result<(), IdentityError> {
        for _ in 0..MAX_CAS_RETRIES {
            let now = self.clock.now();
            let (version, invitation) = self.load_pending(&invitation_id, now).await?;

            match self
                .commit_transition(version, &invitation, InvitationState::Declined, Vec::new(), now)
                .await?
            {
                TxnOutcome::Committed => {
                    tracing::info!("Org invitation declined");
                    return Ok(());
                }
                TxnOutcome::Aborted => continue,
            }
        }

        Err(contention("invitation"))
    }

    /// Withdraw a pending invitation. Only its inviter or an org admin may.
    #[tracing::instrument(skip_all, fields(invitation_id = %invitation_id, actor = %acting_user_id))]
    pub async fn revoke(
        &self,
        invitation_id: Uuid,
        acting_user_id: &str,
    ) -> Result<(), IdentityError> {
        for _ in 0..MAX_CAS_RETRIES {
            let now = self.clock.now();
            let (version, invitation) = self.load_pending(&invitation_id, now).await?;

            if invitation.inviter_user_id != acting_user_id
                && !self
                    .members
                    .has_role(&invitation.org_id, acting_user_id, OrgRole::Admin)
                    .await?
            {
                tracing::warn!("Invitation revoke denied");
                return Err(IdentityError::Forbidden(format!(
                    "{} cannot revoke this invitation",
                    acting_user_id
                )));
            }

            match self
                .commit_transition(version, &invitation, InvitationState::Revoked, Vec::new(), now)
                .await?
            {
                TxnOutcome::Committed => {
                    tracing::info!("Org invitation revoked");
                    return Ok(());
                }
                TxnOutcome::Aborted => continue,
            }
        }

        Err(contention("invitation"))
    }

    /// Current invitation. A pending one past its expiry is rewritten as
    /// `Expired` before it is returned.
    pub async fn get(&self, invitation_id: Uuid) -> Result<OrgInvitation, IdentityError> {
        for _ in 0..MAX_CAS_RETRIES {
            let now = self.clock.now();
            let (version, invitation) = self
                .load(&invitation_id)
                .await?
                .ok_or_else(|| IdentityError::NotFound("Invitation".to_string()))?;

            if invitation.state != InvitationState::Pending || !invitation.is_expired_at(now) {
                return Ok(invitation);
            }

            match self
                .commit_transition(version, &invitation, InvitationState::Expired, Vec::new(), now)
                .await?
            {
                TxnOutcome::Committed => {
                    return Ok(invitation.transitioned(InvitationState::Expired, now));
                }
                TxnOutcome::Aborted => continue,
            }
        }

        Err(contention("invitation"))
    }

    /// Pending, unexpired invitations for `org_id`.
    pub async fn list_pending(&self, org_id: &str) -> Result<Vec<OrgInvitation>, IdentityError> {
        let now = self.clock.now();
        let slots = self.gateway.scan_prefix(&pending_prefix(org_id)).await?;

        let mut pending = Vec::with_capacity(slots.len());
        for (_, slot) in slots {
            let Some(id) = parse_invitation_id(&slot.value) else {
                continue;
            };
            let Some((version, invitation)) = self.load(&id).await? else {
                continue;
            };
            match invitation.effective_state(now) {
                InvitationState::Pending => pending.push(invitation),
                InvitationState::Expired if invitation.state == InvitationState::Pending => {
                    // Losing this race only means someone else moved it on.
                    self.commit_transition(
                        version,
                        &invitation,
                        InvitationState::Expired,
                        Vec::new(),
                        now,
                    )
                    .await?;
                }
                _ => {}
            }
        }

        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(pending)
    }

    async fn load(&self, id: &Uuid) -> Result<Option<(u64, OrgInvitation)>, IdentityError> {
        match self.gateway.get(&invitation_key(id)).await? {
            Some(record) => Ok(Some((record.version, decode(&record.value)?))),
            None => Ok(None),
        }
    }

    /// Load an invitation that is about to be transitioned.
    ///
    /// Terminal rows fail `InvalidTransition`, except expired ones which
    /// fail `Expired`. A pending row past its expiry is persisted as
    /// `Expired` on the way.
    async fn load_pending(
        &self,
        id: &Uuid,
        now: DateTime<Utc>,
    ) -> Result<(u64, OrgInvitation), IdentityError> {
        for _ in 0..MAX_CAS_RETRIES {
            let (version, invitation) = self
                .load(id)
                .await?
                .ok_or_else(|| IdentityError::NotFound("Invitation".to_string()))?;

            match invitation.state {
                InvitationState::Pending if invitation.is_expired_at(now) => {
                    match self
                        .commit_transition(
                            version,
                            &invitation,
                            InvitationState::Expired,
                            Vec::new(),
                            now,
                        )
                        .await?
                    {
                        TxnOutcome::Committed => {
                            tracing::info!(invitation_id = %id, "Org invitation expired");
                            return Err(IdentityError::Expired);
                        }
                        TxnOutcome::Aborted => continue,
                    }
                }
                InvitationState::Pending => return Ok((version, invitation)),
                InvitationState::Expired => return Err(IdentityError::Expired),
                from => return Err(IdentityError::InvalidTransition { from }),
            }
        }

        Err(contention("invitation"))
    }

    /// Move `invitation` (read at `version`) to `next`, releasing its
    /// pending slot and applying `extra` in the same transaction.
    async fn commit_transition(
        &self,
        version: u64,
        invitation: &OrgInvitation,
        next: InvitationState,
        extra: Vec<WriteOp>,
        now: DateTime<Utc>,
    ) -> Result<TxnOutcome, IdentityError> {
        if !invitation.state.can_transition_to(next) {
            return Err(IdentityError::InvalidTransition {
                from: invitation.state,
            });
        }

        let updated = invitation.transitioned(next, now);
        let mut ops = vec![WriteOp::CompareAndSet {
            key: invitation_key(&invitation.id),
            expected_version: Some(version),
            value: encode(&updated)?,
        }];

        let slot_key = pending_key(&invitation.org_id, &invitation.recipient);
        if let Some(slot) = self.gateway.get(&slot_key).await? {
            if parse_invitation_id(&slot.value) == Some(invitation.id) {
                ops.push(WriteOp::CompareAndDelete {
                    key: slot_key,
                    expected_version: slot.version,
                });
            }
        }
        ops.extend(extra);

        let outcome = self.gateway.transaction(ops).await?;
        if outcome == TxnOutcome::Aborted {
            tracing::debug!(invitation_id = %invitation.id, next = %next, "Invitation transition lost a race");
        }
        Ok(outcome)
    }
}
