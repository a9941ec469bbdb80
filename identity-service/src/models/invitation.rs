//! Invitation model - organization invitations with pre-assigned roles.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::OrgRole;

/// Invitation states. Everything except `Pending` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvitationState {
    Pending,
    Accepted,
    Declined,
    Revoked,
    Expired,
}

impl InvitationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvitationState::Pending => "pending",
            InvitationState::Accepted => "accepted",
            InvitationState::Declined => "declined",
            InvitationState::Revoked => "revoked",
            InvitationState::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, InvitationState::Pending)
    }

    /// Only `Pending` has outgoing edges, and only into terminal states.
    pub fn can_transition_to(&self, next: InvitationState) -> bool {
        matches!(self, InvitationState::Pending) && next.is_terminal()
    }
}

impl std::fmt::Display for InvitationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who an invitation is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum InvitationRecipient {
    User(String),
    Email(String),
}

impl InvitationRecipient {
    pub fn user(user_id: impl Into<String>) -> Self {
        InvitationRecipient::User(user_id.into())
    }

    /// Emails are trimmed and lowercased so one address has one pending slot.
    pub fn email(address: &str) -> Self {
        InvitationRecipient::Email(address.trim().to_lowercase())
    }

    /// Stable identity used for the one-pending-invitation rule.
    pub fn key(&self) -> String {
        match self {
            InvitationRecipient::User(id) => format!("user:{}", id),
            InvitationRecipient::Email(address) => format!("email:{}", address.to_lowercase()),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            InvitationRecipient::User(v) | InvitationRecipient::Email(v) => v.trim().is_empty(),
        }
    }
}

/// Invitation entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgInvitation {
    pub id: Uuid,
    pub org_id: String,
    pub inviter_user_id: String,
    pub recipient: InvitationRecipient,
    pub role: OrgRole,
    pub state: InvitationState,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
}

impl OrgInvitation {
    /// Create a new pending invitation.
    pub fn new(
        org_id: String,
        inviter_user_id: String,
        recipient: InvitationRecipient,
        role: OrgRole,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            org_id,
            inviter_user_id,
            recipient,
            role,
            state: InvitationState::Pending,
            created_at: now,
            expires_at: now + ttl,
            responded_at: None,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// State as readers must see it: a pending invitation past its expiry
    /// is `Expired` whether or not the row has been rewritten yet.
    pub fn effective_state(&self, now: DateTime<Utc>) -> InvitationState {
        if self.state == InvitationState::Pending && self.is_expired_at(now) {
            InvitationState::Expired
        } else {
            self.state
        }
    }

    /// Copy of this invitation moved into `next`.
    pub fn transitioned(&self, next: InvitationState, now: DateTime<Utc>) -> Self {
        Self {
            state: next,
            responded_at: match next {
                InvitationState::Accepted | InvitationState::Declined | InvitationState::Revoked => {
                    Some(now)
                }
                _ => self.responded_at,
            },
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invitation(now: DateTime<Utc>) -> OrgInvitation {
        OrgInvitation::new(
            "7".to_string(),
            "u1".to_string(),
            InvitationRecipient::user("u2"),
            OrgRole::Member,
            now,
            Duration::hours(24),
        )
    }

    #[test]
    fn test_terminal_states_have_no_transitions() {
        use InvitationState::*;
        for from in [Accepted, Declined, Revoked, Expired] {
            for to in [Pending, Accepted, Declined, Revoked, Expired] {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
        assert!(Pending.can_transition_to(Accepted));
        assert!(!Pending.can_transition_to(Pending));
    }

    #[test]
    fn test_effective_state_expires_lazily() {
        let now = Utc::now();
        let inv = invitation(now);

        assert_eq!(inv.effective_state(now), InvitationState::Pending);
        assert_eq!(
            inv.effective_state(now + Duration::hours(24)),
            InvitationState::Expired
        );
    }

    #[test]
    fn test_effective_state_keeps_terminal_state() {
        let now = Utc::now();
        let declined = invitation(now).transitioned(InvitationState::Declined, now);
        assert_eq!(
            declined.effective_state(now + Duration::days(30)),
            InvitationState::Declined
        );
        assert_eq!(declined.responded_at, Some(now));
    }

    #[test]
    fn test_email_recipient_is_case_insensitive() {
        assert_eq!(
            InvitationRecipient::email(" Dev@Example.com ").key(),
            InvitationRecipient::email("dev@example.com").key()
        );
        assert_ne!(
            InvitationRecipient::user("dev@example.com").key(),
            InvitationRecipient::email("dev@example.com").key()
        );
    }
}
