//! Services layer for identity-service.
//!
//! Stores persist through [`PersistenceGateway`] and serialise concurrent
//! writers with per-key compare-and-set; none of them holds a lock across
//! gateway calls.

mod access_token;
pub mod cert_cache;
mod clock;
pub mod error;
mod external_account;
mod invitation;
mod membership;
pub mod package_index;
mod secret;

pub use access_token::AccessTokenStore;
pub use cert_cache::{CertCache, CertificateFetcher};
pub use clock::{Clock, MockClock, SystemClock};
pub use error::IdentityError;
pub use external_account::ExternalAccountStore;
pub use invitation::OrgInvitationStore;
pub use membership::OrgMembershipStore;
pub use package_index::{
    DependencyIndex, DependencyQuery, DependencyReference, NoOpProvider, PackageIndex, PackageInfo,
    PackageQuery,
};
pub use secret::{OsSecretGenerator, SecretGenerator};

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Attempts at a read-check-CAS cycle before reporting contention.
pub(crate) const MAX_CAS_RETRIES: usize = 16;

pub(crate) fn encode<T: Serialize>(record: &T) -> Result<Vec<u8>, IdentityError> {
    Ok(serde_json::to_vec(record)?)
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, IdentityError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Escape a caller-supplied id for use as one `:`-separated key segment.
pub(crate) fn key_part(raw: &str) -> String {
    raw.replace('%', "%25").replace(':', "%3A")
}

pub(crate) fn require_non_empty(field: &str, value: &str) -> Result<(), IdentityError> {
    if value.trim().is_empty() {
        return Err(IdentityError::Validation(format!("{} must not be empty", field)));
    }
    Ok(())
}

pub(crate) fn contention(what: &str) -> IdentityError {
    IdentityError::Conflict(format!("{} is being modified concurrently; retry", what))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_part_keeps_segments_apart() {
        assert_eq!(key_part("a:b"), "a%3Ab");
        assert_ne!(key_part("a%3Ab"), key_part("a:b"));
        assert_eq!(key_part("plain"), "plain");
    }

    #[test]
    fn test_require_non_empty() {
        assert!(require_non_empty("user_id", "u1").is_ok());
        assert!(matches!(
            require_non_empty("user_id", "  "),
            Err(IdentityError::Validation(_))
        ));
    }
}
