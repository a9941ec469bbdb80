pub mod access_token;
pub mod certificate;
pub mod external_account;
pub mod invitation;
pub mod org_membership;

pub use access_token::{AccessToken, AccessTokenMetadata, IssuedToken, TokenIdentity, TOKEN_PREFIX};
pub use certificate::{CachedCertificate, FetchedCertificate};
pub use external_account::ExternalAccount;
pub use invitation::{InvitationRecipient, InvitationState, OrgInvitation};
pub use org_membership::{Actor, OrgMembership, OrgRole};
