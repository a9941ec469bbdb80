use service_core::error::{AppError, StorageError};
use thiserror::Error;

use crate::models::InvitationState;

/// Message shared by every authentication failure so callers cannot tell
/// an unknown token from an expired or revoked one.
pub const AUTHENTICATION_FAILED_MESSAGE: &str = "Invalid or expired access token";

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Expired")]
    Expired,

    #[error("Access token revoked")]
    Revoked,

    #[error("Unauthenticated")]
    Unauthenticated,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid transition: invitation is {from}")]
    InvalidTransition { from: InvitationState },

    #[error("Invalid scope: {0}")]
    InvalidScope(String),

    #[error("Certificate fetch failed for {host_key}: {reason}")]
    FetchFailed { host_key: String, reason: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IdentityError {
    /// Stable label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            IdentityError::NotFound(_) => "not_found",
            IdentityError::Conflict(_) => "conflict",
            IdentityError::Expired => "expired",
            IdentityError::Revoked => "revoked",
            IdentityError::Unauthenticated => "unauthenticated",
            IdentityError::Forbidden(_) => "forbidden",
            IdentityError::InvalidTransition { .. } => "invalid_transition",
            IdentityError::InvalidScope(_) => "invalid_scope",
            IdentityError::FetchFailed { .. } => "fetch_failed",
            IdentityError::Validation(_) => "validation",
            IdentityError::Storage(_) => "storage",
            IdentityError::Internal(_) => "internal",
        }
    }

    pub fn is_authentication_failure(&self) -> bool {
        matches!(
            self,
            IdentityError::Unauthenticated | IdentityError::Expired | IdentityError::Revoked
        )
    }
}

impl From<serde_json::Error> for IdentityError {
    fn from(err: serde_json::Error) -> Self {
        IdentityError::Internal(anyhow::Error::new(err).context("record serialization failed"))
    }
}

impl From<IdentityError> for AppError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::Unauthenticated | IdentityError::Expired | IdentityError::Revoked => {
                AppError::AuthError(anyhow::anyhow!(AUTHENTICATION_FAILED_MESSAGE))
            }
            IdentityError::NotFound(what) => AppError::NotFound(anyhow::anyhow!("{} not found", what)),
            IdentityError::Conflict(msg) => AppError::Conflict(anyhow::anyhow!(msg)),
            IdentityError::Forbidden(msg) => AppError::Forbidden(anyhow::anyhow!(msg)),
            IdentityError::InvalidTransition { from } => AppError::Conflict(anyhow::anyhow!(
                "Invitation is already {}",
                from
            )),
            IdentityError::InvalidScope(scope) => {
                AppError::BadRequest(anyhow::anyhow!("Invalid scope: {}", scope))
            }
            IdentityError::Validation(msg) => AppError::BadRequest(anyhow::anyhow!(msg)),
            IdentityError::FetchFailed { host_key, reason } => {
                AppError::BadGateway(format!("certificate for {}: {}", host_key, reason))
            }
            IdentityError::Storage(e) => AppError::from(e),
            IdentityError::Internal(e) => AppError::InternalError(e),
        }
    }
}
