//! Identity and trust layer: access tokens, organization membership and
//! invitations, linked external accounts and a TLS certificate cache.
//!
//! Everything hangs off an [`IdentityRegistry`] constructed at startup.

pub mod config;
pub mod models;
pub mod registry;
pub mod services;

pub use config::IdentityConfig;
pub use registry::{IdentityRegistry, IdentityRegistryBuilder};
pub use services::IdentityError;

use service_core::error::AppError;

/// Install the tracing subscriber described by `config`.
pub fn init_observability(config: &IdentityConfig) -> Result<(), AppError> {
    service_core::observability::init_tracing(
        &config.service_name,
        &config.common.log_level,
        config.common.otlp_endpoint.as_deref(),
    )
}
