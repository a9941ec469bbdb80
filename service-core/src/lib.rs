//! service-core: Shared infrastructure for platform services.
pub mod config;
pub mod error;
pub mod observability;
pub mod persistence;
pub mod utils;

pub use async_trait;
pub use tracing;
