use std::sync::Arc;

use service_core::error::AppError;
use service_core::persistence::PersistenceGateway;

use crate::config::IdentityConfig;
use crate::services::{
    AccessTokenStore, CertCache, CertificateFetcher, Clock, DependencyIndex, ExternalAccountStore,
    NoOpProvider, OrgInvitationStore, OrgMembershipStore, OsSecretGenerator, PackageIndex,
    SecretGenerator, SystemClock,
};

/// Handles to every identity store, built once at startup and passed to
/// request handlers. Clones share the underlying stores.
#[derive(Clone)]
pub struct IdentityRegistry {
    pub config: IdentityConfig,
    pub access_tokens: AccessTokenStore,
    pub external_accounts: ExternalAccountStore,
    pub org_members: OrgMembershipStore,
    pub org_invitations: OrgInvitationStore,
    pub cert_cache: CertCache,
    pub dependency_index: Arc<dyn DependencyIndex>,
    pub package_index: Arc<dyn PackageIndex>,
    gateway: Arc<dyn PersistenceGateway>,
}

impl IdentityRegistry {
    /// Registry on the system clock, OS randomness and no-op index providers.
    pub fn new(
        config: IdentityConfig,
        gateway: Arc<dyn PersistenceGateway>,
        fetcher: Arc<dyn CertificateFetcher>,
    ) -> Result<Self, AppError> {
        Self::builder(config, gateway, fetcher).build()
    }

    pub fn builder(
        config: IdentityConfig,
        gateway: Arc<dyn PersistenceGateway>,
        fetcher: Arc<dyn CertificateFetcher>,
    ) -> IdentityRegistryBuilder {
        IdentityRegistryBuilder {
            config,
            gateway,
            fetcher,
            clock: Arc::new(SystemClock),
            secrets: Arc::new(OsSecretGenerator),
            dependency_index: Arc::new(NoOpProvider),
            package_index: Arc::new(NoOpProvider),
        }
    }

    pub async fn health_check(&self) -> Result<(), AppError> {
        self.gateway.health_check().await.map_err(|e| {
            tracing::error!("Persistence health check failed: {}", e);
            AppError::from(e)
        })
    }
}

pub struct IdentityRegistryBuilder {
    config: IdentityConfig,
    gateway: Arc<dyn PersistenceGateway>,
    fetcher: Arc<dyn CertificateFetcher>,
    clock: Arc<dyn Clock>,
    secrets: Arc<dyn SecretGenerator>,
    dependency_index: Arc<dyn DependencyIndex>,
    package_index: Arc<dyn PackageIndex>,
}

impl IdentityRegistryBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn secret_generator(mut self, secrets: Arc<dyn SecretGenerator>) -> Self {
        self.secrets = secrets;
        self
    }

    pub fn dependency_index(mut self, index: Arc<dyn DependencyIndex>) -> Self {
        self.dependency_index = index;
        self
    }

    pub fn package_index(mut self, index: Arc<dyn PackageIndex>) -> Self {
        self.package_index = index;
        self
    }

    pub fn build(self) -> Result<IdentityRegistry, AppError> {
        self.config.validate()?;

        let org_members = OrgMembershipStore::new(self.gateway.clone(), self.clock.clone());
        let registry = IdentityRegistry {
            access_tokens: AccessTokenStore::new(
                self.gateway.clone(),
                self.clock.clone(),
                self.secrets,
                self.config.tokens.clone(),
            ),
            external_accounts: ExternalAccountStore::new(self.gateway.clone(), self.clock.clone()),
            org_invitations: OrgInvitationStore::new(
                self.gateway.clone(),
                self.clock.clone(),
                org_members.clone(),
                self.config.invitations.clone(),
            ),
            org_members,
            cert_cache: CertCache::new(self.fetcher, self.clock, &self.config.cert_cache),
            dependency_index: self.dependency_index,
            package_index: self.package_index,
            gateway: self.gateway,
            config: self.config,
        };

        tracing::info!(
            service = %registry.config.service_name,
            environment = ?registry.config.environment,
            "Identity registry initialized"
        );
        Ok(registry)
    }
}
