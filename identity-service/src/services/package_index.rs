//! Dependency and package metadata index capabilities.
//!
//! Callers hold these as `Arc<dyn DependencyIndex>` / `Arc<dyn PackageIndex>`
//! so a real provider can replace [`NoOpProvider`] without touching them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::IdentityError;

/// A dependency declared by a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyReference {
    pub repo_id: String,
    pub language: String,
    pub name: String,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyQuery {
    pub language: String,
    pub name: String,
    pub limit: Option<usize>,
}

/// A package published by a repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageInfo {
    pub repo_id: String,
    pub language: String,
    pub name: String,
    pub version: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageQuery {
    pub language: Option<String>,
    pub name_prefix: Option<String>,
    pub limit: Option<usize>,
}

#[async_trait]
pub trait DependencyIndex: Send + Sync {
    /// Replace everything indexed for `repo_id` with `dependencies`.
    async fn update_index(
        &self,
        repo_id: &str,
        dependencies: Vec<DependencyReference>,
    ) -> Result<(), IdentityError>;

    /// Repositories depending on the queried package.
    async fn dependencies(
        &self,
        query: &DependencyQuery,
    ) -> Result<Vec<DependencyReference>, IdentityError>;
}

#[async_trait]
pub trait PackageIndex: Send + Sync {
    async fn update_index(&self, repo_id: &str, packages: Vec<PackageInfo>)
        -> Result<(), IdentityError>;

    async fn list_packages(&self, query: &PackageQuery) -> Result<Vec<PackageInfo>, IdentityError>;
}

/// Index provider that accepts every update and finds nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpProvider;

#[async_trait]
impl DependencyIndex for NoOpProvider {
    async fn update_index(
        &self,
        repo_id: &str,
        dependencies: Vec<DependencyReference>,
    ) -> Result<(), IdentityError> {
        tracing::debug!(repo_id = %repo_id, count = dependencies.len(), "Dependency index update ignored");
        Ok(())
    }

    async fn dependencies(
        &self,
        _query: &DependencyQuery,
    ) -> Result<Vec<DependencyReference>, IdentityError> {
        Ok(Vec::new())
    }
}

#[async_trait]
impl PackageIndex for NoOpProvider {
    async fn update_index(
        &self,
        repo_id: &str,
        packages: Vec<PackageInfo>,
    ) -> Result<(), IdentityError> {
        tracing::debug!(repo_id = %repo_id, count = packages.len(), "Package index update ignored");
        Ok(())
    }

    async fn list_packages(&self, _query: &PackageQuery) -> Result<Vec<PackageInfo>, IdentityError> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_noop_dependency_index() {
        let index: Arc<dyn DependencyIndex> = Arc::new(NoOpProvider);
        index
            .update_index(
                "repo-1",
                vec![DependencyReference {
                    repo_id: "repo-1".to_string(),
                    language: "rust".to_string(),
                    name: "serde".to_string(),
                    version: Some("1.0".to_string()),
                }],
            )
            .await
            .unwrap();

        let query = DependencyQuery {
            language: "rust".to_string(),
            name: "serde".to_string(),
            limit: None,
        };
        assert!(index.dependencies(&query).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_noop_package_index() {
        let index: Arc<dyn PackageIndex> = Arc::new(NoOpProvider);
        index
            .update_index(
                "repo-1",
                vec![PackageInfo {
                    repo_id: "repo-1".to_string(),
                    language: "rust".to_string(),
                    name: "identity-service".to_string(),
                    version: None,
                    metadata: serde_json::json!({ "license": "MIT" }),
                }],
            )
            .await
            .unwrap();

        assert!(index
            .list_packages(&PackageQuery::default())
            .await
            .unwrap()
            .is_empty());
    }
}
