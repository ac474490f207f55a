//! Repository providers consumed by the engine.

use std::sync::Arc;

use async_trait::async_trait;
use ocm_desc::ComponentDescriptor;
use ocm_oci::ComponentRepository;

use crate::Result;

/// Chooses the target repository a component is written to.
#[async_trait]
pub trait TargetRepositoryProvider: Send + Sync {
    /// Returns the repository the named component is written to.
    async fn repository_for(&self, component: &str) -> Result<Arc<dyn ComponentRepository>>;
}

/// Routes every component to one repository.
pub struct StaticTargetProvider {
    repository: Arc<dyn ComponentRepository>,
}

impl std::fmt::Debug for StaticTargetProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticTargetProvider").finish_non_exhaustive()
    }
}

impl StaticTargetProvider {
    /// Wraps a single repository.
    pub fn new(repository: Arc<dyn ComponentRepository>) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl TargetRepositoryProvider for StaticTargetProvider {
    async fn repository_for(&self, _component: &str) -> Result<Arc<dyn ComponentRepository>> {
        Ok(Arc::clone(&self.repository))
    }
}

/// Resolves component versions not declared in the constructor.
#[async_trait]
pub trait ExternalComponentProvider: Send + Sync {
    /// Looks up an external component version; `Ok(None)` means unknown.
    async fn lookup(&self, name: &str, version: &str) -> Result<Option<ComponentDescriptor>>;
}

/// Provider that knows no external components.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoExternalComponents;

#[async_trait]
impl ExternalComponentProvider for NoExternalComponents {
    async fn lookup(&self, _name: &str, _version: &str) -> Result<Option<ComponentDescriptor>> {
        Ok(None)
    }
}

/// Looks up external components in a component repository.
pub struct RepositoryComponentProvider {
    repository: Arc<dyn ComponentRepository>,
}

impl std::fmt::Debug for RepositoryComponentProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryComponentProvider")
            .finish_non_exhaustive()
    }
}

impl RepositoryComponentProvider {
    /// Wraps a repository as an external component source.
    pub fn new(repository: Arc<dyn ComponentRepository>) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl ExternalComponentProvider for RepositoryComponentProvider {
    async fn lookup(&self, name: &str, version: &str) -> Result<Option<ComponentDescriptor>> {
        match self.repository.get_component_version(name, version).await {
            Ok(descriptor) => Ok(Some(descriptor)),
            Err(ocm_oci::Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
