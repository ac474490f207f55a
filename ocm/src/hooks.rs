//! Lifecycle hooks observing the construction pipeline.

use async_trait::async_trait;
use ocm_desc::{ComponentDescriptor, Identity, Reference, Resource, Source};

use crate::constructor::{ConstructorComponent, ResourceSpec, SourceSpec};

/// Observer of per-element construction steps.
///
/// Hooks see intermediate state but cannot mutate it; every argument is a
/// shared borrow. The default implementation of each hook does nothing.
#[async_trait]
#[allow(unused_variables)]
pub trait ConstructionHooks: Send + Sync {
    /// A component is about to be constructed.
    async fn on_start_component_construct(&self, component: &ConstructorComponent) {}

    /// A component descriptor was finalized and persisted.
    async fn on_end_component_construct(&self, descriptor: &ComponentDescriptor) {}

    /// A resource is about to be processed.
    async fn on_start_resource_construct(&self, component: &Identity, resource: &ResourceSpec) {}

    /// A resource finished processing.
    async fn on_end_resource_construct(&self, component: &Identity, resource: &Resource) {}

    /// A source is about to be processed.
    async fn on_start_source_construct(&self, component: &Identity, source: &SourceSpec) {}

    /// A source finished processing.
    async fn on_end_source_construct(&self, component: &Identity, source: &Source) {}

    /// A reference is about to be digested.
    async fn on_start_reference_construct(&self, component: &Identity, reference: &Reference) {}

    /// A reference was digested.
    async fn on_end_reference_construct(&self, component: &Identity, reference: &Reference) {}
}

/// Hooks that observe nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopHooks;

#[async_trait]
impl ConstructionHooks for NoopHooks {}
