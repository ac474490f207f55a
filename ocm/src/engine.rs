//! The construction engine.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ocm_desc::{
    ComponentDescriptor, DigestSpec, Identity, Reference, Resource, ResourceRelation, Source,
};
use ocm_oci::{ComponentRepository, ResourceRepository};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::constructor::{Constructor, ConstructorComponent, CopyPolicy, ResourceSpec, SourceSpec};
use crate::graph::{ComponentGraph, NodeKind};
use crate::hooks::{ConstructionHooks, NoopHooks};
use crate::input::{CredentialResolver, Credentials, InputMethodRegistry, InputResult};
use crate::provider::{ExternalComponentProvider, NoExternalComponents, TargetRepositoryProvider};
use crate::{Error, Result};

/// Behavior when the target already holds a component version.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConflictPolicy {
    /// Fail with the existing descriptor in the error payload.
    #[default]
    AbortAndFail,
    /// Return the existing descriptor, bypassing construction.
    Skip,
    /// Overwrite the existing version.
    Replace,
}

/// Behavior for discovered external components.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum ExternalComponentPolicy {
    /// Record the descriptor without writing it to the target.
    #[default]
    SkipExternal,
    /// Push the descriptor unchanged into the target repository.
    CopyExternal,
}

/// Tunables for a [`ConstructionEngine`].
#[derive(Clone, Copy, Debug)]
#[allow(clippy::exhaustive_structs)]
pub struct ConstructOptions {
    /// Worker pool bound for component and element fan-out.
    pub concurrency: usize,
    /// Conflict behavior against the target repository.
    pub conflict_policy: ConflictPolicy,
    /// Handling of discovered external components.
    pub external_policy: ExternalComponentPolicy,
}

impl Default for ConstructOptions {
    fn default() -> Self {
        Self {
            concurrency: std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(4),
            conflict_policy: ConflictPolicy::default(),
            external_policy: ExternalComponentPolicy::default(),
        }
    }
}

type ProcessedMap = Arc<Mutex<HashMap<Identity, ComponentDescriptor>>>;

/// Everything a construction task needs, shared by `Arc`.
struct EngineShared {
    target: Arc<dyn TargetRepositoryProvider>,
    resources: Option<Arc<dyn ResourceRepository>>,
    inputs: Arc<InputMethodRegistry>,
    credentials: Option<Arc<dyn CredentialResolver>>,
    hooks: Arc<dyn ConstructionHooks>,
    options: ConstructOptions,
    digest_cache: Arc<Mutex<HashMap<Identity, DigestSpec>>>,
}

impl EngineShared {
    /// Cached canonical digest of a reference target. The computation runs
    /// under the cache lock so each identity is digested at most once.
    fn reference_digest(
        &self,
        identity: &Identity,
        descriptor: &ComponentDescriptor,
    ) -> Result<DigestSpec> {
        let mut cache = lock(&self.digest_cache);
        if let Some(digest) = cache.get(identity) {
            return Ok(digest.clone());
        }
        let digest = ocm_desc::normalisation::digest_v4alpha1(descriptor)?;
        cache.insert(identity.clone(), digest.clone());
        Ok(digest)
    }
}

/// Materializes constructor documents into stored component versions.
pub struct ConstructionEngine {
    target: Arc<dyn TargetRepositoryProvider>,
    external: Arc<dyn ExternalComponentProvider>,
    resources: Option<Arc<dyn ResourceRepository>>,
    inputs: Arc<InputMethodRegistry>,
    credentials: Option<Arc<dyn CredentialResolver>>,
    hooks: Arc<dyn ConstructionHooks>,
    options: ConstructOptions,
    digest_cache: Arc<Mutex<HashMap<Identity, DigestSpec>>>,
}

impl std::fmt::Debug for ConstructionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConstructionEngine")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl ConstructionEngine {
    /// Engine writing to the given target, with default input methods, no
    /// external components, and default options.
    pub fn new(target: Arc<dyn TargetRepositoryProvider>) -> Self {
        Self {
            target,
            external: Arc::new(NoExternalComponents),
            resources: None,
            inputs: Arc::new(InputMethodRegistry::with_defaults()),
            credentials: None,
            hooks: Arc::new(NoopHooks),
            options: ConstructOptions::default(),
            digest_cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Sets the external component provider.
    pub fn with_external(mut self, external: Arc<dyn ExternalComponentProvider>) -> Self {
        self.external = external;
        self
    }

    /// Sets the resource repository used for by-value copies and digest
    /// pinning.
    pub fn with_resource_repository(mut self, resources: Arc<dyn ResourceRepository>) -> Self {
        self.resources = Some(resources);
        self
    }

    /// Replaces the input method registry.
    pub fn with_input_methods(mut self, inputs: InputMethodRegistry) -> Self {
        self.inputs = Arc::new(inputs);
        self
    }

    /// Sets the credential resolver consulted by input methods.
    pub fn with_credential_resolver(mut self, credentials: Arc<dyn CredentialResolver>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Installs lifecycle hooks.
    pub fn with_hooks(mut self, hooks: Arc<dyn ConstructionHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Overrides the engine options.
    pub fn with_options(mut self, options: ConstructOptions) -> Self {
        self.options = options;
        self
    }

    /// Builds every component of the constructor.
    ///
    /// The reference graph is discovered first, then processed leaves-first
    /// under a bounded worker pool, so a referrer is only assembled once
    /// the descriptors of all its references are materialized and their
    /// digests known. Returns the constructed descriptors in declaration
    /// order; the first failing task cancels its siblings.
    pub async fn construct(&self, constructor: &Constructor) -> Result<Vec<ComponentDescriptor>> {
        constructor.validate()?;
        if constructor.components.is_empty() {
            return Ok(Vec::new());
        }

        let graph = Arc::new(
            ComponentGraph::discover(constructor, &self.external, self.options.concurrency)
                .await?,
        );
        let constructor = Arc::new(constructor.clone());
        let processed: ProcessedMap = Arc::new(Mutex::new(HashMap::new()));
        let shared = Arc::new(EngineShared {
            target: Arc::clone(&self.target),
            resources: self.resources.clone(),
            inputs: Arc::clone(&self.inputs),
            credentials: self.credentials.clone(),
            hooks: Arc::clone(&self.hooks),
            options: self.options,
            digest_cache: Arc::clone(&self.digest_cache),
        });

        let mut remaining = graph.dependency_counts();
        let mut ready: Vec<Identity> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(identity, _)| identity.clone())
            .collect();
        let limit = self.options.concurrency.max(1);
        let mut in_flight = 0usize;
        let mut tasks: JoinSet<Result<Identity>> = JoinSet::new();

        loop {
            while in_flight < limit {
                let Some(identity) = ready.pop() else { break };
                let shared = Arc::clone(&shared);
                let graph = Arc::clone(&graph);
                let constructor = Arc::clone(&constructor);
                let processed = Arc::clone(&processed);
                in_flight += 1;
                tasks.spawn(async move {
                    process_node(&shared, graph.as_ref(), constructor.as_ref(), &processed, &identity)
                        .await?;
                    Ok(identity)
                });
            }

            let Some(joined) = tasks.join_next().await else { break };
            in_flight -= 1;
            match joined {
                Ok(Ok(identity)) => {
                    for parent in graph.dependents(&identity) {
                        if let Some(count) = remaining.get_mut(parent) {
                            *count = count.saturating_sub(1);
                            if *count == 0 {
                                ready.push(parent.clone());
                            }
                        }
                    }
                }
                Ok(Err(e)) => {
                    tasks.abort_all();
                    return Err(e);
                }
                Err(e) => {
                    tasks.abort_all();
                    return Err(Error::Cancelled(e.to_string()));
                }
            }
        }

        let processed = lock(&processed);
        constructor
            .components
            .iter()
            .map(|component| {
                processed
                    .get(&component.identity())
                    .cloned()
                    .ok_or_else(|| Error::MissingComponent(component.identity().to_string()))
            })
            .collect()
    }
}

async fn process_node(
    shared: &Arc<EngineShared>,
    graph: &ComponentGraph,
    constructor: &Constructor,
    processed: &ProcessedMap,
    identity: &Identity,
) -> Result<()> {
    match graph.kind(identity) {
        Some(NodeKind::External(descriptor)) => {
            let descriptor = (**descriptor).clone();
            match shared.options.external_policy {
                ExternalComponentPolicy::SkipExternal => {}
                ExternalComponentPolicy::CopyExternal => {
                    let repository = shared
                        .target
                        .repository_for(&descriptor.component.name)
                        .await?;
                    repository.add_component_version(&descriptor).await?;
                }
            }
            lock(processed).insert(identity.clone(), descriptor);
            Ok(())
        }
        Some(NodeKind::Constructor(index)) => {
            let component = &constructor.components[*index];
            let descriptor = construct_component(shared, processed, component).await?;
            lock(processed).insert(identity.clone(), descriptor);
            Ok(())
        }
        None => Err(Error::MissingComponent(identity.to_string())),
    }
}

/// Result slot of one element task.
enum Slot {
    Resource(usize, Resource),
    Source(usize, Source),
    Reference(usize, Reference),
}

async fn construct_component(
    shared: &Arc<EngineShared>,
    processed: &ProcessedMap,
    component: &ConstructorComponent,
) -> Result<ComponentDescriptor> {
    shared.hooks.on_start_component_construct(component).await;
    let repository = shared.target.repository_for(&component.name).await?;

    if repository
        .has_component_version(&component.name, &component.version)
        .await?
    {
        match shared.options.conflict_policy {
            ConflictPolicy::AbortAndFail => {
                let existing = repository
                    .get_component_version(&component.name, &component.version)
                    .await?;
                return Err(Error::AlreadyExists {
                    name: component.name.clone(),
                    version: component.version.clone(),
                    existing: Box::new(existing),
                });
            }
            ConflictPolicy::Skip => {
                let existing = repository
                    .get_component_version(&component.name, &component.version)
                    .await?;
                tracing::debug!(
                    component = %component.name,
                    version = %component.version,
                    "component version exists, skipping construction"
                );
                shared.hooks.on_end_component_construct(&existing).await;
                return Ok(existing);
            }
            ConflictPolicy::Replace => {
                tracing::warn!(
                    component = %component.name,
                    version = %component.version,
                    "replacing existing component version"
                );
            }
        }
    }

    let mut descriptor = ComponentDescriptor::new(
        &component.name,
        &component.version,
        component.provider.clone(),
    );
    descriptor.component.labels = component.labels.clone();

    let identity = component.identity();
    let semaphore = Arc::new(Semaphore::new(shared.options.concurrency.max(1)));
    let mut tasks: JoinSet<Result<Slot>> = JoinSet::new();

    for (index, spec) in component.resources.iter().enumerate() {
        let shared = Arc::clone(shared);
        let repository = Arc::clone(&repository);
        let identity = identity.clone();
        let version = component.version.clone();
        let spec = spec.clone();
        let permit = acquire(&semaphore).await?;
        tasks.spawn(async move {
            let _permit = permit;
            let resource = process_resource_spec(&shared, &repository, &identity, &version, &spec)
                .await?;
            Ok(Slot::Resource(index, resource))
        });
    }
    for (index, spec) in component.sources.iter().enumerate() {
        let shared = Arc::clone(shared);
        let repository = Arc::clone(&repository);
        let identity = identity.clone();
        let version = component.version.clone();
        let spec = spec.clone();
        let permit = acquire(&semaphore).await?;
        tasks.spawn(async move {
            let _permit = permit;
            let source = process_source_spec(&shared, &repository, &identity, &version, &spec)
                .await?;
            Ok(Slot::Source(index, source))
        });
    }
    for (index, reference) in component.references.iter().enumerate() {
        let shared = Arc::clone(shared);
        let processed = Arc::clone(processed);
        let identity = identity.clone();
        let reference = reference.clone();
        let permit = acquire(&semaphore).await?;
        tasks.spawn(async move {
            let _permit = permit;
            let reference = process_reference(&shared, &processed, &identity, reference).await?;
            Ok(Slot::Reference(index, reference))
        });
    }

    let mut resources: Vec<Option<Resource>> = vec![None; component.resources.len()];
    let mut sources: Vec<Option<Source>> = vec![None; component.sources.len()];
    let mut references: Vec<Option<Reference>> = vec![None; component.references.len()];
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(Slot::Resource(index, resource))) => resources[index] = Some(resource),
            Ok(Ok(Slot::Source(index, source))) => sources[index] = Some(source),
            Ok(Ok(Slot::Reference(index, reference))) => references[index] = Some(reference),
            Ok(Err(e)) => {
                tasks.abort_all();
                return Err(e);
            }
            Err(e) => {
                tasks.abort_all();
                return Err(Error::Cancelled(e.to_string()));
            }
        }
    }

    descriptor.component.resources = resources.into_iter().flatten().collect();
    descriptor.component.sources = sources.into_iter().flatten().collect();
    descriptor.component.references = references.into_iter().flatten().collect();
    descriptor.validate()?;

    repository.add_component_version(&descriptor).await?;
    shared.hooks.on_end_component_construct(&descriptor).await;
    Ok(descriptor)
}

async fn process_resource_spec(
    shared: &Arc<EngineShared>,
    repository: &Arc<dyn ComponentRepository>,
    component: &Identity,
    component_version: &str,
    spec: &ResourceSpec,
) -> Result<Resource> {
    shared
        .hooks
        .on_start_resource_construct(component, spec)
        .await;
    let component_name = component.name().unwrap_or_default().to_owned();

    let resource = if let Some(input) = &spec.input {
        let method = shared.inputs.resource_method(&input.kind)?;
        let credentials =
            resolve_credentials(shared, method.credential_identity(spec)).await?;
        match method.process_resource(spec, credentials.as_ref()).await? {
            InputResult::Processed(resource) => *resource,
            InputResult::Blob(blob) => {
                let mut resource = resource_from_spec(spec);
                apply_local_defaults(&mut resource, component_version);
                repository
                    .add_local_resource(&component_name, component_version, &resource, blob)
                    .await?
            }
        }
    } else {
        let mut resource = resource_from_spec(spec);
        match spec.copy_policy {
            Some(CopyPolicy::ByValue) => {
                let transfer = shared.resources.as_ref().ok_or_else(|| {
                    Error::Validation(format!(
                        "resource {:?} needs a resource repository for byValue copying",
                        spec.meta.name
                    ))
                })?;
                let blob = transfer.download_resource(&resource).await?;
                apply_local_defaults(&mut resource, component_version);
                repository
                    .add_local_resource(&component_name, component_version, &resource, blob)
                    .await?
            }
            _ => {
                // By reference: keep the pointer; pin the digest when a
                // processor is available and understands the access.
                if let Some(transfer) = &shared.resources {
                    match transfer.process_resource_digest(resource.clone()).await {
                        Ok(pinned) => resource = pinned,
                        Err(ocm_oci::Error::Unsupported(_)) => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                resource
            }
        }
    };

    shared
        .hooks
        .on_end_resource_construct(component, &resource)
        .await;
    Ok(resource)
}

async fn process_source_spec(
    shared: &Arc<EngineShared>,
    repository: &Arc<dyn ComponentRepository>,
    component: &Identity,
    component_version: &str,
    spec: &SourceSpec,
) -> Result<Source> {
    shared.hooks.on_start_source_construct(component, spec).await;
    let component_name = component.name().unwrap_or_default().to_owned();

    let source = if let Some(input) = &spec.input {
        let method = shared.inputs.source_method(&input.kind)?;
        let credentials =
            resolve_credentials(shared, method.credential_identity(spec)).await?;
        match method.process_source(spec, credentials.as_ref()).await? {
            InputResult::Processed(source) => *source,
            InputResult::Blob(blob) => {
                let mut source = source_from_spec(spec);
                if source.meta.version.is_empty() {
                    source.meta.version = component_version.to_owned();
                }
                repository
                    .add_local_source(&component_name, component_version, &source, blob)
                    .await?
            }
        }
    } else {
        source_from_spec(spec)
    };

    shared.hooks.on_end_source_construct(component, &source).await;
    Ok(source)
}

async fn process_reference(
    shared: &Arc<EngineShared>,
    processed: &ProcessedMap,
    component: &Identity,
    mut reference: Reference,
) -> Result<Reference> {
    shared
        .hooks
        .on_start_reference_construct(component, &reference)
        .await;

    let target = reference.component_identity();
    // Reverse-topological processing guarantees the target is done.
    let descriptor = lock(processed)
        .get(&target)
        .cloned()
        .ok_or_else(|| Error::MissingComponent(target.to_string()))?;
    reference.digest = Some(shared.reference_digest(&target, &descriptor)?);

    shared
        .hooks
        .on_end_reference_construct(component, &reference)
        .await;
    Ok(reference)
}

async fn resolve_credentials(
    shared: &EngineShared,
    identity: Option<Identity>,
) -> Result<Option<Credentials>> {
    match (identity, &shared.credentials) {
        (Some(identity), Some(resolver)) => resolver.resolve(&identity).await,
        // The method exposes no identity: proceed without credentials.
        _ => Ok(None),
    }
}

fn resource_from_spec(spec: &ResourceSpec) -> Resource {
    Resource {
        meta: spec.meta.clone(),
        resource_type: spec.resource_type.clone(),
        relation: spec.relation,
        source_refs: spec.source_refs.clone(),
        digest: None,
        size: None,
        creation_time: None,
        access: spec.access.clone(),
    }
}

fn source_from_spec(spec: &SourceSpec) -> Source {
    Source {
        meta: spec.meta.clone(),
        source_type: spec.source_type.clone(),
        access: spec.access.clone(),
    }
}

/// Defaulting rules for locally uploaded blobs.
fn apply_local_defaults(resource: &mut Resource, component_version: &str) {
    if resource.relation.is_none() {
        resource.relation = Some(ResourceRelation::Local);
    }
    if resource.meta.version.is_empty() {
        resource.meta.version = component_version.to_owned();
    }
}

async fn acquire(semaphore: &Arc<Semaphore>) -> Result<tokio::sync::OwnedSemaphorePermit> {
    Arc::clone(semaphore)
        .acquire_owned()
        .await
        .map_err(|e| Error::Cancelled(e.to_string()))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
