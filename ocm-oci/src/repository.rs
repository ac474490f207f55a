//! Component versions as OCI manifests.
//!
//! A component version `name:version` is persisted as an image manifest
//! tagged `component-descriptors/<name>:<version>`: the config points at
//! the descriptor layer, further layers carry colocated local blobs, and
//! the manifest's subject is the fixed Component Index so referrer queries
//! enumerate versions.

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use ocm_desc::normalisation::{GENERIC_BLOB_DIGEST_V1, HASH_ALGORITHM_SHA256};
use ocm_desc::{
    ACCESS_TYPE_LOCAL_BLOB, ComponentDescriptor, DigestSpec, Identity, LocalBlobAccess, Resource,
    Source, TypedSpec,
};
use tokio::task::JoinSet;

use crate::manifest::{
    ArtifactKind, ComponentConfig, artifact_annotation, blob_descriptor,
    component_index_descriptor, component_version_annotation, decode_descriptor_layer,
    parse_component_version_annotation,
};
use crate::store::{Blob, OciDescriptor, OciImageIndex, OciImageManifest, OciStore, StoreProvider};
use crate::{
    ANNOTATION_ARTIFACT, ANNOTATION_COMPONENT_VERSION, ANNOTATION_CREATOR,
    ANNOTATION_IMAGE_TITLE, ANNOTATION_IMAGE_VERSION, COMPONENT_DESCRIPTOR_PREFIX, CREATOR, Error,
    MEDIA_TYPE_COMPONENT_CONFIG, MEDIA_TYPE_COMPONENT_DESCRIPTOR, MEDIA_TYPE_DESCRIPTOR_JSON,
    MEDIA_TYPE_IMAGE_INDEX, MEDIA_TYPE_IMAGE_MANIFEST, OciReference, Result,
};

/// How versions of a component are enumerated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum ListingPolicy {
    /// Query referrers of the Component Index, fall back to tag listing on
    /// error or empty result.
    #[default]
    ReferrerWithTagFallback,
    /// Enumerate and validate tags only.
    TagOnly,
}

/// Read/write access to component versions in a repository.
#[async_trait]
pub trait ComponentRepository: Send + Sync {
    /// Persists a component version; overwrites an existing tag.
    async fn add_component_version(&self, descriptor: &ComponentDescriptor) -> Result<()>;

    /// Reads a component version by name and version.
    async fn get_component_version(&self, name: &str, version: &str)
    -> Result<ComponentDescriptor>;

    /// Returns `true` if the component version exists.
    async fn has_component_version(&self, name: &str, version: &str) -> Result<bool> {
        match self.get_component_version(name, version).await {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Lists versions of a component, descending by relaxed semver.
    async fn list_component_versions(&self, name: &str) -> Result<Vec<String>>;

    /// Uploads a blob colocated with the component version and returns the
    /// resource rewritten to a `localBlob` access.
    async fn add_local_resource(
        &self,
        component: &str,
        version: &str,
        resource: &Resource,
        blob: Blob,
    ) -> Result<Resource>;

    /// Uploads a blob colocated with the component version and returns the
    /// source rewritten to a `localBlob` access.
    async fn add_local_source(
        &self,
        component: &str,
        version: &str,
        source: &Source,
        blob: Blob,
    ) -> Result<Source>;

    /// Looks up a resource by identity and reads its local blob.
    async fn get_local_resource(
        &self,
        component: &str,
        version: &str,
        identity: &Identity,
    ) -> Result<(Resource, Vec<u8>)>;

    /// Looks up a source by identity and reads its local blob.
    async fn get_local_source(
        &self,
        component: &str,
        version: &str,
        identity: &Identity,
    ) -> Result<(Source, Vec<u8>)>;
}

/// [`ComponentRepository`] over any [`StoreProvider`].
pub struct OciComponentRepository {
    provider: Arc<dyn StoreProvider>,
    policy: ListingPolicy,
    creator: String,
}

impl std::fmt::Debug for OciComponentRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OciComponentRepository")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl OciComponentRepository {
    /// Creates a repository over the given store provider.
    pub fn new(provider: Arc<dyn StoreProvider>) -> Self {
        Self {
            provider,
            policy: ListingPolicy::default(),
            creator: CREATOR.to_owned(),
        }
    }

    /// Overrides the version listing policy.
    pub fn with_listing_policy(mut self, policy: ListingPolicy) -> Self {
        self.policy = policy;
        self
    }

    async fn store_for_component(&self, name: &str) -> Result<Arc<dyn OciStore>> {
        let reference = OciReference::parse(&format!("{COMPONENT_DESCRIPTOR_PREFIX}/{name}"))?;
        self.provider.store_for(&reference).await
    }

    /// Resolves an image-index manifest down to the component-version
    /// image manifest.
    async fn manifest_for(
        &self,
        store: &Arc<dyn OciStore>,
        desc: &OciDescriptor,
        data: Vec<u8>,
    ) -> Result<OciImageManifest> {
        if desc.media_type == MEDIA_TYPE_IMAGE_INDEX {
            let index: OciImageIndex = serde_json::from_slice(&data)?;
            let entry = index
                .manifests
                .iter()
                .find(|m| {
                    m.media_type == MEDIA_TYPE_IMAGE_MANIFEST
                        && m.annotation(ANNOTATION_COMPONENT_VERSION).is_some()
                })
                .or_else(|| {
                    index
                        .manifests
                        .iter()
                        .find(|m| m.media_type == MEDIA_TYPE_IMAGE_MANIFEST)
                })
                .ok_or_else(|| {
                    Error::MalformedManifest("image index holds no component manifest".into())
                })?;
            let manifest_data = store.fetch(entry).await?;
            return Ok(serde_json::from_slice(&manifest_data)?);
        }
        Ok(serde_json::from_slice(&data)?)
    }

    async fn list_by_referrers(&self, name: &str) -> Result<Vec<String>> {
        let store = self.store_for_component(name).await?;
        let referrers = store
            .referrers(&component_index_descriptor(), MEDIA_TYPE_COMPONENT_DESCRIPTOR)
            .await?;

        let mut versions = Vec::new();
        for referrer in referrers {
            let Some(annotation) = referrer.annotation(ANNOTATION_COMPONENT_VERSION) else {
                continue;
            };
            match parse_component_version_annotation(annotation) {
                Ok((annotated_name, version)) if annotated_name == name => versions.push(version),
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(error = %e, "skipping malformed componentversion annotation");
                }
            }
        }
        Ok(versions)
    }

    async fn list_by_tags(&self, name: &str) -> Result<Vec<String>> {
        let store = self.store_for_component(name).await?;
        let mut versions = Vec::new();
        for tag in store.tags(None).await? {
            let Ok(desc) = store.resolve(&tag).await else {
                continue;
            };
            if desc.media_type != MEDIA_TYPE_IMAGE_MANIFEST
                && desc.media_type != MEDIA_TYPE_IMAGE_INDEX
            {
                continue;
            }
            let Ok(data) = store.fetch(&desc).await else {
                continue;
            };
            let Ok(manifest) = self.manifest_for(&store, &desc, data).await else {
                continue;
            };
            let is_component_version = manifest.artifact_type.as_deref()
                == Some(MEDIA_TYPE_COMPONENT_DESCRIPTOR)
                || manifest.config.media_type == MEDIA_TYPE_COMPONENT_CONFIG;
            if is_component_version {
                versions.push(tag);
            }
        }
        Ok(versions)
    }

    async fn add_local_blob(
        &self,
        component: &str,
        blob: Blob,
    ) -> Result<(TypedSpec, DigestSpec, u64)> {
        let store = self.store_for_component(component).await?;
        let desc = blob.descriptor();
        let digest = blob.digest().to_owned();
        let size = blob.size();
        let media_type = desc.media_type.clone();
        store.push(&desc, blob.into_data()).await?;

        let access = LocalBlobAccess {
            media_type,
            local_reference: digest.clone(),
            global_access: None,
        }
        .into_spec()?;
        let hex = digest
            .strip_prefix("sha256:")
            .ok_or_else(|| Error::InvalidDigest(digest.clone()))?;
        let digest_spec = DigestSpec {
            hash_algorithm: HASH_ALGORITHM_SHA256.to_owned(),
            normalisation_algorithm: GENERIC_BLOB_DIGEST_V1.to_owned(),
            value: hex.to_owned(),
        };
        Ok((access, digest_spec, size))
    }

    async fn fetch_local_blob(
        &self,
        component: &str,
        access: &TypedSpec,
        size_hint: Option<u64>,
    ) -> Result<Vec<u8>> {
        if !access.is(ACCESS_TYPE_LOCAL_BLOB) {
            return Err(Error::Unsupported(format!(
                "access type {:?} is not a local blob",
                access.kind
            )));
        }
        let local: LocalBlobAccess = access.decode()?;
        let store = self.store_for_component(component).await?;
        store
            .fetch(&OciDescriptor {
                media_type: local.media_type.clone(),
                digest: local.local_reference.clone(),
                size: size_hint.unwrap_or_default(),
                artifact_type: None,
                annotations: None,
            })
            .await
    }
}

#[async_trait]
impl ComponentRepository for OciComponentRepository {
    async fn add_component_version(&self, descriptor: &ComponentDescriptor) -> Result<()> {
        descriptor.validate()?;
        let name = &descriptor.component.name;
        let version = &descriptor.component.version;
        let store = self.store_for_component(name).await?;

        let descriptor_data = descriptor.to_json()?;
        let descriptor_desc = blob_descriptor(MEDIA_TYPE_DESCRIPTOR_JSON, &descriptor_data);

        let config = ComponentConfig {
            component_descriptor_layer: descriptor_desc.clone(),
        };
        let config_data = serde_json::to_vec(&config)?;
        let config_desc = blob_descriptor(MEDIA_TYPE_COMPONENT_CONFIG, &config_data);

        let mut layers = vec![descriptor_desc.clone()];
        for resource in &descriptor.component.resources {
            if let Some(access) = &resource.access {
                if access.is(ACCESS_TYPE_LOCAL_BLOB) {
                    layers.push(local_blob_layer(
                        access,
                        &resource.meta.identity(),
                        ArtifactKind::Resource,
                        resource.size,
                    )?);
                }
            }
        }
        for source in &descriptor.component.sources {
            if let Some(access) = &source.access {
                if access.is(ACCESS_TYPE_LOCAL_BLOB) {
                    layers.push(local_blob_layer(
                        access,
                        &source.meta.identity(),
                        ArtifactKind::Source,
                        None,
                    )?);
                }
            }
        }

        let annotations = BTreeMap::from([
            (
                ANNOTATION_COMPONENT_VERSION.to_owned(),
                component_version_annotation(name, version),
            ),
            (ANNOTATION_CREATOR.to_owned(), self.creator.clone()),
            (ANNOTATION_IMAGE_TITLE.to_owned(), name.clone()),
            (ANNOTATION_IMAGE_VERSION.to_owned(), version.clone()),
        ]);
        let manifest = OciImageManifest {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_IMAGE_MANIFEST.to_owned()),
            artifact_type: Some(MEDIA_TYPE_COMPONENT_DESCRIPTOR.to_owned()),
            config: config_desc.clone(),
            layers,
            subject: Some(component_index_descriptor()),
            annotations: Some(annotations),
        };
        let manifest_data = serde_json::to_vec(&manifest)?;
        let manifest_desc = blob_descriptor(MEDIA_TYPE_IMAGE_MANIFEST, &manifest_data);

        // Meta objects go up concurrently; the first failure aborts the
        // rest. The manifest itself only goes up after all of them landed.
        let mut metas: JoinSet<Result<()>> = JoinSet::new();
        let meta_objects = [
            (descriptor_desc, descriptor_data),
            (config_desc, config_data),
            (
                component_index_descriptor(),
                crate::COMPONENT_INDEX_MANIFEST.as_bytes().to_vec(),
            ),
        ];
        for (desc, data) in meta_objects {
            let store = Arc::clone(&store);
            metas.spawn(async move {
                if store.exists(&desc).await? {
                    return Ok(());
                }
                store.push(&desc, data).await
            });
        }
        while let Some(joined) = metas.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    metas.abort_all();
                    return Err(e);
                }
                Err(e) => {
                    metas.abort_all();
                    return Err(io::Error::other(e).into());
                }
            }
        }

        store.push(&manifest_desc, manifest_data).await?;
        store.tag(&manifest_desc, version).await?;
        tracing::info!(
            component = %name,
            version = %version,
            digest = %manifest_desc.digest,
            "pushed component version"
        );
        Ok(())
    }

    async fn get_component_version(
        &self,
        name: &str,
        version: &str,
    ) -> Result<ComponentDescriptor> {
        let store = self.store_for_component(name).await?;
        let desc = store.resolve(version).await.map_err(|e| match e {
            Error::NotFound(_) => Error::NotFound(format!("component version {name}:{version}")),
            other => other,
        })?;
        let data = store.fetch(&desc).await?;
        let manifest = self.manifest_for(&store, &desc, data).await?;

        if manifest.config.media_type != MEDIA_TYPE_COMPONENT_CONFIG {
            return Err(Error::MalformedManifest(format!(
                "config media type {:?} is not a component config",
                manifest.config.media_type
            )));
        }
        let config_data = store.fetch(&manifest.config).await?;
        let config: ComponentConfig = serde_json::from_slice(&config_data)?;
        let layer = config.component_descriptor_layer;
        let layer_data = store.fetch(&layer).await?;
        decode_descriptor_layer(&layer.media_type, &layer_data)
    }

    async fn list_component_versions(&self, name: &str) -> Result<Vec<String>> {
        let versions = match self.policy {
            ListingPolicy::TagOnly => self.list_by_tags(name).await?,
            ListingPolicy::ReferrerWithTagFallback => {
                match self.list_by_referrers(name).await {
                    Ok(versions) if !versions.is_empty() => versions,
                    Ok(_) => self.list_by_tags(name).await?,
                    Err(e) => {
                        tracing::debug!(
                            component = name,
                            error = %e,
                            "referrer listing unavailable, falling back to tags"
                        );
                        self.list_by_tags(name).await?
                    }
                }
            }
        };
        Ok(sort_versions(versions))
    }

    async fn add_local_resource(
        &self,
        component: &str,
        version: &str,
        resource: &Resource,
        blob: Blob,
    ) -> Result<Resource> {
        let _ = version;
        let (access, digest, size) = self.add_local_blob(component, blob).await?;
        let mut resource = resource.clone();
        resource.access = Some(access);
        resource.digest = Some(digest);
        resource.size = Some(size);
        Ok(resource)
    }

    async fn add_local_source(
        &self,
        component: &str,
        version: &str,
        source: &Source,
        blob: Blob,
    ) -> Result<Source> {
        let _ = version;
        let (access, _, _) = self.add_local_blob(component, blob).await?;
        let mut source = source.clone();
        source.access = Some(access);
        Ok(source)
    }

    async fn get_local_resource(
        &self,
        component: &str,
        version: &str,
        identity: &Identity,
    ) -> Result<(Resource, Vec<u8>)> {
        let descriptor = self.get_component_version(component, version).await?;
        let resource = descriptor
            .resource(identity)
            .ok_or_else(|| Error::NotFound(format!("resource {identity} in {component}:{version}")))?
            .clone();
        let access = resource
            .access
            .as_ref()
            .ok_or_else(|| Error::NotFound(format!("resource {identity} carries no access")))?;
        let data = self
            .fetch_local_blob(component, access, resource.size)
            .await?;
        Ok((resource, data))
    }

    async fn get_local_source(
        &self,
        component: &str,
        version: &str,
        identity: &Identity,
    ) -> Result<(Source, Vec<u8>)> {
        let descriptor = self.get_component_version(component, version).await?;
        let source = descriptor
            .source(identity)
            .ok_or_else(|| Error::NotFound(format!("source {identity} in {component}:{version}")))?
            .clone();
        let access = source
            .access
            .as_ref()
            .ok_or_else(|| Error::NotFound(format!("source {identity} carries no access")))?;
        let data = self.fetch_local_blob(component, access, None).await?;
        Ok((source, data))
    }
}

fn local_blob_layer(
    access: &TypedSpec,
    identity: &Identity,
    kind: ArtifactKind,
    size_hint: Option<u64>,
) -> Result<OciDescriptor> {
    let local: LocalBlobAccess = access.decode()?;
    Ok(OciDescriptor {
        media_type: local.media_type,
        digest: local.local_reference,
        size: size_hint.unwrap_or_default(),
        artifact_type: None,
        annotations: Some(BTreeMap::from([(
            ANNOTATION_ARTIFACT.to_owned(),
            artifact_annotation(identity, kind)?,
        )])),
    })
}

/// Parses a tag as a relaxed semantic version: an optional leading `v` is
/// stripped and missing minor/patch parts are padded with zeroes.
pub fn relaxed_semver(tag: &str) -> Option<semver::Version> {
    let v = tag.strip_prefix('v').unwrap_or(tag);
    if let Ok(version) = semver::Version::parse(v) {
        return Some(version);
    }
    let padded = match v.split('.').count() {
        1 => format!("{v}.0.0"),
        2 => format!("{v}.0"),
        _ => return None,
    };
    semver::Version::parse(&padded).ok()
}

/// Filters to parseable versions, sorts descending, compacts duplicates.
fn sort_versions(versions: Vec<String>) -> Vec<String> {
    let mut parsed: Vec<(semver::Version, String)> = versions
        .into_iter()
        .filter_map(|tag| relaxed_semver(&tag).map(|v| (v, tag)))
        .collect();
    parsed.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));
    parsed.dedup_by(|a, b| a.0 == b.0 && a.1 == b.1);
    parsed.into_iter().map(|(_, tag)| tag).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relaxed_semver_parsing() {
        assert_eq!(relaxed_semver("v1.2.3").unwrap().to_string(), "1.2.3");
        assert_eq!(relaxed_semver("1.2").unwrap().to_string(), "1.2.0");
        assert_eq!(relaxed_semver("2").unwrap().to_string(), "2.0.0");
        assert_eq!(
            relaxed_semver("v1.0.0-rc.1").unwrap().to_string(),
            "1.0.0-rc.1"
        );
        assert!(relaxed_semver("latest").is_none());
        assert!(relaxed_semver("not.a.version").is_none());
    }

    #[test]
    fn versions_sorted_descending_and_compacted() {
        let sorted = sort_versions(vec![
            "v1.0.0".into(),
            "v2.1.0".into(),
            "latest".into(),
            "v0.9.0".into(),
            "v2.1.0".into(),
            "1.10.0".into(),
        ]);
        assert_eq!(sorted, vec!["v2.1.0", "1.10.0", "v1.0.0", "v0.9.0"]);
    }
}
