//! By-value resource transfer.
//!
//! A by-value OCI image resource is materialized as a TAR+GZIP blob in the
//! standard OCI image layout (`oci-layout`, `index.json`, `blobs/sha256/`)
//! so it can travel inside a CTF, and pushed back out to a registry from
//! that form.

use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;

use async_trait::async_trait;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use ocm_desc::normalisation::{GENERIC_BLOB_DIGEST_V1, HASH_ALGORITHM_SHA256};
use ocm_desc::{ACCESS_TYPE_OCI_IMAGE, DigestSpec, OciImageAccess, Resource};

use crate::store::{Blob, OciDescriptor, OciImageIndex, OciImageManifest, OciStore};
use crate::{
    Error, MEDIA_TYPE_ARTIFACT_SET, MEDIA_TYPE_IMAGE_INDEX, OciReference, Result, StoreProvider,
};

/// Standard OCI layout marker file content.
const OCI_LAYOUT: &[u8] = br#"{"imageLayoutVersion":"1.0.0"}"#;
/// Annotation carrying the original reference in a layout index.
const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

/// Transfer operations for resources with remote accesses.
#[async_trait]
pub trait ResourceRepository: Send + Sync {
    /// Downloads a by-value resource, returning it as an artifact-set blob.
    async fn download_resource(&self, resource: &Resource) -> Result<Blob>;

    /// Pushes a previously materialized artifact-set blob back to the
    /// resource's access target.
    async fn upload_resource(&self, resource: &Resource, blob: Blob) -> Result<()>;

    /// Recomputes the resource digest and pins its access reference.
    async fn process_resource_digest(&self, resource: Resource) -> Result<Resource>;
}

/// [`ResourceRepository`] over any [`StoreProvider`].
pub struct OciResourceRepository {
    provider: Arc<dyn StoreProvider>,
}

impl std::fmt::Debug for OciResourceRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OciResourceRepository").finish_non_exhaustive()
    }
}

impl OciResourceRepository {
    /// Creates a transfer repository over the given store provider.
    pub fn new(provider: Arc<dyn StoreProvider>) -> Self {
        Self { provider }
    }

    async fn image_store(
        &self,
        resource: &Resource,
    ) -> Result<(Arc<dyn OciStore>, OciReference)> {
        let access = resource.access.as_ref().ok_or_else(|| {
            Error::Unsupported(format!("resource {} carries no access", resource.meta.name))
        })?;
        if !access.is(ACCESS_TYPE_OCI_IMAGE) {
            return Err(Error::Unsupported(format!(
                "access type {:?} cannot be transferred by value",
                access.kind
            )));
        }
        let image: OciImageAccess = access.decode()?;
        let reference = OciReference::parse(&image.image_reference)?;
        let store = self.provider.store_for(&reference).await?;
        Ok((store, reference))
    }
}

async fn collect_image_manifest(
    store: &Arc<dyn OciStore>,
    desc: &OciDescriptor,
    data: &[u8],
    blobs: &mut Vec<(OciDescriptor, Vec<u8>)>,
) -> Result<()> {
    let manifest: OciImageManifest = serde_json::from_slice(data)?;
    let config_data = store.fetch(&manifest.config).await?;
    blobs.push((manifest.config.clone(), config_data));
    for layer in &manifest.layers {
        let layer_data = store.fetch(layer).await?;
        blobs.push((layer.clone(), layer_data));
    }
    blobs.push((desc.clone(), data.to_vec()));
    Ok(())
}

fn build_oci_layout_tgz(
    top: &OciDescriptor,
    blobs: &[(OciDescriptor, Vec<u8>)],
    reference: &str,
) -> Result<Blob> {
    let mut entry = top.clone();
    entry.annotations = Some(BTreeMap::from([(
        ANNOTATION_REF_NAME.to_owned(),
        reference.to_owned(),
    )]));
    let layout_index = OciImageIndex {
        schema_version: 2,
        media_type: Some(MEDIA_TYPE_IMAGE_INDEX.to_owned()),
        artifact_type: None,
        manifests: vec![entry],
        subject: None,
        annotations: None,
    };
    let index_data = serde_json::to_vec(&layout_index)?;

    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    append_file(&mut builder, "oci-layout", OCI_LAYOUT)?;
    append_file(&mut builder, "index.json", &index_data)?;

    let mut seen = std::collections::HashSet::new();
    for (desc, data) in blobs {
        if !seen.insert(desc.digest.clone()) {
            continue;
        }
        let hex = desc
            .digest
            .strip_prefix("sha256:")
            .ok_or_else(|| Error::InvalidDigest(desc.digest.clone()))?;
        append_file(&mut builder, &format!("blobs/sha256/{hex}"), data)?;
    }

    let encoder = builder.into_inner()?;
    let bytes = encoder.finish()?;
    Ok(Blob::new(bytes, Some(MEDIA_TYPE_ARTIFACT_SET.to_owned())))
}

fn append_file<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    path: &str,
    data: &[u8],
) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    builder.append_data(&mut header, path, data)?;
    Ok(())
}

fn read_oci_layout_tgz(data: &[u8]) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut archive = tar::Archive::new(GzDecoder::new(data));
    let mut entries = BTreeMap::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.display().to_string();
        let mut content = Vec::new();
        entry.read_to_end(&mut content)?;
        entries.insert(path, content);
    }
    Ok(entries)
}

#[async_trait]
impl ResourceRepository for OciResourceRepository {
    async fn download_resource(&self, resource: &Resource) -> Result<Blob> {
        let (store, reference) = self.image_store(resource).await?;
        let target = reference.version_part().ok_or_else(|| {
            Error::InvalidReference(format!("{reference} names neither tag nor digest"))
        })?;
        let manifest_desc = store.resolve(target).await?;
        let manifest_data = store.fetch(&manifest_desc).await?;

        let mut blobs = Vec::new();
        if manifest_desc.media_type == MEDIA_TYPE_IMAGE_INDEX {
            let index: OciImageIndex = serde_json::from_slice(&manifest_data)?;
            for entry in &index.manifests {
                let data = store.fetch(entry).await?;
                collect_image_manifest(&store, entry, &data, &mut blobs).await?;
            }
            blobs.push((manifest_desc.clone(), manifest_data));
        } else {
            collect_image_manifest(&store, &manifest_desc, &manifest_data, &mut blobs).await?;
        }

        build_oci_layout_tgz(&manifest_desc, &blobs, &reference.to_string())
    }

    async fn upload_resource(&self, resource: &Resource, blob: Blob) -> Result<()> {
        let (store, reference) = self.image_store(resource).await?;
        let entries = read_oci_layout_tgz(blob.data())?;
        let index_data = entries
            .get("index.json")
            .ok_or_else(|| Error::MalformedManifest("artifact set lacks index.json".into()))?;
        let index: OciImageIndex = serde_json::from_slice(index_data)?;
        let top = index
            .manifests
            .first()
            .ok_or_else(|| Error::MalformedManifest("artifact set index is empty".into()))?;

        let manifest_digests: std::collections::HashSet<&str> =
            index.manifests.iter().map(|m| m.digest.as_str()).collect();

        // Plain blobs first so manifests never dangle.
        for (path, data) in &entries {
            let Some(hex) = path.strip_prefix("blobs/sha256/") else {
                continue;
            };
            let digest = format!("sha256:{hex}");
            if manifest_digests.contains(digest.as_str()) {
                continue;
            }
            let desc = OciDescriptor {
                media_type: crate::MEDIA_TYPE_OCTET_STREAM.to_owned(),
                digest,
                size: data.len() as u64,
                artifact_type: None,
                annotations: None,
            };
            store.push(&desc, data.clone()).await?;
        }
        for manifest in &index.manifests {
            let hex = manifest
                .digest
                .strip_prefix("sha256:")
                .ok_or_else(|| Error::InvalidDigest(manifest.digest.clone()))?;
            let data = entries.get(&format!("blobs/sha256/{hex}")).ok_or_else(|| {
                Error::MalformedManifest(format!("artifact set lacks blob {}", manifest.digest))
            })?;
            let mut desc = manifest.clone();
            desc.annotations = None;
            store.push(&desc, data.clone()).await?;
        }

        let tag = reference
            .tag
            .as_deref()
            .or(reference.digest.as_deref())
            .ok_or_else(|| {
                Error::InvalidReference(format!("{reference} names neither tag nor digest"))
            })?;
        let mut top_desc = top.clone();
        top_desc.annotations = None;
        store.tag(&top_desc, tag).await?;
        tracing::info!(reference = %reference, "uploaded artifact set");
        Ok(())
    }

    async fn process_resource_digest(&self, mut resource: Resource) -> Result<Resource> {
        let (store, reference) = self.image_store(&resource).await?;
        let target = reference.version_part().ok_or_else(|| {
            Error::InvalidReference(format!("{reference} names neither tag nor digest"))
        })?;
        let desc = store.resolve(target).await?;
        let hex = desc
            .digest
            .strip_prefix("sha256:")
            .ok_or_else(|| Error::InvalidDigest(desc.digest.clone()))?;

        resource.digest = Some(DigestSpec {
            hash_algorithm: HASH_ALGORITHM_SHA256.to_owned(),
            normalisation_algorithm: GENERIC_BLOB_DIGEST_V1.to_owned(),
            value: hex.to_owned(),
        });
        let mut pinned = reference;
        pinned.digest = Some(desc.digest.clone());
        resource.access = Some(OciImageAccess::spec(&pinned.to_string())?);
        Ok(resource)
    }
}
