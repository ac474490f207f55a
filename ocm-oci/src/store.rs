//! The uniform store interface and OCI wire types.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::{MEDIA_TYPE_OCTET_STREAM, OciReference, Result};

/// An OCI content descriptor.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciDescriptor {
    /// Media type of the referenced content.
    pub media_type: String,
    /// Content digest, `<algo>:<hex>`.
    pub digest: String,
    /// Content size in bytes.
    pub size: u64,
    /// Artifact type, for referrer filtering.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
    /// Descriptor annotations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl OciDescriptor {
    /// Annotation value under `key`, if present.
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }
}

/// An OCI image manifest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciImageManifest {
    /// Always 2.
    pub schema_version: u32,
    /// Manifest media type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Artifact type for non-runnable artifacts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
    /// Configuration object.
    pub config: OciDescriptor,
    /// Content layers.
    #[serde(default)]
    pub layers: Vec<OciDescriptor>,
    /// Subject for referrer discovery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<OciDescriptor>,
    /// Manifest annotations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// An OCI image index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciImageIndex {
    /// Always 2.
    pub schema_version: u32,
    /// Index media type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Artifact type for non-runnable artifacts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
    /// Referenced manifests.
    #[serde(default)]
    pub manifests: Vec<OciDescriptor>,
    /// Subject for referrer discovery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<OciDescriptor>,
    /// Index annotations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// An in-memory payload with a content digest and media type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Blob {
    data: Vec<u8>,
    digest: String,
    media_type: Option<String>,
}

impl Blob {
    /// Wraps raw bytes, computing their `sha256:` digest.
    pub fn new(data: Vec<u8>, media_type: Option<String>) -> Self {
        let digest = format!("sha256:{}", hex::encode(Sha256::digest(&data)));
        Self {
            data,
            digest,
            media_type,
        }
    }

    /// The blob content.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the blob, returning its content.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Content digest, `sha256:<hex>`.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Content size in bytes.
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Declared media type, if any.
    pub fn media_type(&self) -> Option<&str> {
        self.media_type.as_deref()
    }

    /// Descriptor of the blob under the given media type fallback.
    pub fn descriptor(&self) -> OciDescriptor {
        OciDescriptor {
            media_type: self
                .media_type
                .clone()
                .unwrap_or_else(|| MEDIA_TYPE_OCTET_STREAM.to_owned()),
            digest: self.digest.clone(),
            size: self.size(),
            artifact_type: None,
            annotations: None,
        }
    }
}

/// Uniform content store scoped to one repository.
///
/// Implemented for remote OCI registries and CTF archives. All operations
/// take and return plain descriptors; manifest semantics live a layer up.
#[async_trait]
pub trait OciStore: Send + Sync {
    /// Reads the content behind a descriptor.
    async fn fetch(&self, desc: &OciDescriptor) -> Result<Vec<u8>>;

    /// Returns `true` if the described content is present.
    async fn exists(&self, desc: &OciDescriptor) -> Result<bool>;

    /// Writes content under its descriptor.
    async fn push(&self, desc: &OciDescriptor, data: Vec<u8>) -> Result<()>;

    /// Resolves a tag or digest to a descriptor.
    async fn resolve(&self, reference: &str) -> Result<OciDescriptor>;

    /// Assigns a tag (or asserts a digest) to described content.
    async fn tag(&self, desc: &OciDescriptor, reference: &str) -> Result<()>;

    /// Lists tags, starting after `last` where the backend paginates.
    async fn tags(&self, last: Option<&str>) -> Result<Vec<String>>;

    /// Resolves a reference and reads its content in one step.
    async fn fetch_reference(&self, reference: &str) -> Result<(OciDescriptor, Vec<u8>)> {
        let desc = self.resolve(reference).await?;
        let data = self.fetch(&desc).await?;
        Ok((desc, data))
    }

    /// Lists manifests whose `subject` is `subject` and whose artifact type
    /// matches.
    async fn referrers(
        &self,
        subject: &OciDescriptor,
        artifact_type: &str,
    ) -> Result<Vec<OciDescriptor>>;
}

/// Hands out a store for a repository reference.
#[async_trait]
pub trait StoreProvider: Send + Sync {
    /// Returns the store scoped to the reference's registry and repository.
    async fn store_for(&self, reference: &OciReference) -> Result<Arc<dyn OciStore>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_digest_and_descriptor() {
        let blob = Blob::new(b"test".to_vec(), Some("application/json".into()));
        assert_eq!(
            blob.digest(),
            "sha256:9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"
        );
        let desc = blob.descriptor();
        assert_eq!(desc.media_type, "application/json");
        assert_eq!(desc.size, 4);
    }

    #[test]
    fn untyped_blob_defaults_to_octet_stream() {
        let blob = Blob::new(b"x".to_vec(), None);
        assert_eq!(blob.descriptor().media_type, MEDIA_TYPE_OCTET_STREAM);
    }

    #[test]
    fn manifest_roundtrip_preserves_unknown_free_shape() {
        let json = r#"{
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "artifactType": "application/vnd.ocm.software.component-descriptor.v2",
            "config": {"mediaType": "a/b", "digest": "sha256:00", "size": 2},
            "layers": [],
            "annotations": {"software.ocm.componentversion": "component-descriptors/x:v1"}
        }"#;
        let manifest: OciImageManifest = serde_json::from_str(json).unwrap();
        assert_eq!(manifest.schema_version, 2);
        assert_eq!(
            manifest.annotations.as_ref().unwrap()["software.ocm.componentversion"],
            "component-descriptors/x:v1"
        );
        let back = serde_json::to_string(&manifest).unwrap();
        let reparsed: OciImageManifest = serde_json::from_str(&back).unwrap();
        assert_eq!(manifest, reparsed);
    }
}
