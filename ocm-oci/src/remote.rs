//! Remote registry store over the OCI distribution protocol.
//!
//! A thin adapter around [`oci_client`]; protocol details, auth flows, and
//! retries stay inside that crate. Referrer listing is not part of the
//! client's surface, so [`OciStore::referrers`] reports unsupported and
//! version listing falls back to tag enumeration.

use std::sync::Arc;

use async_trait::async_trait;
use oci_client::client::ClientConfig;
use oci_client::secrets::RegistryAuth;
use oci_client::{Client, Reference as ClientReference, RegistryOperation};

use crate::reference::is_digest;
use crate::store::{OciDescriptor, OciStore, StoreProvider};
use crate::{
    Error, MEDIA_TYPE_IMAGE_INDEX, MEDIA_TYPE_IMAGE_MANIFEST, OciReference, Result,
};

/// Manifest media types accepted on pull.
const MANIFEST_ACCEPT: &[&str] = &[
    MEDIA_TYPE_IMAGE_MANIFEST,
    MEDIA_TYPE_IMAGE_INDEX,
    "application/vnd.docker.distribution.manifest.v2+json",
    "application/vnd.docker.distribution.manifest.list.v2+json",
];

fn is_manifest_media_type(media_type: &str) -> bool {
    MANIFEST_ACCEPT.contains(&media_type)
}

fn registry_err(e: impl std::fmt::Display) -> Error {
    Error::Registry(e.to_string())
}

/// Store provider over remote OCI registries.
pub struct RemoteRegistry {
    client: Arc<Client>,
    auth: RegistryAuth,
}

impl std::fmt::Debug for RemoteRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteRegistry").finish_non_exhaustive()
    }
}

impl Default for RemoteRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteRegistry {
    /// Anonymous client with default configuration.
    pub fn new() -> Self {
        Self::with_auth(RegistryAuth::Anonymous)
    }

    /// Client with explicit registry credentials.
    pub fn with_auth(auth: RegistryAuth) -> Self {
        Self {
            client: Arc::new(Client::new(ClientConfig::default())),
            auth,
        }
    }
}

#[async_trait]
impl StoreProvider for RemoteRegistry {
    async fn store_for(&self, reference: &OciReference) -> Result<Arc<dyn OciStore>> {
        let registry = reference
            .registry
            .clone()
            .ok_or_else(|| Error::InvalidReference(format!("{reference} lacks a registry")))?;
        Ok(Arc::new(RemoteStore {
            client: Arc::clone(&self.client),
            auth: self.auth.clone(),
            registry,
            repository: reference.repository.clone(),
        }))
    }
}

/// Store over one repository of a remote registry.
pub struct RemoteStore {
    client: Arc<Client>,
    auth: RegistryAuth,
    registry: String,
    repository: String,
}

impl std::fmt::Debug for RemoteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStore")
            .field("registry", &self.registry)
            .field("repository", &self.repository)
            .finish_non_exhaustive()
    }
}

impl RemoteStore {
    fn reference(&self, version: &str) -> Result<ClientReference> {
        let raw = if is_digest(version) {
            format!("{}/{}@{version}", self.registry, self.repository)
        } else {
            format!("{}/{}:{version}", self.registry, self.repository)
        };
        raw.parse()
            .map_err(|e: oci_client::ParseError| Error::InvalidReference(e.to_string()))
    }

    async fn authenticate(&self, reference: &ClientReference, op: RegistryOperation) -> Result<()> {
        self.client
            .auth(reference, &self.auth, op)
            .await
            .map_err(registry_err)?;
        Ok(())
    }

    async fn pull_manifest_bytes(&self, version: &str) -> Result<(Vec<u8>, String)> {
        let reference = self.reference(version)?;
        self.client
            .pull_manifest_raw(&reference, &self.auth, MANIFEST_ACCEPT)
            .await
            .map(|(data, digest)| (data.to_vec(), digest))
            .map_err(registry_err)
    }
}

#[async_trait]
impl OciStore for RemoteStore {
    async fn fetch(&self, desc: &OciDescriptor) -> Result<Vec<u8>> {
        if is_manifest_media_type(&desc.media_type) {
            let (data, _) = self.pull_manifest_bytes(&desc.digest).await?;
            return Ok(data);
        }

        let reference = self.reference(&desc.digest)?;
        self.authenticate(&reference, RegistryOperation::Pull).await?;
        let layer = oci_client::manifest::OciDescriptor {
            media_type: desc.media_type.clone(),
            digest: desc.digest.clone(),
            size: desc.size as i64,
            urls: None,
            annotations: None,
        };
        let mut out = Vec::new();
        self.client
            .pull_blob(&reference, &layer, &mut out)
            .await
            .map_err(registry_err)?;
        Ok(out)
    }

    async fn exists(&self, desc: &OciDescriptor) -> Result<bool> {
        if is_manifest_media_type(&desc.media_type) {
            let reference = self.reference(&desc.digest)?;
            return Ok(self
                .client
                .fetch_manifest_digest(&reference, &self.auth)
                .await
                .is_ok());
        }
        Ok(self.fetch(desc).await.is_ok())
    }

    async fn push(&self, desc: &OciDescriptor, data: Vec<u8>) -> Result<()> {
        let reference = self.reference(&desc.digest)?;
        self.authenticate(&reference, RegistryOperation::Push).await?;
        if is_manifest_media_type(&desc.media_type) {
            let manifest: oci_client::manifest::OciManifest = serde_json::from_slice(&data)?;
            self.client
                .push_manifest(&reference, &manifest)
                .await
                .map_err(registry_err)?;
        } else {
            self.client
                .push_blob(&reference, data, &desc.digest)
                .await
                .map_err(registry_err)?;
        }
        Ok(())
    }

    async fn resolve(&self, reference: &str) -> Result<OciDescriptor> {
        let (data, digest) = self.pull_manifest_bytes(reference).await?;

        #[derive(serde::Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct MediaTypeProbe {
            media_type: Option<String>,
            artifact_type: Option<String>,
        }
        let probe: MediaTypeProbe = serde_json::from_slice(&data)?;
        Ok(OciDescriptor {
            media_type: probe
                .media_type
                .unwrap_or_else(|| MEDIA_TYPE_IMAGE_MANIFEST.to_owned()),
            digest,
            size: data.len() as u64,
            artifact_type: probe.artifact_type,
            annotations: None,
        })
    }

    async fn tag(&self, desc: &OciDescriptor, reference: &str) -> Result<()> {
        let (data, _) = self.pull_manifest_bytes(&desc.digest).await?;
        let manifest: oci_client::manifest::OciManifest = serde_json::from_slice(&data)?;
        let target = self.reference(reference)?;
        self.authenticate(&target, RegistryOperation::Push).await?;
        self.client
            .push_manifest(&target, &manifest)
            .await
            .map_err(registry_err)?;
        Ok(())
    }

    async fn tags(&self, last: Option<&str>) -> Result<Vec<String>> {
        let reference = self.reference("latest")?;
        let response = self
            .client
            .list_tags(&reference, &self.auth, None, last)
            .await
            .map_err(registry_err)?;
        Ok(response.tags)
    }

    async fn referrers(
        &self,
        _subject: &OciDescriptor,
        _artifact_type: &str,
    ) -> Result<Vec<OciDescriptor>> {
        Err(Error::Unsupported(
            "referrers listing on remote registries".into(),
        ))
    }
}
