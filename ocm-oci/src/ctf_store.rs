//! CTF-backed implementation of the store interface.

use std::sync::Arc;

use async_trait::async_trait;
use ocm_ctf::{AccessMode, ArtifactIndex, ArtifactMetadata, Ctf, Format};
use tokio::sync::RwLock;

use crate::reference::{is_digest, is_valid_tag};
use crate::store::{OciDescriptor, OciImageManifest, OciStore, StoreProvider};
use crate::{
    CTF_REGISTRY, Error, MEDIA_TYPE_ARTIFACT_SET, MEDIA_TYPE_IMAGE_INDEX,
    MEDIA_TYPE_IMAGE_MANIFEST, MEDIA_TYPE_OCTET_STREAM, OciReference, Result,
};

/// A shared CTF handle.
///
/// Index mutations go through `get → mutate → set` under an exclusive
/// lock; readers take the shared side and observe a consistent snapshot.
#[derive(Debug)]
pub struct CtfArchive {
    ctf: Ctf,
    index_mu: RwLock<()>,
}

impl CtfArchive {
    /// Wraps an opened CTF.
    pub fn new(ctf: Ctf) -> Arc<Self> {
        Arc::new(Self {
            ctf,
            index_mu: RwLock::new(()),
        })
    }

    /// Opens the CTF at `path` and wraps it.
    pub async fn open(path: impl AsRef<std::path::Path>, mode: AccessMode) -> Result<Arc<Self>> {
        Ok(Self::new(Ctf::open(path, mode).await?))
    }

    /// The underlying CTF.
    pub fn ctf(&self) -> &Ctf {
        &self.ctf
    }

    /// Returns a store scoped to `repository`.
    pub fn store(self: &Arc<Self>, repository: &str) -> CtfStore {
        CtfStore {
            archive: Arc::clone(self),
            repository: repository.to_owned(),
        }
    }

    /// Re-packs the archive contents to `dest` in the given format.
    pub async fn archive_to(&self, dest: &std::path::Path, format: Format) -> Result<()> {
        let _guard = self.index_mu.read().await;
        ocm_ctf::archive(&self.ctf, dest, format).await?;
        Ok(())
    }

    async fn read_index(&self) -> Result<ArtifactIndex> {
        let _guard = self.index_mu.read().await;
        Ok(self.ctf.get_index().await?)
    }

    async fn modify_index(&self, apply: impl FnOnce(&mut ArtifactIndex) + Send) -> Result<()> {
        let _guard = self.index_mu.write().await;
        let mut index = self.ctf.get_index().await?;
        apply(&mut index);
        self.ctf.set_index(&index).await?;
        Ok(())
    }
}

#[async_trait]
impl StoreProvider for Arc<CtfArchive> {
    async fn store_for(&self, reference: &OciReference) -> Result<Arc<dyn OciStore>> {
        Ok(Arc::new(self.store(&reference.repository)))
    }
}

/// Store over one repository of a [`CtfArchive`].
#[derive(Debug)]
pub struct CtfStore {
    archive: Arc<CtfArchive>,
    repository: String,
}

impl CtfStore {
    /// The repository this store is scoped to.
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// Reduces a reference to its tag/digest part relative to this store:
    /// the synthetic registry host and the repository prefix are stripped.
    fn local_reference<'a>(&self, reference: &'a str) -> &'a str {
        let mut r = reference;
        if let Some(rest) = r.strip_prefix(CTF_REGISTRY) {
            r = rest.trim_start_matches('/');
        }
        if let Some(rest) = r.strip_prefix(&self.repository) {
            if let Some(stripped) = rest.strip_prefix(':').or_else(|| rest.strip_prefix('@')) {
                r = stripped;
            }
        }
        r
    }

    fn entry_descriptor(&self, entry: &ArtifactMetadata, size: u64) -> OciDescriptor {
        let media_type = match entry.media_type.as_deref() {
            Some(mt) if !mt.is_empty() => mt.to_owned(),
            // Older toolchains omitted the media type on artifact-set
            // entries; assume that and carry on.
            _ => {
                tracing::warn!(
                    repository = %entry.repository,
                    digest = %entry.digest,
                    "index entry without media type, assuming legacy artifact set"
                );
                MEDIA_TYPE_ARTIFACT_SET.to_owned()
            }
        };
        OciDescriptor {
            media_type,
            digest: entry.digest.clone(),
            size,
            artifact_type: None,
            annotations: None,
        }
    }
}

fn is_manifest_media_type(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_IMAGE_MANIFEST || media_type == MEDIA_TYPE_IMAGE_INDEX
}

#[async_trait]
impl OciStore for CtfStore {
    async fn fetch(&self, desc: &OciDescriptor) -> Result<Vec<u8>> {
        Ok(self.archive.ctf().get_blob(&desc.digest).await?)
    }

    async fn exists(&self, desc: &OciDescriptor) -> Result<bool> {
        Ok(self.archive.ctf().has_blob(&desc.digest).await?)
    }

    async fn push(&self, desc: &OciDescriptor, data: Vec<u8>) -> Result<()> {
        self.archive
            .ctf()
            .save_blob_bytes(&desc.digest, &data)
            .await?;
        // Manifests become index entries so they stay discoverable by
        // digest and for referrer scans; plain blobs do not.
        if is_manifest_media_type(&desc.media_type) {
            let entry = ArtifactMetadata {
                repository: self.repository.clone(),
                tag: None,
                digest: desc.digest.clone(),
                media_type: Some(desc.media_type.clone()),
            };
            self.archive
                .modify_index(move |index| index.add_artifact(entry))
                .await?;
        }
        Ok(())
    }

    async fn resolve(&self, reference: &str) -> Result<OciDescriptor> {
        let local = self.local_reference(reference);
        let index = self.archive.read_index().await?;
        if let Some(entry) = index.find(&self.repository, local) {
            let size = self.archive.ctf().blob_size(&entry.digest).await?;
            return Ok(self.entry_descriptor(entry, size));
        }

        // Digests resolve directly against the blob store.
        if is_digest(local) && self.archive.ctf().has_blob(local).await? {
            let size = self.archive.ctf().blob_size(local).await?;
            return Ok(OciDescriptor {
                media_type: MEDIA_TYPE_OCTET_STREAM.to_owned(),
                digest: local.to_owned(),
                size,
                artifact_type: None,
                annotations: None,
            });
        }

        Err(Error::NotFound(format!("{}:{local}", self.repository)))
    }

    async fn tag(&self, desc: &OciDescriptor, reference: &str) -> Result<()> {
        let local = self.local_reference(reference).to_owned();
        if !self.exists(desc).await? {
            return Err(Error::NotFound(desc.digest.clone()));
        }

        let tag = if is_digest(&local) {
            if local != desc.digest {
                return Err(Error::Conflict(format!(
                    "digest reference {local} does not match content digest {}",
                    desc.digest
                )));
            }
            None
        } else if is_valid_tag(&local) {
            Some(local)
        } else {
            return Err(Error::InvalidReference(reference.to_owned()));
        };

        let entry = ArtifactMetadata {
            repository: self.repository.clone(),
            tag,
            digest: desc.digest.clone(),
            media_type: Some(desc.media_type.clone()),
        };
        self.archive
            .modify_index(move |index| index.add_artifact(entry))
            .await
    }

    async fn tags(&self, _last: Option<&str>) -> Result<Vec<String>> {
        // A CTF has no natural pagination; `last` is ignored.
        let index = self.archive.read_index().await?;
        let mut tags: Vec<String> = index
            .tags(&self.repository)
            .into_iter()
            .map(ToOwned::to_owned)
            .collect();
        tags.sort_unstable();
        tags.dedup();
        Ok(tags)
    }

    async fn referrers(
        &self,
        subject: &OciDescriptor,
        artifact_type: &str,
    ) -> Result<Vec<OciDescriptor>> {
        let index = self.archive.read_index().await?;
        let mut referrers = Vec::new();
        for entry in &index.artifacts {
            if entry.repository != self.repository {
                continue;
            }
            let Some(media_type) = entry.media_type.as_deref() else {
                continue;
            };
            if !is_manifest_media_type(media_type) {
                continue;
            }
            let data = self.archive.ctf().get_blob(&entry.digest).await?;
            let Ok(manifest) = serde_json::from_slice::<OciImageManifest>(&data) else {
                continue;
            };
            let points_at_subject = manifest
                .subject
                .as_ref()
                .is_some_and(|s| s.digest == subject.digest);
            if !points_at_subject {
                continue;
            }
            if !artifact_type.is_empty()
                && manifest.artifact_type.as_deref() != Some(artifact_type)
            {
                continue;
            }
            referrers.push(OciDescriptor {
                media_type: media_type.to_owned(),
                digest: entry.digest.clone(),
                size: data.len() as u64,
                artifact_type: manifest.artifact_type.clone(),
                annotations: manifest.annotations.clone(),
            });
        }
        Ok(referrers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Blob;

    async fn open_archive(dir: &std::path::Path) -> Arc<CtfArchive> {
        CtfArchive::open(dir.join("ctf"), AccessMode::ReadWrite)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn push_tag_resolve_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_archive(dir.path()).await.store("component-descriptors/x");

        let blob = Blob::new(
            br#"{"schemaVersion":2,"config":{"mediaType":"a","digest":"sha256:00","size":1}}"#
                .to_vec(),
            Some(MEDIA_TYPE_IMAGE_MANIFEST.into()),
        );
        let desc = blob.descriptor();
        store.push(&desc, blob.into_data()).await.unwrap();
        store.tag(&desc, "v1.0.0").await.unwrap();

        let by_tag = store.resolve("v1.0.0").await.unwrap();
        assert_eq!(by_tag.digest, desc.digest);
        assert_eq!(by_tag.media_type, MEDIA_TYPE_IMAGE_MANIFEST);

        let by_digest = store.resolve(&desc.digest).await.unwrap();
        assert_eq!(by_digest.digest, desc.digest);

        // Full references with the synthetic host resolve too.
        let full = format!("{CTF_REGISTRY}/component-descriptors/x:v1.0.0");
        assert_eq!(store.resolve(&full).await.unwrap().digest, desc.digest);
    }

    #[tokio::test]
    async fn retag_moves_tag_to_new_digest() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_archive(dir.path()).await.store("repo");

        let first = Blob::new(b"one".to_vec(), Some(MEDIA_TYPE_IMAGE_MANIFEST.into()));
        let second = Blob::new(b"two".to_vec(), Some(MEDIA_TYPE_IMAGE_MANIFEST.into()));
        let first_desc = first.descriptor();
        let second_desc = second.descriptor();
        store.push(&first_desc, first.into_data()).await.unwrap();
        store.push(&second_desc, second.into_data()).await.unwrap();

        store.tag(&first_desc, "latest").await.unwrap();
        store.tag(&second_desc, "latest").await.unwrap();

        let resolved = store.resolve("latest").await.unwrap();
        assert_eq!(resolved.digest, second_desc.digest);
        assert_eq!(store.tags(None).await.unwrap(), vec!["latest".to_owned()]);
    }

    #[tokio::test]
    async fn digest_tag_with_mismatch_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_archive(dir.path()).await.store("repo");

        let blob = Blob::new(b"data".to_vec(), Some(MEDIA_TYPE_IMAGE_MANIFEST.into()));
        let desc = blob.descriptor();
        store.push(&desc, blob.into_data()).await.unwrap();

        let other = Blob::new(b"other".to_vec(), None);
        let err = store.tag(&desc, other.digest()).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn raw_blob_digest_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let archive = open_archive(dir.path()).await;
        let store = archive.store("repo");

        let blob = Blob::new(b"payload".to_vec(), None);
        let desc = blob.descriptor();
        store.push(&desc, blob.into_data()).await.unwrap();

        // No index entry exists for a plain blob; resolve falls back.
        let resolved = store.resolve(&desc.digest).await.unwrap();
        assert_eq!(resolved.media_type, MEDIA_TYPE_OCTET_STREAM);
        assert_eq!(resolved.size, 7);
        assert!(matches!(
            store.resolve("unknown-tag").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn legacy_entry_defaults_to_artifact_set() {
        let dir = tempfile::tempdir().unwrap();
        let archive = open_archive(dir.path()).await;
        let store = archive.store("repo");

        let blob = Blob::new(b"legacy".to_vec(), None);
        archive
            .ctf()
            .save_blob_bytes(blob.digest(), blob.data())
            .await
            .unwrap();
        archive
            .modify_index(|index| {
                index.add_artifact(ArtifactMetadata {
                    repository: "repo".into(),
                    tag: Some("old".into()),
                    digest: blob.digest().to_owned(),
                    media_type: None,
                })
            })
            .await
            .unwrap();

        let resolved = store.resolve("old").await.unwrap();
        assert_eq!(resolved.media_type, MEDIA_TYPE_ARTIFACT_SET);
    }
}
