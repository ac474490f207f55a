//! The tagged artifact index of a CTF.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// File name of the index at the archive root.
pub const ARTIFACT_INDEX_FILE: &str = "artifact-index.json";
/// Index schema version written and accepted by this toolchain.
pub const ARTIFACT_INDEX_SCHEMA_VERSION: u32 = 1;

/// One entry of the artifact index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ArtifactMetadata {
    /// Repository the artifact belongs to.
    pub repository: String,
    /// Tag within the repository; at most one entry per `(repository, tag)`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Content digest of the artifact blob.
    pub digest: String,
    /// OCI media type; `None` marks a legacy artifact-set entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
}

/// Ordered list of artifacts stored in a CTF.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ArtifactIndex {
    /// Index schema version.
    pub schema_version: u32,
    /// The artifacts, in insertion order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<ArtifactMetadata>,
}

impl Default for ArtifactIndex {
    fn default() -> Self {
        Self {
            schema_version: ARTIFACT_INDEX_SCHEMA_VERSION,
            artifacts: Vec::new(),
        }
    }
}

impl ArtifactIndex {
    /// Decodes an index, rejecting unknown fields and foreign schema versions.
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        let index: Self = serde_json::from_slice(data)?;
        if index.schema_version != ARTIFACT_INDEX_SCHEMA_VERSION {
            return Err(Error::SchemaVersion(index.schema_version));
        }
        Ok(index)
    }

    /// Serializes the index to its on-disk JSON form.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Adds an artifact, upholding the index invariants.
    ///
    /// Assigning a tag already held by another digest in the same repository
    /// clears the old holder's tag. Adding an identical `(repository, digest)`
    /// pair with a tag upgrades an existing untagged entry in place.
    pub fn add_artifact(&mut self, artifact: ArtifactMetadata) {
        if artifact.tag.is_some() {
            for existing in &mut self.artifacts {
                if existing.repository == artifact.repository
                    && existing.tag == artifact.tag
                    && existing.digest != artifact.digest
                {
                    existing.tag = None;
                }
            }
        }

        if let Some(existing) = self.artifacts.iter_mut().find(|e| {
            e.repository == artifact.repository
                && e.digest == artifact.digest
                && (artifact.tag.is_none() || e.tag.is_none() || e.tag == artifact.tag)
        }) {
            if artifact.tag.is_some() {
                existing.tag = artifact.tag;
            }
            if artifact.media_type.is_some() {
                existing.media_type = artifact.media_type;
            }
            return;
        }

        self.artifacts.push(artifact);
    }

    /// Finds an artifact of `repository` whose tag or digest equals `reference`.
    pub fn find(&self, repository: &str, reference: &str) -> Option<&ArtifactMetadata> {
        self.artifacts.iter().find(|a| {
            a.repository == repository
                && (a.digest == reference || a.tag.as_deref() == Some(reference))
        })
    }

    /// Returns all tags assigned within `repository`.
    pub fn tags(&self, repository: &str) -> Vec<&str> {
        self.artifacts
            .iter()
            .filter(|a| a.repository == repository)
            .filter_map(|a| a.tag.as_deref())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(repo: &str, tag: Option<&str>, digest: &str) -> ArtifactMetadata {
        ArtifactMetadata {
            repository: repo.into(),
            tag: tag.map(Into::into),
            digest: digest.into(),
            media_type: None,
        }
    }

    #[test]
    fn retag_clears_old_holder() {
        let mut index = ArtifactIndex::default();
        index.add_artifact(entry("repo", Some("v1"), "sha256:aaa"));
        index.add_artifact(entry("repo", Some("v1"), "sha256:bbb"));

        assert_eq!(index.artifacts.len(), 2);
        assert_eq!(index.artifacts[0].tag, None);
        assert_eq!(index.artifacts[1].tag.as_deref(), Some("v1"));
        assert_eq!(index.find("repo", "v1").unwrap().digest, "sha256:bbb");
    }

    #[test]
    fn tagged_add_upgrades_untagged_entry() {
        let mut index = ArtifactIndex::default();
        index.add_artifact(entry("repo", None, "sha256:aaa"));
        index.add_artifact(entry("repo", Some("v1"), "sha256:aaa"));

        assert_eq!(index.artifacts.len(), 1);
        assert_eq!(index.artifacts[0].tag.as_deref(), Some("v1"));
    }

    #[test]
    fn same_digest_two_tags_coexist() {
        let mut index = ArtifactIndex::default();
        index.add_artifact(entry("repo", Some("v1"), "sha256:aaa"));
        index.add_artifact(entry("repo", Some("latest"), "sha256:aaa"));

        assert_eq!(index.artifacts.len(), 2);
        assert_eq!(index.tags("repo").len(), 2);
    }

    #[test]
    fn find_by_digest_and_tag() {
        let mut index = ArtifactIndex::default();
        index.add_artifact(entry("repo", Some("v1"), "sha256:aaa"));
        assert!(index.find("repo", "sha256:aaa").is_some());
        assert!(index.find("repo", "v1").is_some());
        assert!(index.find("other", "v1").is_none());
    }

    #[test]
    fn strict_decode_rejects_unknown_fields() {
        let data = br#"{"schemaVersion":1,"artifacts":[],"extra":true}"#;
        assert!(ArtifactIndex::from_slice(data).is_err());
    }

    #[test]
    fn foreign_schema_version_rejected() {
        let data = br#"{"schemaVersion":2,"artifacts":[]}"#;
        assert!(matches!(
            ArtifactIndex::from_slice(data),
            Err(Error::SchemaVersion(2))
        ));
    }

    #[test]
    fn roundtrip() {
        let mut index = ArtifactIndex::default();
        index.add_artifact(ArtifactMetadata {
            repository: "component-descriptors/ocm.software/app".into(),
            tag: Some("v1.0.0".into()),
            digest: "sha256:aaa".into(),
            media_type: Some("application/vnd.oci.image.manifest.v1+json".into()),
        });
        let data = index.to_vec().unwrap();
        assert_eq!(ArtifactIndex::from_slice(&data).unwrap(), index);
    }
}
