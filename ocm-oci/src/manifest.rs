//! Component-version manifest layout helpers.

use std::io::Read;

use ocm_desc::{ComponentDescriptor, Identity};
use serde::{Deserialize, Serialize};

use crate::store::OciDescriptor;
use crate::{
    ANNOTATION_COMPONENT_VERSION, COMPONENT_DESCRIPTOR_PREFIX, Error, MEDIA_TYPE_COMPONENT_INDEX,
    MEDIA_TYPE_DESCRIPTOR_JSON, MEDIA_TYPE_DESCRIPTOR_YAML, MEDIA_TYPE_DESCRIPTOR_YAML_TAR,
    MEDIA_TYPE_IMAGE_MANIFEST, Result,
};

/// File name inside a legacy `+yaml+tar` descriptor layer.
const DESCRIPTOR_TAR_ENTRY: &str = "component-descriptor.yaml";
/// Upper bound on a legacy TAR-wrapped descriptor.
const DESCRIPTOR_TAR_MAX: u64 = 1 << 30;

/// The fixed Component Index manifest, byte for byte.
///
/// Every component-version manifest names this manifest as its `subject`,
/// so referrer queries against it enumerate the component versions of a
/// repository. Its digest and size are constants; it is pushed once per
/// repository and never changes.
pub const COMPONENT_INDEX_MANIFEST: &str = r#"{"schemaVersion":2,"mediaType":"application/vnd.oci.image.manifest.v1+json","artifactType":"application/vnd.ocm.software.component-index.v1+json","config":{"mediaType":"application/vnd.oci.empty.v1+json","digest":"sha256:44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a","size":2},"layers":[{"mediaType":"application/vnd.oci.empty.v1+json","digest":"sha256:44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a","size":2}]}"#;
/// Digest of [`COMPONENT_INDEX_MANIFEST`].
pub const COMPONENT_INDEX_DIGEST: &str =
    "sha256:b402c58a88f618526d18badb0d071aca788ca619b4f927eecb7bd9b87e41b1f7";
/// Size of [`COMPONENT_INDEX_MANIFEST`] in bytes.
pub const COMPONENT_INDEX_SIZE: u64 = 450;

/// Descriptor of the fixed Component Index manifest.
pub fn component_index_descriptor() -> OciDescriptor {
    OciDescriptor {
        media_type: MEDIA_TYPE_IMAGE_MANIFEST.to_owned(),
        digest: COMPONENT_INDEX_DIGEST.to_owned(),
        size: COMPONENT_INDEX_SIZE,
        artifact_type: Some(MEDIA_TYPE_COMPONENT_INDEX.to_owned()),
        annotations: None,
    }
}

/// Config object of a component-version manifest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentConfig {
    /// Descriptor of the layer holding the encoded component descriptor.
    pub component_descriptor_layer: OciDescriptor,
}

/// What kind of element a layer belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum ArtifactKind {
    /// The layer holds a resource payload.
    Resource,
    /// The layer holds a source payload.
    Source,
}

#[derive(Serialize, Deserialize)]
struct ArtifactAnnotationEntry {
    identity: Identity,
    kind: ArtifactKind,
}

/// Builds the `software.ocm.artifact` annotation value for a layer.
pub fn artifact_annotation(identity: &Identity, kind: ArtifactKind) -> Result<String> {
    Ok(serde_json::to_string(&[ArtifactAnnotationEntry {
        identity: identity.clone(),
        kind,
    }])?)
}

/// Decodes a `software.ocm.artifact` annotation into `(identity, kind)` pairs.
pub fn parse_artifact_annotation(value: &str) -> Result<Vec<(Identity, ArtifactKind)>> {
    let entries: Vec<ArtifactAnnotationEntry> = serde_json::from_str(value)?;
    Ok(entries.into_iter().map(|e| (e.identity, e.kind)).collect())
}

/// Builds the `software.ocm.componentversion` annotation value.
pub fn component_version_annotation(name: &str, version: &str) -> String {
    format!("{COMPONENT_DESCRIPTOR_PREFIX}/{name}:{version}")
}

/// Splits a `software.ocm.componentversion` annotation into name and version.
pub fn parse_component_version_annotation(value: &str) -> Result<(String, String)> {
    let rest = value
        .strip_prefix(&format!("{COMPONENT_DESCRIPTOR_PREFIX}/"))
        .ok_or_else(|| {
            Error::MalformedManifest(format!(
                "{ANNOTATION_COMPONENT_VERSION} annotation {value:?} lacks the {COMPONENT_DESCRIPTOR_PREFIX} prefix"
            ))
        })?;
    let (name, version) = rest.rsplit_once(':').ok_or_else(|| {
        Error::MalformedManifest(format!(
            "{ANNOTATION_COMPONENT_VERSION} annotation {value:?} lacks a version"
        ))
    })?;
    Ok((name.to_owned(), version.to_owned()))
}

/// Descriptor for a blob about to be pushed.
pub fn blob_descriptor(media_type: &str, data: &[u8]) -> OciDescriptor {
    OciDescriptor {
        media_type: media_type.to_owned(),
        digest: ocm_desc::normalisation::content_digest(data),
        size: data.len() as u64,
        artifact_type: None,
        annotations: None,
    }
}

/// Decodes a descriptor layer according to its media type.
///
/// Supports the preferred `+json` encoding, plain `+yaml`, and the legacy
/// `+yaml+tar` form: a TAR stream holding exactly one
/// `component-descriptor.yaml` of at most 1 GiB.
pub fn decode_descriptor_layer(media_type: &str, data: &[u8]) -> Result<ComponentDescriptor> {
    match media_type {
        MEDIA_TYPE_DESCRIPTOR_JSON => Ok(ComponentDescriptor::from_json(data)?),
        MEDIA_TYPE_DESCRIPTOR_YAML => Ok(ComponentDescriptor::from_yaml(data)?),
        MEDIA_TYPE_DESCRIPTOR_YAML_TAR => decode_tar_wrapped(data),
        other => Err(Error::Unsupported(format!(
            "descriptor layer media type {other:?}"
        ))),
    }
}

fn decode_tar_wrapped(data: &[u8]) -> Result<ComponentDescriptor> {
    let mut archive = tar::Archive::new(data);
    let mut descriptor = None;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        if path.to_str() != Some(DESCRIPTOR_TAR_ENTRY) {
            return Err(Error::MalformedManifest(format!(
                "unexpected entry {path:?} in descriptor archive"
            )));
        }
        if descriptor.is_some() {
            return Err(Error::MalformedManifest(
                "descriptor archive holds more than one entry".into(),
            ));
        }
        if entry.header().size()? > DESCRIPTOR_TAR_MAX {
            return Err(Error::MalformedManifest(
                "descriptor archive entry exceeds 1 GiB".into(),
            ));
        }
        let mut yaml = Vec::new();
        entry.read_to_end(&mut yaml)?;
        descriptor = Some(ComponentDescriptor::from_yaml(&yaml)?);
    }
    descriptor.ok_or_else(|| {
        Error::MalformedManifest("descriptor archive holds no component-descriptor.yaml".into())
    })
}
