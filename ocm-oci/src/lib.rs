//! OCI storage adapter and component repository.
//!
//! The [`OciStore`] trait gives the construction engine one interface over
//! two backends: a remote OCI registry (distribution protocol, via
//! [`oci_client`]) and a local Common Transport Format archive. On top of
//! it, [`OciComponentRepository`] reads and writes component versions as
//! OCI manifests keyed by `component-descriptors/<name>:<version>`.

mod ctf_store;
mod manifest;
mod reference;
mod remote;
mod repository;
mod store;
mod transfer;

pub use ctf_store::{CtfArchive, CtfStore};
pub use manifest::{
    ArtifactKind, COMPONENT_INDEX_DIGEST, COMPONENT_INDEX_MANIFEST, COMPONENT_INDEX_SIZE,
    ComponentConfig, artifact_annotation, blob_descriptor, component_index_descriptor,
    component_version_annotation, decode_descriptor_layer, parse_artifact_annotation,
};
pub use reference::OciReference;
pub use remote::{RemoteRegistry, RemoteStore};
pub use repository::{ComponentRepository, ListingPolicy, OciComponentRepository, relaxed_semver};
pub use store::{Blob, OciDescriptor, OciImageIndex, OciImageManifest, OciStore, StoreProvider};
pub use transfer::{OciResourceRepository, ResourceRepository};

/// Synthetic registry host for CTF-backed stores.
pub const CTF_REGISTRY: &str = "ctf.ocm.software";
/// Repository namespace holding component versions.
pub const COMPONENT_DESCRIPTOR_PREFIX: &str = "component-descriptors";

/// OCI image manifest media type.
pub const MEDIA_TYPE_IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
/// OCI image index media type.
pub const MEDIA_TYPE_IMAGE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
/// The canonical empty JSON blob.
pub const MEDIA_TYPE_EMPTY_JSON: &str = "application/vnd.oci.empty.v1+json";
/// Fallback media type for raw blobs.
pub const MEDIA_TYPE_OCTET_STREAM: &str = "application/octet-stream";
/// Legacy artifact-set blobs: an OCI image packed as TAR+GZIP.
pub const MEDIA_TYPE_ARTIFACT_SET: &str = "application/vnd.oci.image.manifest.v1+tar+gzip";

/// Artifact type of component-version manifests.
pub const MEDIA_TYPE_COMPONENT_DESCRIPTOR: &str =
    "application/vnd.ocm.software.component-descriptor.v2";
/// Preferred descriptor layer encoding.
pub const MEDIA_TYPE_DESCRIPTOR_JSON: &str =
    "application/vnd.ocm.software.component-descriptor.v2+json";
/// YAML descriptor layer encoding.
pub const MEDIA_TYPE_DESCRIPTOR_YAML: &str =
    "application/vnd.ocm.software.component-descriptor.v2+yaml";
/// Legacy descriptor layer: a TAR holding one `component-descriptor.yaml`.
pub const MEDIA_TYPE_DESCRIPTOR_YAML_TAR: &str =
    "application/vnd.ocm.software.component-descriptor.v2+yaml+tar";
/// Media type of the component-version config object.
pub const MEDIA_TYPE_COMPONENT_CONFIG: &str =
    "application/vnd.ocm.software/ocm.component.config.v1+json";
/// Artifact type of the fixed Component Index manifest.
pub const MEDIA_TYPE_COMPONENT_INDEX: &str =
    "application/vnd.ocm.software.component-index.v1+json";

/// Annotation tying a manifest to its component version.
pub const ANNOTATION_COMPONENT_VERSION: &str = "software.ocm.componentversion";
/// Annotation naming the tool that created a manifest.
pub const ANNOTATION_CREATOR: &str = "software.ocm.creator";
/// Per-layer annotation mapping layers to element identities.
pub const ANNOTATION_ARTIFACT: &str = "software.ocm.artifact";
/// Standard OCI version annotation.
pub const ANNOTATION_IMAGE_VERSION: &str = "org.opencontainers.image.version";
/// Standard OCI title annotation.
pub const ANNOTATION_IMAGE_TITLE: &str = "org.opencontainers.image.title";

/// Creator string recorded in `software.ocm.creator`.
pub const CREATOR: &str = concat!("ocm-rs/", env!("CARGO_PKG_VERSION"));

/// Result type for adapter and repository operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from OCI adapter and component repository operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A reference string does not follow the loose OCI grammar.
    #[error("invalid reference {0:?}")]
    InvalidReference(String),

    /// A digest string is malformed.
    #[error("invalid digest {0:?}")]
    InvalidDigest(String),

    /// No artifact matches the reference.
    #[error("{0} not found")]
    NotFound(String),

    /// A tag points at a different digest than expected.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The backend cannot perform the requested operation.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A manifest or config object has an unexpected shape.
    #[error("malformed manifest: {0}")]
    MalformedManifest(String),

    /// Registry protocol error.
    #[error("registry: {0}")]
    Registry(String),

    /// CTF storage error.
    #[error(transparent)]
    Ctf(#[from] ocm_ctf::Error),

    /// Descriptor model error.
    #[error(transparent)]
    Desc(#[from] ocm_desc::Error),

    /// Filesystem I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
