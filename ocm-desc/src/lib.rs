//! Component descriptor data model for the OCM toolchain.
//!
//! A *component descriptor* is the canonical record of a component version:
//! its identity, provider, and the typed resources, sources, and references
//! it aggregates. This crate owns the wire model (JSON and YAML), identity
//! and uniqueness validation, the typed access/input envelope, and the
//! canonical normalization used for inter-component reference digests.
//!
//! Storage and construction live in the sibling crates; everything here is
//! pure data.

mod access;
mod descriptor;
mod element;
pub mod normalisation;

pub use access::{
    ACCESS_TYPE_LOCAL_BLOB, ACCESS_TYPE_OCI_IMAGE, AccessKind, AccessSchemes, LocalBlobAccess,
    OciImageAccess, TypedSpec,
};
pub use descriptor::{
    Component, ComponentDescriptor, Label, Provider, SCHEMA_VERSION_V2,
};
pub use element::{
    DigestSpec, ElementMeta, Identity, Reference, Resource, ResourceRelation, Source, SourceRef,
};

/// Result type for descriptor operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from descriptor decoding and validation.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A structural rule of the descriptor model was violated.
    #[error("validation: {0}")]
    Validation(String),

    /// Two elements of the same list share one identity.
    #[error("duplicate {kind} identity {identity} in component {component}")]
    DuplicateIdentity {
        /// Element list the duplicate was found in (`resource`, `source`, `reference`).
        kind: &'static str,
        /// The offending identity, rendered as `k=v` pairs.
        identity: String,
        /// Name of the containing component.
        component: String,
    },

    /// The descriptor carries an unsupported schema version.
    #[error("unsupported descriptor schema version {0:?}")]
    SchemaVersion(String),

    /// JSON encoding or decoding failed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// YAML encoding or decoding failed.
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}
