//! Construction engine for Open Component Model component versions.
//!
//! A declarative *constructor* lists components with typed resources,
//! sources, and references. [`ConstructionEngine::construct`] discovers the
//! transitive graph of referenced component versions, processes every
//! element through pluggable input methods or access resolvers, computes
//! normalized digests for inter-component references, and writes the
//! resulting descriptors to a target repository in reverse topological
//! order — leaves first, so every reference digest is known when its
//! referrer is assembled.
//!
//! ```no_run
//! use std::sync::Arc;
//! use ocm::{ConstructionEngine, Constructor, StaticTargetProvider};
//! use ocm_ctf::AccessMode;
//! use ocm_oci::{CtfArchive, OciComponentRepository};
//!
//! # async fn run() -> ocm::Result<()> {
//! let archive = CtfArchive::open("./transport-archive", AccessMode::ReadWrite).await?;
//! let repository = Arc::new(OciComponentRepository::new(Arc::new(archive)));
//! let engine = ConstructionEngine::new(Arc::new(StaticTargetProvider::new(repository)));
//!
//! let constructor = Constructor::from_yaml(&std::fs::read("components.yaml")?)?;
//! let descriptors = engine.construct(&constructor).await?;
//! # Ok(())
//! # }
//! ```

mod constructor;
mod engine;
mod graph;
mod hooks;
mod input;
mod provider;

pub use constructor::{
    Constructor, ConstructorComponent, CopyPolicy, ResourceSpec, SourceSpec,
};
pub use engine::{
    ConflictPolicy, ConstructOptions, ConstructionEngine, ExternalComponentPolicy,
};
pub use graph::{ComponentGraph, NodeKind};
pub use hooks::{ConstructionHooks, NoopHooks};
pub use input::{
    Credentials, CredentialResolver, FileInput, InputMethodRegistry, InputResult,
    ResourceInputMethod, SourceInputMethod, Utf8Input,
};
pub use provider::{
    ExternalComponentProvider, NoExternalComponents, RepositoryComponentProvider,
    StaticTargetProvider, TargetRepositoryProvider,
};

use ocm_desc::ComponentDescriptor;

/// Result type for construction operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from constructor validation and construction.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The constructor document violates a structural rule.
    #[error("validation: {0}")]
    Validation(String),

    /// A component version already exists under `AbortAndFail`.
    #[error("component version {name}:{version} already exists")]
    AlreadyExists {
        /// Component name.
        name: String,
        /// Component version.
        version: String,
        /// The descriptor already present in the target repository.
        existing: Box<ComponentDescriptor>,
    },

    /// No input method is registered for an input type.
    #[error("no input method registered for type {0:?}")]
    UnknownInputType(String),

    /// A referenced component version exists neither in the constructor nor
    /// in the external repository.
    #[error("referenced component {0} not found")]
    MissingComponent(String),

    /// Adding a reference edge would close a cycle.
    #[error("reference cycle involving {0}")]
    Cycle(String),

    /// A concurrent construction task was cancelled or panicked.
    #[error("construction cancelled: {0}")]
    Cancelled(String),

    /// Descriptor model error.
    #[error(transparent)]
    Desc(#[from] ocm_desc::Error),

    /// Storage or repository error.
    #[error(transparent)]
    Oci(#[from] ocm_oci::Error),

    /// Filesystem I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Constructor JSON decoding error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Constructor YAML decoding error.
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}
