//! Common Transport Format (CTF) storage.
//!
//! A CTF is a content-addressed blob store plus a tagged artifact index,
//! laid out as
//!
//! ```text
//! <root>/
//!   artifact-index.json        — { "schemaVersion": 1, "artifacts": [...] }
//!   blobs/
//!     sha256.<hex>             — binary blob content
//! ```
//!
//! either directly on the filesystem or packed into a TAR / TGZ archive.
//! Archives are opened by extraction into a temporary directory; writable
//! archive handles are re-packed with [`archive`] on success.

mod archive;
mod index;
mod store;

pub use archive::{TarBlobSource, archive, archive_directory, archive_tar_to_writer, extract_tar};
pub use index::{
    ARTIFACT_INDEX_FILE, ARTIFACT_INDEX_SCHEMA_VERSION, ArtifactIndex, ArtifactMetadata,
};
pub use store::{AccessMode, BLOBS_DIR, Ctf, Format, to_blob_file_name, to_digest};

/// Result type for CTF operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from CTF storage operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A digest string is not of the form `<algorithm>:<hex>`.
    #[error("invalid digest {0:?}")]
    InvalidDigest(String),

    /// No blob with the given digest exists in the store.
    #[error("blob {0} not found")]
    BlobNotFound(String),

    /// The store or archive does not exist.
    #[error("no CTF at {0}")]
    NotFound(String),

    /// The artifact index carries an unsupported schema version.
    #[error("artifact index schema version {0} is not supported")]
    SchemaVersion(u32),

    /// The requested operation does not apply to the given format.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Stored content does not match its declared digest.
    #[error("digest mismatch: expected {expected}, computed {actual}")]
    DigestMismatch {
        /// Digest the caller declared.
        expected: String,
        /// Digest computed from the written bytes.
        actual: String,
    },

    /// A mutating operation was attempted on a read-only handle.
    #[error("CTF is opened read-only")]
    ReadOnly,

    /// A TAR entry tried to escape the extraction root.
    #[error("tar entry {0:?} escapes the archive root")]
    InsecureTarPath(String),

    /// A blob without a known size cannot be written to a TAR stream.
    #[error("blob {0} has unknown size; TAR entries require one")]
    UnknownSize(String),

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// Filesystem I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Index encoding or decoding error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
