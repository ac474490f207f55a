//! Filesystem-backed content-addressed blob storage.

use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest as _, Sha256, Sha512};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWriteExt as _};

use crate::index::{ARTIFACT_INDEX_FILE, ArtifactIndex};
use crate::{Error, Result, archive};

/// Directory holding content-addressed blobs.
pub const BLOBS_DIR: &str = "blobs";

/// Copy buffer size for blob writes.
const COPY_BUF_SIZE: usize = 1024 * 1024;

/// Physical representation of a CTF.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Format {
    /// A plain filesystem directory.
    Directory,
    /// A TAR archive of the directory layout.
    Tar,
    /// A gzip-compressed TAR archive.
    Tgz,
}

impl Format {
    /// Guesses the format from a path's file name.
    pub fn detect(path: &Path) -> Self {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Self::Tgz
        } else if name.ends_with(".tar") {
            Self::Tar
        } else {
            Self::Directory
        }
    }
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Directory => write!(f, "directory"),
            Self::Tar => write!(f, "tar"),
            Self::Tgz => write!(f, "tgz"),
        }
    }
}

/// Access mode a CTF was opened with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum AccessMode {
    /// Reads only; every mutating call fails with [`Error::ReadOnly`].
    ReadOnly,
    /// Reads and writes; missing directories are created.
    ReadWrite,
}

/// Maps `"<algo>:<hex>"` to the on-disk blob file name `<algo>.<hex>`.
pub fn to_blob_file_name(digest: &str) -> Result<String> {
    let (algo, hex) = digest
        .split_once(':')
        .ok_or_else(|| Error::InvalidDigest(digest.to_owned()))?;
    let algo_ok = !algo.is_empty() && algo.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
    let hex_ok = !hex.is_empty() && hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase());
    if !algo_ok || !hex_ok {
        return Err(Error::InvalidDigest(digest.to_owned()));
    }
    Ok(format!("{algo}.{hex}"))
}

/// Inverse of [`to_blob_file_name`].
pub fn to_digest(file_name: &str) -> Result<String> {
    let (algo, hex) = file_name
        .split_once('.')
        .ok_or_else(|| Error::InvalidDigest(file_name.to_owned()))?;
    let digest = format!("{algo}:{hex}");
    to_blob_file_name(&digest)?;
    Ok(digest)
}

/// An opened Common Transport Format store.
///
/// For TAR/TGZ archives the handle owns a temporary extraction directory;
/// dropping the handle discards it, so writable archive sessions must be
/// re-packed with [`crate::archive`] before the handle goes away.
#[derive(Debug)]
pub struct Ctf {
    root: PathBuf,
    format: Format,
    mode: AccessMode,
    /// Keeps the extraction directory of an archive-backed store alive.
    workdir: Option<tempfile::TempDir>,
}

impl Ctf {
    /// Opens a CTF at `path`, guessing the format from the file name.
    pub async fn open(path: impl AsRef<Path>, mode: AccessMode) -> Result<Self> {
        let path = path.as_ref();
        Self::open_format(path, Format::detect(path), mode).await
    }

    /// Opens a CTF at `path` with an explicit format.
    ///
    /// TAR and TGZ archives are extracted into a temporary directory first;
    /// read-write archive handles follow the extract-then-rearchive flow.
    pub async fn open_format(path: &Path, format: Format, mode: AccessMode) -> Result<Self> {
        match format {
            Format::Directory => {
                if !fs::try_exists(path).await? {
                    if mode == AccessMode::ReadOnly {
                        return Err(Error::NotFound(path.display().to_string()));
                    }
                    fs::create_dir_all(path.join(BLOBS_DIR)).await?;
                }
                Ok(Self {
                    root: path.to_path_buf(),
                    format,
                    mode,
                    workdir: None,
                })
            }
            Format::Tar | Format::Tgz => {
                let workdir = tempfile::TempDir::new()?;
                let root = workdir.path().to_path_buf();
                if fs::try_exists(path).await? {
                    let archive_path = path.to_path_buf();
                    let dest = root.clone();
                    tokio::task::spawn_blocking(move || {
                        archive::extract_tar(&dest, &archive_path, format)
                    })
                    .await
                    .map_err(io::Error::other)??;
                } else if mode == AccessMode::ReadOnly {
                    return Err(Error::NotFound(path.display().to_string()));
                }
                fs::create_dir_all(root.join(BLOBS_DIR)).await?;
                Ok(Self {
                    root,
                    format,
                    mode,
                    workdir: Some(workdir),
                })
            }
        }
    }

    /// Returns the format the store was opened as.
    pub const fn format(&self) -> Format {
        self.format
    }

    /// Returns the access mode of the handle.
    pub const fn mode(&self) -> AccessMode {
        self.mode
    }

    /// Filesystem root of the (possibly extracted) store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the decoded artifact index.
    ///
    /// A missing or zero-length index file yields the empty index; a present
    /// file is decoded strictly and its schema version checked.
    pub async fn get_index(&self) -> Result<ArtifactIndex> {
        let path = self.root.join(ARTIFACT_INDEX_FILE);
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(ArtifactIndex::default()),
            Err(e) => return Err(e.into()),
        };
        if data.is_empty() {
            return Ok(ArtifactIndex::default());
        }
        ArtifactIndex::from_slice(&data)
    }

    /// Atomically replaces the artifact index.
    pub async fn set_index(&self, index: &ArtifactIndex) -> Result<()> {
        self.require_writable()?;
        let data = index.to_vec()?;
        let tmp = self.root.join(format!("{ARTIFACT_INDEX_FILE}.tmp"));
        fs::write(&tmp, &data).await?;
        fs::rename(&tmp, self.root.join(ARTIFACT_INDEX_FILE)).await?;
        Ok(())
    }

    /// Lists the digests of all stored blobs.
    pub async fn list_blobs(&self) -> Result<Vec<String>> {
        let blobs_dir = self.root.join(BLOBS_DIR);
        let mut digests = Vec::new();
        let mut entries = match fs::read_dir(&blobs_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(digests),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            match to_digest(name) {
                Ok(digest) => digests.push(digest),
                // Stray files (e.g. interrupted temp writes) are skipped.
                Err(_) => tracing::debug!(file = name, "skipping non-blob file"),
            }
        }
        digests.sort_unstable();
        Ok(digests)
    }

    /// Filesystem path of the blob with the given digest.
    pub fn blob_path(&self, digest: &str) -> Result<PathBuf> {
        Ok(self.root.join(BLOBS_DIR).join(to_blob_file_name(digest)?))
    }

    /// Returns `true` if a blob with the given digest is stored.
    pub async fn has_blob(&self, digest: &str) -> Result<bool> {
        Ok(fs::try_exists(self.blob_path(digest)?).await?)
    }

    /// Reads a blob into memory.
    pub async fn get_blob(&self, digest: &str) -> Result<Vec<u8>> {
        match fs::read(self.blob_path(digest)?).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(Error::BlobNotFound(digest.to_owned()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Size in bytes of a stored blob.
    pub async fn blob_size(&self, digest: &str) -> Result<u64> {
        match fs::metadata(self.blob_path(digest)?).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(Error::BlobNotFound(digest.to_owned()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Stores an in-memory blob under its declared digest.
    pub async fn save_blob_bytes(&self, digest: &str, data: &[u8]) -> Result<()> {
        self.save_blob(digest, data, Some(data.len() as u64))
            .await
            .map(|_| ())
    }

    /// Streams a blob into the store under its declared digest.
    ///
    /// The store is content-addressed: the digest must be supplied up front
    /// and is verified against the written bytes. A positive `size` bounds
    /// the copy; otherwise the reader is drained to EOF through a 1 MiB
    /// buffer. The copy is cancel-safe; a partially written file is removed
    /// when the write does not commit.
    pub async fn save_blob(
        &self,
        digest: &str,
        mut reader: impl AsyncRead + Unpin,
        size: Option<u64>,
    ) -> Result<u64> {
        self.require_writable()?;
        let file_name = to_blob_file_name(digest)?;
        if self.has_blob(digest).await? {
            // Blobs are immutable; an existing file already holds this content.
            return self.blob_size(digest).await;
        }

        let blobs_dir = self.root.join(BLOBS_DIR);
        fs::create_dir_all(&blobs_dir).await?;
        let tmp = TmpFileGuard::new(blobs_dir.join(format!("{file_name}.part")));

        let mut file = fs::File::create(tmp.path()).await?;
        let mut hasher = BlobHasher::for_digest(digest)?;
        let mut buf = vec![0u8; COPY_BUF_SIZE];
        let mut remaining = size.filter(|s| *s > 0);
        let mut written: u64 = 0;
        loop {
            let want = match remaining {
                Some(0) => break,
                Some(r) => usize::try_from(r.min(COPY_BUF_SIZE as u64)).unwrap_or(COPY_BUF_SIZE),
                None => COPY_BUF_SIZE,
            };
            let n = reader.read(&mut buf[..want]).await?;
            if n == 0 {
                if remaining.is_some() {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("blob {digest} ended before its declared size"),
                    )
                    .into());
                }
                break;
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n]).await?;
            written += n as u64;
            if let Some(r) = &mut remaining {
                *r -= n as u64;
            }
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let actual = hasher.finish();
        if actual != digest {
            return Err(Error::DigestMismatch {
                expected: digest.to_owned(),
                actual,
            });
        }

        fs::rename(tmp.path(), blobs_dir.join(&file_name)).await?;
        tmp.commit();
        tracing::debug!(digest, size = written, "stored blob");
        Ok(written)
    }

    /// Removes a blob. Requires a read-write handle.
    pub async fn delete_blob(&self, digest: &str) -> Result<()> {
        self.require_writable()?;
        match fs::remove_file(self.blob_path(digest)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(Error::BlobNotFound(digest.to_owned()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn require_writable(&self) -> Result<()> {
        match self.mode {
            AccessMode::ReadWrite => Ok(()),
            AccessMode::ReadOnly => Err(Error::ReadOnly),
        }
    }
}

/// Digest computation matching the declared algorithm.
enum BlobHasher {
    Sha256(Box<Sha256>),
    Sha512(Box<Sha512>),
}

impl BlobHasher {
    fn for_digest(digest: &str) -> Result<Self> {
        match digest.split_once(':').map(|(algo, _)| algo) {
            Some("sha256") => Ok(Self::Sha256(Box::default())),
            Some("sha512") => Ok(Self::Sha512(Box::default())),
            _ => Err(Error::InvalidDigest(digest.to_owned())),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(data),
            Self::Sha512(h) => h.update(data),
        }
    }

    fn finish(self) -> String {
        match self {
            Self::Sha256(h) => format!("sha256:{}", hex::encode(h.finalize())),
            Self::Sha512(h) => format!("sha512:{}", hex::encode(h.finalize())),
        }
    }
}

/// Removes the temp file on drop unless the write committed.
struct TmpFileGuard {
    path: PathBuf,
    committed: std::cell::Cell<bool>,
}

impl TmpFileGuard {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            committed: std::cell::Cell::new(false),
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn commit(&self) {
        self.committed.set(true);
    }
}

impl Drop for TmpFileGuard {
    fn drop(&mut self) {
        if !self.committed.get() {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ArtifactMetadata;

    const TEST_DIGEST: &str =
        "sha256:9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

    #[test]
    fn blob_file_name_mapping() {
        assert_eq!(
            to_blob_file_name("sha256:abc123").unwrap(),
            "sha256.abc123"
        );
        assert_eq!(to_digest("sha256.abc123").unwrap(), "sha256:abc123");
        assert!(to_blob_file_name("no-colon").is_err());
        assert!(to_blob_file_name("sha256:XYZ").is_err());
        assert!(to_blob_file_name(":abc").is_err());
        assert!(to_digest("noseparator").is_err());
    }

    #[tokio::test]
    async fn save_and_get_blob() {
        let dir = tempfile::tempdir().unwrap();
        let ctf = Ctf::open(dir.path().join("ctf"), AccessMode::ReadWrite)
            .await
            .unwrap();

        ctf.save_blob_bytes(TEST_DIGEST, b"test").await.unwrap();
        assert_eq!(ctf.get_blob(TEST_DIGEST).await.unwrap(), b"test");
        assert_eq!(ctf.blob_size(TEST_DIGEST).await.unwrap(), 4);
        assert_eq!(ctf.list_blobs().await.unwrap(), vec![TEST_DIGEST.to_owned()]);
    }

    #[tokio::test]
    async fn save_blob_rejects_wrong_digest() {
        let dir = tempfile::tempdir().unwrap();
        let ctf = Ctf::open(dir.path().join("ctf"), AccessMode::ReadWrite)
            .await
            .unwrap();

        let err = ctf
            .save_blob_bytes(TEST_DIGEST, b"not the content")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DigestMismatch { .. }));
        // Nothing partial is left behind.
        assert!(ctf.list_blobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn save_blob_rejects_malformed_digest() {
        let dir = tempfile::tempdir().unwrap();
        let ctf = Ctf::open(dir.path().join("ctf"), AccessMode::ReadWrite)
            .await
            .unwrap();
        let err = ctf.save_blob_bytes("garbage", b"x").await.unwrap_err();
        assert!(matches!(err, Error::InvalidDigest(_)));
    }

    #[tokio::test]
    async fn save_blob_honors_declared_size() {
        let dir = tempfile::tempdir().unwrap();
        let ctf = Ctf::open(dir.path().join("ctf"), AccessMode::ReadWrite)
            .await
            .unwrap();

        // Declared size truncates the reader.
        let written = ctf
            .save_blob(TEST_DIGEST, &b"testEXTRA"[..], Some(4))
            .await
            .unwrap();
        assert_eq!(written, 4);
        assert_eq!(ctf.get_blob(TEST_DIGEST).await.unwrap(), b"test");
    }

    #[tokio::test]
    async fn read_only_refuses_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctf");
        drop(
            Ctf::open(&path, AccessMode::ReadWrite).await.unwrap(),
        );
        let ctf = Ctf::open(&path, AccessMode::ReadOnly).await.unwrap();

        assert!(matches!(
            ctf.save_blob_bytes(TEST_DIGEST, b"test").await,
            Err(Error::ReadOnly)
        ));
        assert!(matches!(
            ctf.set_index(&ArtifactIndex::default()).await,
            Err(Error::ReadOnly)
        ));
        assert!(matches!(ctf.delete_blob(TEST_DIGEST).await, Err(Error::ReadOnly)));
    }

    #[tokio::test]
    async fn missing_index_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ctf = Ctf::open(dir.path().join("ctf"), AccessMode::ReadWrite)
            .await
            .unwrap();
        let index = ctf.get_index().await.unwrap();
        assert_eq!(index, ArtifactIndex::default());

        // Zero-length file behaves the same.
        tokio::fs::write(ctf.root().join(ARTIFACT_INDEX_FILE), b"")
            .await
            .unwrap();
        assert_eq!(ctf.get_index().await.unwrap(), ArtifactIndex::default());
    }

    #[tokio::test]
    async fn delete_blob_requires_existing() {
        let dir = tempfile::tempdir().unwrap();
        let ctf = Ctf::open(dir.path().join("ctf"), AccessMode::ReadWrite)
            .await
            .unwrap();
        assert!(matches!(
            ctf.delete_blob(TEST_DIGEST).await,
            Err(Error::BlobNotFound(_))
        ));
        ctf.save_blob_bytes(TEST_DIGEST, b"test").await.unwrap();
        ctf.delete_blob(TEST_DIGEST).await.unwrap();
        assert!(!ctf.has_blob(TEST_DIGEST).await.unwrap());
    }

    #[tokio::test]
    async fn ctf_round_trip_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transport");

        let ctf = Ctf::open(&path, AccessMode::ReadWrite).await.unwrap();
        ctf.save_blob_bytes(TEST_DIGEST, b"test").await.unwrap();
        let mut index = ctf.get_index().await.unwrap();
        index.add_artifact(ArtifactMetadata {
            repository: "test-repo".into(),
            tag: Some("v1".into()),
            digest: TEST_DIGEST.into(),
            media_type: Some("application/json".into()),
        });
        ctf.set_index(&index).await.unwrap();
        drop(ctf);

        let reopened = Ctf::open(&path, AccessMode::ReadOnly).await.unwrap();
        assert_eq!(
            reopened.list_blobs().await.unwrap(),
            vec![TEST_DIGEST.to_owned()]
        );
        let index = reopened.get_index().await.unwrap();
        assert_eq!(index.artifacts.len(), 1);
        let artifact = &index.artifacts[0];
        assert_eq!(artifact.repository, "test-repo");
        assert_eq!(artifact.tag.as_deref(), Some("v1"));
        assert_eq!(artifact.digest, TEST_DIGEST);
        assert_eq!(artifact.media_type.as_deref(), Some("application/json"));
    }
}
