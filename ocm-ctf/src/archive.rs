//! Conversion between the directory and TAR / TGZ representations.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::index::{ARTIFACT_INDEX_FILE, ArtifactIndex};
use crate::store::{BLOBS_DIR, Ctf, Format, to_blob_file_name};
use crate::{Error, Result};

/// A blob to be written into a TAR stream.
///
/// TAR entries need a size header up front, so sources without a known
/// size are rejected.
#[derive(Debug)]
pub struct TarBlobSource {
    /// Content digest of the blob.
    pub digest: String,
    /// File the blob content is read from.
    pub path: PathBuf,
    /// Size in bytes, when known.
    pub size: Option<u64>,
}

/// Extracts a CTF archive into `dest`.
///
/// Regular entries are written through the filesystem; entries whose path
/// contains `..` (or is absolute) are rejected.
pub fn extract_tar(dest: &Path, archive: &Path, format: Format) -> Result<()> {
    let file = File::open(archive)?;
    match format {
        Format::Tar => extract_entries(file, dest),
        Format::Tgz => extract_entries(GzDecoder::new(file), dest),
        Format::Directory => Err(Error::UnsupportedFormat(
            "a directory CTF is not an archive".into(),
        )),
    }
}

fn extract_entries(reader: impl Read, dest: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            return Err(Error::InsecureTarPath(path.display().to_string()));
        }

        let entry_type = entry.header().entry_type();
        if entry_type.is_dir() {
            std::fs::create_dir_all(dest.join(&path))?;
            continue;
        }
        if !entry_type.is_file() {
            continue;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(dest.join(parent))?;
        }
        let mut out = File::create(dest.join(&path))?;
        io::copy(&mut entry, &mut out)?;
    }
    Ok(())
}

/// Writes the contents of `ctf` to `dest` in the requested format.
pub async fn archive(ctf: &Ctf, dest: &Path, format: Format) -> Result<()> {
    match format {
        Format::Directory => archive_directory(ctf, dest).await,
        Format::Tar | Format::Tgz => {
            let index = ctf.get_index().await?;
            let mut blobs = Vec::new();
            for digest in ctf.list_blobs().await? {
                let path = ctf.blob_path(&digest)?;
                let size = ctf.blob_size(&digest).await?;
                blobs.push(TarBlobSource {
                    digest,
                    path,
                    size: Some(size),
                });
            }
            let dest = dest.to_path_buf();
            tokio::task::spawn_blocking(move || -> Result<()> {
                let file = File::create(&dest)?;
                archive_tar_to_writer(&index, &blobs, file, format)
            })
            .await
            .map_err(io::Error::other)?
        }
    }
}

/// Copies a CTF into a plain directory at `dest`.
///
/// Blobs are copied through a bounded worker pool; the index is written
/// last, after every blob is in place.
pub async fn archive_directory(ctf: &Ctf, dest: &Path) -> Result<()> {
    let blobs_dest = dest.join(BLOBS_DIR);
    tokio::fs::create_dir_all(&blobs_dest).await?;

    let workers = std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(4);
    let semaphore = Arc::new(Semaphore::new(workers));
    let mut tasks: JoinSet<io::Result<()>> = JoinSet::new();
    for digest in ctf.list_blobs().await? {
        let permit = Arc::clone(&semaphore)
            .acquire_owned()
            .await
            .map_err(|_| Error::Cancelled)?;
        let src = ctf.blob_path(&digest)?;
        let dst = blobs_dest.join(to_blob_file_name(&digest)?);
        tasks.spawn(async move {
            let _permit = permit;
            tokio::fs::copy(&src, &dst).await.map(|_| ())
        });
    }
    while let Some(joined) = tasks.join_next().await {
        match joined.map_err(io::Error::other)? {
            Ok(()) => {}
            Err(e) => {
                tasks.abort_all();
                return Err(e.into());
            }
        }
    }

    let index = ctf.get_index().await?;
    tokio::fs::write(dest.join(ARTIFACT_INDEX_FILE), index.to_vec()?).await?;
    Ok(())
}

/// Streams a CTF as a TAR (or gzip-wrapped TAR) into `writer`.
///
/// The index is the first entry so readers can locate artifacts without
/// scanning the whole stream; blobs follow sequentially.
pub fn archive_tar_to_writer<W: Write>(
    index: &ArtifactIndex,
    blobs: &[TarBlobSource],
    writer: W,
    format: Format,
) -> Result<()> {
    match format {
        Format::Tar => {
            write_tar(index, blobs, writer)?;
            Ok(())
        }
        Format::Tgz => {
            let encoder = write_tar(index, blobs, GzEncoder::new(writer, Compression::default()))?;
            encoder.finish()?;
            Ok(())
        }
        Format::Directory => Err(Error::UnsupportedFormat(
            "directory output needs archive_directory".into(),
        )),
    }
}

fn write_tar<W: Write>(index: &ArtifactIndex, blobs: &[TarBlobSource], writer: W) -> Result<W> {
    let mut builder = tar::Builder::new(writer);

    let index_bytes = index.to_vec()?;
    append_entry(
        &mut builder,
        ARTIFACT_INDEX_FILE,
        index_bytes.len() as u64,
        index_bytes.as_slice(),
    )?;

    for blob in blobs {
        let size = blob
            .size
            .ok_or_else(|| Error::UnknownSize(blob.digest.clone()))?;
        let name = format!("{BLOBS_DIR}/{}", to_blob_file_name(&blob.digest)?);
        let file = File::open(&blob.path)?;
        append_entry(&mut builder, &name, size, file)?;
    }

    Ok(builder.into_inner()?)
}

fn append_entry<W: Write>(
    builder: &mut tar::Builder<W>,
    path: &str,
    size: u64,
    reader: impl Read,
) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(size);
    header.set_mode(0o644);
    builder.append_data(&mut header, path, reader)?;
    Ok(())
}
