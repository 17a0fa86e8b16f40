use std::{io, path::Path};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream::BoxStream, StreamExt};
use data_model::StreamMetrics;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use tokio::{fs, io::AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::debug;

pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Raw filesystem primitives used by the engine. Implementations must be
/// safe for concurrent use on disjoint paths; the engine serializes
/// operations on the same blob. The trait seam exists so tests can count
/// calls and simulate capability failures.
#[async_trait]
pub trait FileOperations: Send + Sync {
    /// Streams `data` into a freshly created file, hashing the bytes in the
    /// same pass.
    async fn write_stream(&self, dest: &Path, data: ByteStream) -> io::Result<StreamMetrics>;

    async fn open_read(&self, path: &Path) -> io::Result<ByteStream>;

    async fn copy(&self, source: &Path, dest: &Path) -> io::Result<()>;

    /// Non-atomic move: rename where possible, copy + delete across
    /// filesystems. The destination may transiently show partial content.
    async fn move_file(&self, source: &Path, dest: &Path) -> io::Result<()>;

    /// Atomic rename. Surfaces the platform error when the source/target
    /// pair does not support it; callers fall back to [`Self::move_file`].
    async fn move_atomic(&self, source: &Path, dest: &Path) -> io::Result<()>;

    /// Atomic rename onto a destination that may already exist.
    async fn overwrite_atomic(&self, source: &Path, dest: &Path) -> io::Result<()>;

    /// Non-atomic overwrite fallback: copy over the destination, then
    /// delete the source.
    async fn overwrite(&self, source: &Path, dest: &Path) -> io::Result<()>;

    async fn hard_link(&self, source: &Path, dest: &Path) -> io::Result<()>;

    /// Returns whether a file existed and was removed.
    async fn delete(&self, path: &Path) -> io::Result<bool>;

    async fn delete_quietly(&self, path: &Path);

    async fn exists(&self, path: &Path) -> bool;

    async fn file_size(&self, path: &Path) -> io::Result<u64>;

    /// Removes a directory tree containing no regular files. Returns false
    /// without deleting anything when a file is found.
    async fn delete_empty_directory(&self, path: &Path) -> io::Result<bool>;
}

/// Signals that the source/target pair does not support atomic rename and
/// the engine should fall back to copy + delete permanently.
pub fn is_atomic_move_unsupported(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::CrossesDevices | io::ErrorKind::Unsupported
    )
}

/// Transient locked-file conditions worth one synchronous retry through the
/// copy + delete path.
pub fn is_transient_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::PermissionDenied | io::ErrorKind::ResourceBusy | io::ErrorKind::WouldBlock
    )
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileOperations;

impl LocalFileOperations {
    async fn ensure_parent(path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl FileOperations for LocalFileOperations {
    async fn write_stream(&self, dest: &Path, mut data: ByteStream) -> io::Result<StreamMetrics> {
        Self::ensure_parent(dest).await?;
        let mut file = fs::File::create(dest).await?;
        let mut sha1 = Sha1::new();
        let mut sha256 = Sha256::new();
        let mut size: u64 = 0;
        while let Some(chunk) = data.next().await {
            let chunk = chunk?;
            sha1.update(&chunk);
            sha256.update(&chunk);
            size += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(StreamMetrics {
            size,
            sha1: hex::encode(sha1.finalize()),
            sha256: Some(hex::encode(sha256.finalize())),
        })
    }

    async fn open_read(&self, path: &Path) -> io::Result<ByteStream> {
        let file = fs::File::open(path).await?;
        Ok(Box::pin(ReaderStream::new(file)))
    }

    async fn copy(&self, source: &Path, dest: &Path) -> io::Result<()> {
        Self::ensure_parent(dest).await?;
        fs::copy(source, dest).await?;
        Ok(())
    }

    async fn move_file(&self, source: &Path, dest: &Path) -> io::Result<()> {
        Self::ensure_parent(dest).await?;
        match fs::rename(source, dest).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::CrossesDevices => {
                fs::copy(source, dest).await?;
                fs::remove_file(source).await
            }
            Err(err) => Err(err),
        }
    }

    async fn move_atomic(&self, source: &Path, dest: &Path) -> io::Result<()> {
        Self::ensure_parent(dest).await?;
        fs::rename(source, dest).await
    }

    #[cfg(unix)]
    async fn overwrite_atomic(&self, source: &Path, dest: &Path) -> io::Result<()> {
        // rename(2) atomically replaces an existing destination
        Self::ensure_parent(dest).await?;
        fs::rename(source, dest).await
    }

    #[cfg(not(unix))]
    async fn overwrite_atomic(&self, source: &Path, dest: &Path) -> io::Result<()> {
        Self::ensure_parent(dest).await?;
        match fs::remove_file(dest).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        fs::rename(source, dest).await
    }

    async fn overwrite(&self, source: &Path, dest: &Path) -> io::Result<()> {
        Self::ensure_parent(dest).await?;
        fs::copy(source, dest).await?;
        fs::remove_file(source).await
    }

    async fn hard_link(&self, source: &Path, dest: &Path) -> io::Result<()> {
        Self::ensure_parent(dest).await?;
        fs::hard_link(source, dest).await
    }

    async fn delete(&self, path: &Path) -> io::Result<bool> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn delete_quietly(&self, path: &Path) {
        if let Err(err) = fs::remove_file(path).await {
            if err.kind() != io::ErrorKind::NotFound {
                debug!(path = %path.display(), "quiet delete failed: {err}");
            }
        }
    }

    async fn exists(&self, path: &Path) -> bool {
        fs::try_exists(path).await.unwrap_or(false)
    }

    async fn file_size(&self, path: &Path) -> io::Result<u64> {
        Ok(fs::metadata(path).await?.len())
    }

    async fn delete_empty_directory(&self, path: &Path) -> io::Result<bool> {
        let mut pending = vec![path.to_path_buf()];
        let mut discovered = Vec::new();
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == io::ErrorKind::NotFound && dir == path => {
                    return Ok(true)
                }
                Err(err) => return Err(err),
            };
            discovered.push(dir);
            while let Some(entry) = entries.next_entry().await? {
                if entry.file_type().await?.is_dir() {
                    pending.push(entry.path());
                } else {
                    return Ok(false);
                }
            }
        }
        for dir in discovered.iter().rev() {
            match fs::remove_dir(dir).await {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                // lost a race with a concurrent writer
                Err(err) if err.kind() == io::ErrorKind::DirectoryNotEmpty => return Ok(false),
                Err(err) => return Err(err),
            }
        }
        Ok(true)
    }
}
