//! Scoped file access for the on-disk formats
//!
//! Every store operation opens its file, runs a short sequence of
//! positioned reads and writes, and closes it again. `StoreFile::finish`
//! is the close step: it flushes outstanding writes and decides which
//! error wins when both the operation and the close fail.

use crate::storage::error::{StorageError, StorageResult};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

/// An open store file with positioned read/write helpers
pub struct StoreFile {
    file: File,
    path: PathBuf,
}

impl StoreFile {
    /// Open an existing file for reading and writing
    pub async fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path).await?;
        Ok(Self { file, path })
    }

    /// Open an existing file read-only
    pub async fn open_read(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).await?;
        Ok(Self { file, path })
    }

    /// Create (or truncate) a file, creating the parent directory if needed
    pub async fn create(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await?;
        Ok(Self { file, path })
    }

    /// Create a file only if it does not already exist.
    ///
    /// Returns `None` when the file was already there.
    pub async fn create_new(path: impl AsRef<Path>) -> StorageResult<Option<Self>> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => Ok(Some(Self { file, path })),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current file length, after any buffered writes have landed
    pub async fn len(&mut self) -> StorageResult<u64> {
        self.file.flush().await?;
        Ok(self.file.metadata().await?.len())
    }

    /// Grow the file to at least `len` bytes
    pub async fn ensure_len(&mut self, len: u64) -> StorageResult<()> {
        if self.len().await? < len {
            self.file.set_len(len).await?;
        }
        Ok(())
    }

    /// Fill `buf` from `offset`; a short file is an error
    pub async fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> StorageResult<()> {
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.read_exact(buf).await.map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                StorageError::Corruption(format!(
                    "{}: expected {} bytes at offset {}",
                    self.path.display(),
                    buf.len(),
                    offset
                ))
            } else {
                StorageError::Io(e)
            }
        })?;
        Ok(())
    }

    /// Read as much of `buf` as the file holds from `offset`.
    ///
    /// Returns the number of bytes read; less than `buf.len()` only at EOF.
    pub async fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> StorageResult<usize> {
        self.file.seek(SeekFrom::Start(offset)).await?;
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    pub async fn write_at(&mut self, offset: u64, bytes: &[u8]) -> StorageResult<()> {
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(bytes).await?;
        Ok(())
    }

    /// Seek to `offset` and hand out the underlying handle
    pub async fn into_inner_at(mut self, offset: u64) -> StorageResult<File> {
        self.file.seek(SeekFrom::Start(offset)).await?;
        Ok(self.file)
    }

    /// Close the file after an operation body has run.
    ///
    /// A close failure is returned when the body succeeded. When the body
    /// already failed its error is kept and the close failure is logged.
    pub async fn finish<T>(mut self, result: StorageResult<T>) -> StorageResult<T> {
        let closed = self.file.flush().await;
        match (result, closed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(close_err)) => Err(StorageError::Io(close_err)),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(close_err)) => {
                tracing::warn!(
                    "Close of {:?} failed while handling error ({}): {}",
                    self.path,
                    err,
                    close_err
                );
                Err(err)
            }
        }
    }
}

/// `true` if `path` exists; errors other than NotFound are propagated
pub async fn exists(path: &Path) -> StorageResult<bool> {
    match tokio::fs::metadata(path).await {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_positioned_io() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("data.bin");

        let mut file = StoreFile::create(&path).await.unwrap();
        file.write_at(4, b"abcd").await.unwrap();
        assert_eq!(file.len().await.unwrap(), 8);

        let mut buf = [0u8; 4];
        file.read_exact_at(4, &mut buf).await.unwrap();
        assert_eq!(&buf, b"abcd");

        // Partial read at the tail
        let mut big = [0u8; 16];
        let n = file.read_at(6, &mut big).await.unwrap();
        assert_eq!(n, 2);
        assert_eq!(&big[..2], b"cd");

        // Exact read past EOF is corruption, not a bare EOF
        let err = file.read_exact_at(6, &mut buf).await.unwrap_err();
        assert!(matches!(err, StorageError::Corruption(_)));

        file.finish(Ok(())).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_new_does_not_clobber() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("once.bin");

        let file = StoreFile::create_new(&path).await.unwrap().unwrap();
        file.finish(Ok(())).await.unwrap();
        assert!(StoreFile::create_new(&path).await.unwrap().is_none());
        assert!(exists(&path).await.unwrap());
    }

    #[tokio::test]
    async fn test_finish_keeps_body_error() {
        let dir = tempdir().unwrap();
        let file = StoreFile::create(dir.path().join("f.bin")).await.unwrap();
        let result: StorageResult<()> = Err(StorageError::NotFound("x".into()));
        let err = file.finish(result).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
