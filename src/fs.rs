//! File system abstraction for testability.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

/// Abstraction over file system operations for testability.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Returns the size of a file if it exists.
    async fn file_size(&self, path: &Path) -> Option<u64>;

    /// Creates all directories in the given path.
    async fn create_dir_all(&self, path: &Path) -> std::io::Result<()>;

    /// Writes `data` to a new file at `path` and flushes it to stable storage.
    async fn write_durable(&self, path: &Path, data: &[u8]) -> std::io::Result<()>;

    /// Creates (truncating) a file for writing.
    async fn create_file(&self, path: &Path) -> std::io::Result<tokio::fs::File>;

    /// Opens an existing file for reading.
    async fn open_file(&self, path: &Path) -> std::io::Result<tokio::fs::File>;

    /// Renames a file, replacing the destination.
    async fn rename_file(&self, from: &Path, to: &Path) -> std::io::Result<()>;

    /// Removes a file.
    async fn remove_file(&self, path: &Path) -> std::io::Result<()>;

    /// Removes a directory and everything below it.
    async fn remove_dir_all(&self, path: &Path) -> std::io::Result<()>;

    /// Lists the entries of a directory. A missing directory lists as empty.
    async fn list_dir(&self, path: &Path) -> std::io::Result<Vec<PathBuf>>;
}

/// Default file system implementation using `tokio::fs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioFileSystem;

impl TokioFileSystem {
    /// Creates a new `TokioFileSystem` instance.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FileSystem for TokioFileSystem {
    async fn file_size(&self, path: &Path) -> Option<u64> {
        tokio::fs::metadata(path).await.ok().map(|m| m.len())
    }

    async fn create_dir_all(&self, path: &Path) -> std::io::Result<()> {
        tokio::fs::create_dir_all(path).await
    }

    async fn write_durable(&self, path: &Path, data: &[u8]) -> std::io::Result<()> {
        let mut file = tokio::fs::File::create(path).await?;
        file.write_all(data).await?;
        file.sync_all().await
    }

    async fn create_file(&self, path: &Path) -> std::io::Result<tokio::fs::File> {
        tokio::fs::File::create(path).await
    }

    async fn open_file(&self, path: &Path) -> std::io::Result<tokio::fs::File> {
        tokio::fs::File::open(path).await
    }

    async fn rename_file(&self, from: &Path, to: &Path) -> std::io::Result<()> {
        tokio::fs::rename(from, to).await
    }

    async fn remove_file(&self, path: &Path) -> std::io::Result<()> {
        tokio::fs::remove_file(path).await
    }

    async fn remove_dir_all(&self, path: &Path) -> std::io::Result<()> {
        tokio::fs::remove_dir_all(path).await
    }

    async fn list_dir(&self, path: &Path) -> std::io::Result<Vec<PathBuf>> {
        let mut entries = match tokio::fs::read_dir(path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            paths.push(entry.path());
        }
        Ok(paths)
    }
}
