use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chunkferry_transfer::{TransferError, write_chunk_at};

/// Backing files, one per session, named by session id under `root`.
///
/// Blocking file I/O runs on the blocking pool.
#[derive(Debug, Clone)]
pub struct BlobStorage {
    root: PathBuf,
}

impl BlobStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }

    /// Creates an empty backing file; an existing file is left untouched.
    pub async fn create_empty(&self, session_id: &str) -> std::io::Result<()> {
        tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(self.path_for(session_id))
            .await?;
        Ok(())
    }

    /// Writes `data` at `offset` and flushes it durably.
    pub async fn write_chunk(
        &self,
        session_id: &str,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<(), TransferError> {
        let path = self.path_for(session_id);
        tokio::task::spawn_blocking(move || write_chunk_at(&path, offset, &data))
            .await
            .map_err(|e| TransferError::Io(std::io::Error::other(e)))?
    }

    /// Removes the backing file. A file that is already gone is not an error.
    ///
    /// Returns `true` if a file was deleted.
    pub async fn remove(&self, session_id: &str) -> std::io::Result<bool> {
        match tokio::fs::remove_file(self.path_for(session_id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Current size of the backing file, or `None` if it does not exist.
    pub async fn len(&self, session_id: &str) -> std::io::Result<Option<u64>> {
        match tokio::fs::metadata(self.path_for(session_id)).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}
