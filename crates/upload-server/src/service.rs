use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chunkferry_protocol::constants::DEFAULT_CHUNK_SIZE;
use chunkferry_store::SessionStore;
use tokio_util::task::TaskTracker;
use tracing::error;

use crate::UploadError;
use crate::locks::{ActiveClaims, ChunkLocks};
use crate::storage::BlobStorage;

/// Largest file accepted for upload unless configured otherwise (64 GiB).
pub const DEFAULT_MAX_FILE_SIZE: u64 = 64 * 1024 * 1024 * 1024;

/// Upload service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Directory holding one backing file per session.
    pub upload_dir: PathBuf,
    /// Chunk size assigned to new sessions.
    pub chunk_size: u64,
    /// Establish requests for larger files are rejected.
    pub max_file_size: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            upload_dir: PathBuf::from("uploads"),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

/// Counters since the service started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceStats {
    pub chunks_written: u64,
    pub duplicate_chunks: u64,
    pub sessions_completed: u64,
    pub sessions_failed: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) chunks_written: AtomicU64,
    pub(crate) duplicate_chunks: AtomicU64,
    pub(crate) sessions_completed: AtomicU64,
    pub(crate) sessions_failed: AtomicU64,
}

impl Counters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Server-side upload protocol: session resolution, chunk receipt and
/// finalization over a [`SessionStore`] and a [`BlobStorage`].
///
/// Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct UploadService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    store: Arc<SessionStore>,
    storage: BlobStorage,
    config: ServiceConfig,
    locks: ChunkLocks,
    claims: ActiveClaims,
    tasks: TaskTracker,
    counters: Counters,
}

impl UploadService {
    /// Creates the service, making sure the upload directory exists.
    pub fn new(store: Arc<SessionStore>, config: ServiceConfig) -> Result<Self, UploadError> {
        if config.chunk_size == 0 {
            return Err(UploadError::BadRequest("chunk size must be positive".into()));
        }
        std::fs::create_dir_all(&config.upload_dir)?;
        Ok(Self {
            inner: Arc::new(ServiceInner {
                store,
                storage: BlobStorage::new(config.upload_dir.clone()),
                config,
                locks: ChunkLocks::new(),
                claims: ActiveClaims::new(),
                tasks: TaskTracker::new(),
                counters: Counters::default(),
            }),
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.inner.store
    }

    pub fn storage(&self) -> &BlobStorage {
        &self.inner.storage
    }

    pub fn claims(&self) -> &ActiveClaims {
        &self.inner.claims
    }

    pub(crate) fn locks(&self) -> &ChunkLocks {
        &self.inner.locks
    }

    pub(crate) fn counters(&self) -> &Counters {
        &self.inner.counters
    }

    pub fn stats(&self) -> ServiceStats {
        let c = &self.inner.counters;
        ServiceStats {
            chunks_written: c.chunks_written.load(Ordering::Relaxed),
            duplicate_chunks: c.duplicate_chunks.load(Ordering::Relaxed),
            sessions_completed: c.sessions_completed.load(Ordering::Relaxed),
            sessions_failed: c.sessions_failed.load(Ordering::Relaxed),
        }
    }

    /// Runs a store operation on the blocking pool.
    pub(crate) async fn db<T, F>(&self, f: F) -> Result<T, UploadError>
    where
        F: FnOnce(&SessionStore) -> chunkferry_store::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.inner.store);
        Ok(tokio::task::spawn_blocking(move || f(&store)).await??)
    }

    /// Runs finalization for `session_id` in the background.
    pub(crate) fn spawn_finalizer(&self, session_id: String) {
        let service = self.clone();
        self.inner.tasks.spawn(async move {
            if let Err(e) = service.finalize(&session_id).await {
                error!(session = %session_id, "finalization error: {e}");
            }
        });
    }

    /// Waits for every background finalization started so far.
    pub async fn drain(&self) {
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        self.inner.tasks.reopen();
    }

    /// Deletes the backing file, then the session rows.
    pub(crate) async fn discard_session(&self, session_id: &str) -> Result<(), UploadError> {
        self.inner.storage.remove(session_id).await?;
        let id = session_id.to_string();
        self.db(move |store| store.delete_session(&id)).await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tempfile::TempDir;

    /// Service over an in-memory store and a scratch upload directory.
    pub(crate) fn service_with_chunk_size(chunk_size: u64) -> (UploadService, TempDir) {
        service_with_limits(chunk_size, DEFAULT_MAX_FILE_SIZE)
    }

    pub(crate) fn service_with_limits(
        chunk_size: u64,
        max_file_size: u64,
    ) -> (UploadService, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SessionStore::open_in_memory().unwrap());
        let service = UploadService::new(
            store,
            ServiceConfig {
                upload_dir: dir.path().join("uploads"),
                chunk_size,
                max_file_size,
            },
        )
        .unwrap();
        (service, dir)
    }
}
