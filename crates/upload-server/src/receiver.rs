use chrono::Utc;
use chunkferry_protocol::{ChunkStatus, SessionStatus};
use chunkferry_transfer::checksum_bytes;
use tracing::{debug, info, warn};

use crate::service::Counters;
use crate::{UploadError, UploadService};

/// Outcome of a successful chunk submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkReceipt {
    pub session_id: String,
    pub index: u32,
    /// The chunk was already stored; nothing was written.
    pub already_received: bool,
    /// This chunk was the last one and finalization has been started.
    pub finalizing: bool,
}

impl UploadService {
    /// Stores one chunk, idempotently.
    ///
    /// A chunk already marked `SUCCESS` is acknowledged without looking at
    /// `data`. Otherwise the payload must have exactly the chunk's length and,
    /// if `checksum` is given, match it. The bytes are written and synced
    /// before the chunk is marked `SUCCESS`. When no chunk remains pending,
    /// finalization starts in the background.
    pub async fn receive_chunk(
        &self,
        session_id: &str,
        index: u32,
        data: Vec<u8>,
        checksum: Option<&str>,
    ) -> Result<ChunkReceipt, UploadError> {
        let id = session_id.to_string();
        let session = {
            let id = id.clone();
            self.db(move |store| store.get_session(&id)).await?
        }
        .ok_or_else(|| UploadError::SessionNotFound(id.clone()))?;

        let plan = session.plan()?;
        let expected = plan
            .chunk_len(index)
            .map_err(|_| UploadError::IndexOutOfRange {
                index,
                total: plan.total_chunks(),
            })?;

        if self.chunk_stored(&id, index).await? {
            return self.duplicate(id, index, session.status).await;
        }

        let got = data.len() as u64;
        if got != expected {
            return Err(UploadError::LengthMismatch {
                index,
                expected,
                got,
            });
        }
        if let Some(sum) = checksum.filter(|s| !s.is_empty()) {
            if !checksum_bytes(&data).eq_ignore_ascii_case(sum) {
                return Err(UploadError::ChecksumMismatch { index });
            }
        }

        let guard = self.locks().acquire(&id, index).await;
        if self.chunk_stored(&id, index).await? {
            return self.duplicate(id, index, session.status).await;
        }

        self.storage()
            .write_chunk(&id, plan.offset(index), data)
            .await?;

        let now = Utc::now();
        let marked = {
            let id = id.clone();
            self.db(move |store| store.mark_chunk_success(&id, index, now))
                .await?
        };
        drop(guard);

        if !marked {
            // The rows vanished under us, most likely reaped. The write above
            // recreated the backing file, which nothing would clean up.
            if let Err(e) = self.storage().remove(&id).await {
                warn!(session = %id, "failed to remove orphaned backing file: {e}");
            }
            return Err(UploadError::SessionNotFound(id));
        }
        Counters::bump(&self.counters().chunks_written);
        debug!(session = %id, index, bytes = got, "chunk stored");

        let finalizing = self.finalize_if_received(&id).await?;

        Ok(ChunkReceipt {
            session_id: id,
            index,
            already_received: false,
            finalizing,
        })
    }

    async fn chunk_stored(&self, session_id: &str, index: u32) -> Result<bool, UploadError> {
        let id = session_id.to_string();
        let chunk = self.db(move |store| store.chunk(&id, index)).await?;
        Ok(chunk.is_some_and(|c| c.status == ChunkStatus::Success))
    }

    /// Starts finalization when no chunk is pending. Safe to repeat: only
    /// one caller wins the claim.
    async fn finalize_if_received(&self, session_id: &str) -> Result<bool, UploadError> {
        let pending = {
            let id = session_id.to_string();
            self.db(move |store| store.pending_count(&id)).await?
        };
        if pending > 0 {
            return Ok(false);
        }
        info!(session = %session_id, "all chunks received, finalizing");
        self.spawn_finalizer(session_id.to_string());
        Ok(true)
    }

    /// Acknowledges a chunk that is already stored.
    ///
    /// A resend into a fully received `UPLOADING` session restarts
    /// finalization, which covers a finalizer that never ran.
    async fn duplicate(
        &self,
        session_id: String,
        index: u32,
        status: SessionStatus,
    ) -> Result<ChunkReceipt, UploadError> {
        Counters::bump(&self.counters().duplicate_chunks);
        debug!(session = %session_id, index, "chunk already received");
        let finalizing = if status == SessionStatus::Uploading {
            self.finalize_if_received(&session_id).await?
        } else {
            false
        };
        Ok(ChunkReceipt {
            session_id,
            index,
            already_received: true,
            finalizing,
        })
    }
}
