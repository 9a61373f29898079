use std::path::PathBuf;

use chrono::Utc;
use chunkferry_transfer::calculate_file_checksum;
use tracing::{debug, info, warn};

use crate::inspect::top_level_entries;
use crate::service::Counters;
use crate::{UploadError, UploadService};

/// Result of a finalization attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// Another caller holds the claim, or chunks are still pending.
    NotClaimed,
    /// The file was hashed and the session is `COMPLETED`.
    Completed { final_hash: String },
    /// The backing file was unusable; the session is `FAILED`.
    Failed { reason: String },
    /// The session stopped being `PROCESSING` while the file was hashed.
    Superseded,
}

impl UploadService {
    /// Moves a fully received session through `PROCESSING` to a terminal
    /// state.
    ///
    /// Only the caller that wins the `UPLOADING -> PROCESSING` claim does any
    /// work. Integrity problems end in `FAILED` and are not retried.
    pub async fn finalize(&self, session_id: &str) -> Result<FinalizeOutcome, UploadError> {
        let id = session_id.to_string();
        let claimed = {
            let id = id.clone();
            let now = Utc::now();
            self.db(move |store| store.claim_for_finalization(&id, now))
                .await?
        };
        if !claimed {
            debug!(session = %id, "finalization not claimed");
            return Ok(FinalizeOutcome::NotClaimed);
        }
        let _claim = self.claims().hold(&id);

        let session = {
            let id = id.clone();
            self.db(move |store| store.get_session(&id)).await?
        }
        .ok_or_else(|| UploadError::SessionNotFound(id.clone()))?;

        let path = self.storage().path_for(&id);
        let expected = session.total_size;
        let hashed = {
            let path = path.clone();
            tokio::task::spawn_blocking(move || hash_backing_file(&path, expected)).await?
        };

        self.record_outcome(&id, &session.filename, path, hashed).await
    }

    /// Stores the hashing result on a `PROCESSING` session.
    ///
    /// If the session left `PROCESSING` in the meantime nothing is recorded
    /// and [`FinalizeOutcome::Superseded`] is returned.
    async fn record_outcome(
        &self,
        id: &str,
        filename: &str,
        path: PathBuf,
        hashed: Result<String, String>,
    ) -> Result<FinalizeOutcome, UploadError> {
        let now = Utc::now();
        match hashed {
            Ok(final_hash) => {
                let recorded = {
                    let id = id.to_string();
                    let hash = final_hash.clone();
                    self.db(move |store| store.mark_completed(&id, &hash, now))
                        .await?
                };
                if !recorded {
                    warn!(session = %id, "session left PROCESSING before completion was recorded");
                    return Ok(FinalizeOutcome::Superseded);
                }
                Counters::bump(&self.counters().sessions_completed);
                info!(
                    session = %id,
                    filename = %filename,
                    hash = %final_hash,
                    "upload completed"
                );
                log_archive_contents(id, path).await;
                Ok(FinalizeOutcome::Completed { final_hash })
            }
            Err(reason) => {
                let recorded = {
                    let id = id.to_string();
                    let reason = reason.clone();
                    self.db(move |store| store.mark_failed(&id, &reason, now))
                        .await?
                };
                if !recorded {
                    warn!(session = %id, %reason, "session left PROCESSING before failure was recorded");
                    return Ok(FinalizeOutcome::Superseded);
                }
                Counters::bump(&self.counters().sessions_failed);
                warn!(session = %id, %reason, "upload failed integrity check");
                Ok(FinalizeOutcome::Failed { reason })
            }
        }
    }
}

/// Hashes the backing file after checking it has exactly `expected` bytes.
fn hash_backing_file(path: &std::path::Path, expected: u64) -> Result<String, String> {
    let len = std::fs::metadata(path)
        .map_err(|e| format!("backing file unavailable: {e}"))?
        .len();
    if len != expected {
        return Err(format!("backing file has {len} bytes, expected {expected}"));
    }
    calculate_file_checksum(path).map_err(|e| format!("hashing failed: {e}"))
}

/// Logs the top-level members if the upload is a ZIP archive. Never fails.
async fn log_archive_contents(session_id: &str, path: PathBuf) {
    match tokio::task::spawn_blocking(move || top_level_entries(&path)).await {
        Ok(Ok(entries)) => {
            info!(session = %session_id, ?entries, "archive contents");
        }
        Ok(Err(e)) => {
            debug!(session = %session_id, "content inspection skipped: {e}");
        }
        Err(e) => {
            debug!(session = %session_id, "content inspection task failed: {e}");
        }
    }
}
