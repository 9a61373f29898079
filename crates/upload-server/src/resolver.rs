use chrono::Utc;
use chunkferry_protocol::SessionStatus;
use chunkferry_protocol::messages::{EstablishResponse, StatusResponse};
use chunkferry_store::{NewSession, SessionRecord, StoreError, dedup_key};
use chunkferry_transfer::{ChunkPlan, validate_filename};
use tracing::{debug, info, warn};

use crate::{UploadError, UploadService};

/// How many times `establish_or_resume` re-resolves after losing a race.
const MAX_ESTABLISH_ATTEMPTS: u32 = 3;

/// Read-only view of the session for a (filename, size) pair.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Resolution {
    pub session: Option<SessionRecord>,
    /// Indices already `SUCCESS`, ascending. Empty when no session exists.
    pub completed_indices: Vec<u32>,
}

impl Resolution {
    pub fn exists(&self) -> bool {
        self.session.is_some()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.id.as_str())
    }

    pub fn to_response(&self) -> StatusResponse {
        match &self.session {
            Some(session) => StatusResponse {
                exists: true,
                session_id: Some(session.id.clone()),
                completed_indices: Some(self.completed_indices.clone()),
                status: Some(session.status),
                final_hash: session.final_hash.clone(),
            },
            None => StatusResponse::default(),
        }
    }
}

/// A session a client can send chunks to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EstablishedSession {
    pub session: SessionRecord,
    pub completed_indices: Vec<u32>,
    /// `true` when an existing session was rejoined.
    pub resumed: bool,
}

impl EstablishedSession {
    pub fn to_response(&self) -> EstablishResponse {
        EstablishResponse {
            session_id: self.session.id.clone(),
            completed_indices: self.completed_indices.clone(),
            chunk_size: self.session.chunk_size,
            total_chunks: self.session.total_chunks,
            status: self.session.status,
        }
    }
}

fn validate_request(filename: &str, size: u64, chunk_size: u64) -> Result<ChunkPlan, UploadError> {
    validate_filename(filename).map_err(|e| UploadError::BadRequest(e.to_string()))?;
    if size == 0 {
        return Err(UploadError::BadRequest("empty files cannot be uploaded".into()));
    }
    ChunkPlan::new(size, chunk_size).map_err(|e| UploadError::BadRequest(e.to_string()))
}

impl UploadService {
    /// Looks up the session for (filename, size) without changing anything.
    pub async fn resolve(&self, filename: &str, size: u64) -> Result<Resolution, UploadError> {
        validate_request(filename, size, self.config().chunk_size)?;
        let key = dedup_key(filename, size);
        self.db(move |store| {
            let Some(session) = store.find_by_dedup_key(&key)? else {
                return Ok(Resolution::default());
            };
            let completed_indices = store.completed_indices(&session.id)?;
            Ok(Resolution {
                session: Some(session),
                completed_indices,
            })
        })
        .await
    }

    /// Creates a session with all of its chunk rows plus an empty backing
    /// file.
    ///
    /// Files above `max_file_size` are rejected before anything is stored.
    /// Fails with [`StoreError::DuplicateKey`] if one already exists; callers
    /// normally go through [`establish_or_resume`](Self::establish_or_resume).
    pub async fn establish(&self, filename: &str, size: u64) -> Result<SessionRecord, UploadError> {
        validate_request(filename, size, self.config().chunk_size)?;
        let limit = self.config().max_file_size;
        if size > limit {
            return Err(UploadError::BadRequest(format!(
                "{size} bytes exceeds the {limit}-byte upload limit"
            )));
        }
        let new = NewSession {
            id: uuid::Uuid::new_v4().to_string(),
            filename: filename.to_string(),
            total_size: size,
            chunk_size: self.config().chunk_size,
        };
        let now = Utc::now();
        let session = self.db(move |store| store.create_session(&new, now)).await?;
        self.storage().create_empty(&session.id).await?;

        info!(
            session = %session.id,
            filename = %session.filename,
            size = session.total_size,
            total_chunks = session.total_chunks,
            "session established"
        );
        Ok(session)
    }

    /// Returns the unfinished session for this file, creating one if needed.
    ///
    /// A `FAILED` session is discarded and replaced. An `UPLOADING` session
    /// that already holds every chunk is handed to the finalizer again, since
    /// the first attempt may have been lost. When two callers race to create
    /// the same session, the loser re-resolves and joins the winner's.
    pub async fn establish_or_resume(
        &self,
        filename: &str,
        size: u64,
    ) -> Result<EstablishedSession, UploadError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let resolution = self.resolve(filename, size).await?;
            if let Some(session) = resolution.session {
                if session.status != SessionStatus::Failed {
                    debug!(
                        session = %session.id,
                        completed = resolution.completed_indices.len(),
                        "resuming session"
                    );
                    let received_all = resolution.completed_indices.len()
                        == session.total_chunks as usize;
                    if session.status == SessionStatus::Uploading && received_all {
                        info!(session = %session.id, "all chunks present, finalizing");
                        self.spawn_finalizer(session.id.clone());
                    }
                    return Ok(EstablishedSession {
                        session,
                        completed_indices: resolution.completed_indices,
                        resumed: true,
                    });
                }
                warn!(
                    session = %session.id,
                    reason = session.failure_reason.as_deref().unwrap_or(""),
                    "discarding failed session"
                );
                self.discard_session(&session.id).await?;
            }

            match self.establish(filename, size).await {
                Ok(session) => {
                    return Ok(EstablishedSession {
                        session,
                        completed_indices: Vec::new(),
                        resumed: false,
                    });
                }
                Err(UploadError::Store(StoreError::DuplicateKey(_)))
                    if attempt < MAX_ESTABLISH_ATTEMPTS =>
                {
                    debug!(filename, size, "lost establish race, re-resolving");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::test_support::{service_with_chunk_size, service_with_limits};

    const MIB: u64 = 1024 * 1024;

    #[tokio::test]
    async fn resolve_unknown_file() {
        let (service, _dir) = service_with_chunk_size(5 * MIB);
        let resolution = service.resolve("backup.tar", 12 * MIB).await.unwrap();
        assert!(!resolution.exists());
        assert!(resolution.completed_indices.is_empty());
        assert_eq!(resolution.to_response(), StatusResponse::default());
    }

    #[tokio::test]
    async fn establish_creates_session_chunks_and_file() {
        let (service, _dir) = service_with_chunk_size(5 * MIB);
        let est = service
            .establish_or_resume("backup.tar", 12 * MIB)
            .await
            .unwrap();

        assert!(!est.resumed);
        assert_eq!(est.session.total_chunks, 3);
        assert_eq!(est.session.status, SessionStatus::Uploading);
        assert_eq!(service.store().chunk_count(&est.session.id).unwrap(), 3);
        assert_eq!(service.storage().len(&est.session.id).await.unwrap(), Some(0));

        let resp = est.to_response();
        assert_eq!(resp.chunk_size, 5 * MIB);
        assert_eq!(resp.total_chunks, 3);
    }

    #[tokio::test]
    async fn establish_twice_returns_same_session() {
        let (service, _dir) = service_with_chunk_size(5 * MIB);
        let first = service.establish_or_resume("a.bin", 7).await.unwrap();
        let second = service.establish_or_resume("a.bin", 7).await.unwrap();

        assert_eq!(first.session.id, second.session.id);
        assert!(second.resumed);
    }

    #[tokio::test]
    async fn resolve_reports_completed_indices() {
        let (service, _dir) = service_with_chunk_size(4);
        let est = service.establish_or_resume("a.bin", 10).await.unwrap();
        let id = est.session.id.clone();
        service.store().mark_chunk_success(&id, 0, Utc::now()).unwrap();
        service.store().mark_chunk_success(&id, 2, Utc::now()).unwrap();

        let resolution = service.resolve("a.bin", 10).await.unwrap();
        assert_eq!(resolution.session_id(), Some(id.as_str()));
        assert_eq!(resolution.completed_indices, vec![0, 2]);

        let resp = resolution.to_response();
        assert!(resp.exists);
        assert_eq!(resp.completed_indices, Some(vec![0, 2]));
        assert_eq!(resp.status, Some(SessionStatus::Uploading));
        assert!(resp.final_hash.is_none());
    }

    #[tokio::test]
    async fn concurrent_establish_converges() {
        let (service, _dir) = service_with_chunk_size(4);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let svc = service.clone();
            handles.push(tokio::spawn(async move {
                svc.establish_or_resume("race.bin", 100).await.unwrap()
            }));
        }
        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap().session.id);
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
    }

    #[tokio::test]
    async fn failed_session_is_replaced() {
        let (service, _dir) = service_with_chunk_size(4);
        let est = service.establish_or_resume("a.bin", 3).await.unwrap();
        let old = est.session.id.clone();
        let store = service.store();
        store.mark_chunk_success(&old, 0, Utc::now()).unwrap();
        store.claim_for_finalization(&old, Utc::now()).unwrap();
        store.mark_failed(&old, "test", Utc::now()).unwrap();

        let fresh = service.establish_or_resume("a.bin", 3).await.unwrap();
        assert_ne!(fresh.session.id, old);
        assert!(!fresh.resumed);
        assert!(store.get_session(&old).unwrap().is_none());
        assert_eq!(service.storage().len(&old).await.unwrap(), None);
    }

    #[tokio::test]
    async fn completed_session_is_returned_as_is() {
        let (service, _dir) = service_with_chunk_size(4);
        let est = service.establish_or_resume("a.bin", 3).await.unwrap();
        let id = est.session.id.clone();
        let store = service.store();
        store.mark_chunk_success(&id, 0, Utc::now()).unwrap();
        store.claim_for_finalization(&id, Utc::now()).unwrap();
        store.mark_completed(&id, "hash", Utc::now()).unwrap();

        let again = service.establish_or_resume("a.bin", 3).await.unwrap();
        assert_eq!(again.session.id, id);
        assert_eq!(again.session.status, SessionStatus::Completed);
        assert_eq!(again.completed_indices, vec![0]);
    }

    #[tokio::test]
    async fn fully_received_session_is_finalized_on_resume() {
        let (service, _dir) = service_with_chunk_size(4);
        let est = service.establish_or_resume("a.bin", 8).await.unwrap();
        let id = est.session.id.clone();
        // Chunks stored, but the finalizer never ran.
        std::fs::write(service.storage().path_for(&id), b"abcdefgh").unwrap();
        service.store().mark_chunk_success(&id, 0, Utc::now()).unwrap();
        service.store().mark_chunk_success(&id, 1, Utc::now()).unwrap();

        let resumed = service.establish_or_resume("a.bin", 8).await.unwrap();
        assert_eq!(resumed.session.id, id);
        assert_eq!(resumed.completed_indices, vec![0, 1]);
        service.drain().await;

        let session = service.store().get_session(&id).unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(
            session.final_hash.as_deref(),
            Some(chunkferry_transfer::checksum_bytes(b"abcdefgh").as_str())
        );
        assert_eq!(service.stats().sessions_completed, 1);
    }

    #[tokio::test]
    async fn oversized_files_are_rejected_without_effect() {
        let (service, _dir) = service_with_limits(4, 1024);
        let err = service.establish_or_resume("big.bin", 1025).await.unwrap_err();
        assert_eq!(err.code(), 400);
        assert!(!service.resolve("big.bin", 1025).await.unwrap().exists());

        service.establish_or_resume("fits.bin", 1024).await.unwrap();
    }

    #[tokio::test]
    async fn chunk_count_overflow_is_a_client_error() {
        let (service, _dir) = service_with_limits(4, u64::MAX);
        let err = service
            .establish_or_resume("huge.bin", u64::MAX)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::BadRequest(_)));
        assert_eq!(err.code(), 400);

        let err = service.resolve("huge.bin", u64::MAX).await.unwrap_err();
        assert_eq!(err.code(), 400);
    }

    #[tokio::test]
    async fn validation_errors() {
        let (service, _dir) = service_with_chunk_size(4);
        for (name, size) in [("", 10), ("../x", 10), ("a/b", 10), ("ok.bin", 0)] {
            let err = service.establish_or_resume(name, size).await.unwrap_err();
            assert_eq!(err.code(), 400, "{name:?} {size}");
        }
    }
}
