use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use chunkferry_protocol::SessionStatus;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::UploadService;

/// Reaper timing.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Age after which an `UPLOADING` session is abandoned.
    pub stale_ttl: Duration,
    /// Age after which a `PROCESSING` session with no live claim is abandoned.
    pub processing_ttl: Duration,
    /// Time between sweeps.
    pub interval: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            stale_ttl: Duration::from_secs(24 * 60 * 60),
            processing_ttl: Duration::from_secs(72 * 60 * 60),
            interval: Duration::from_secs(60 * 60),
        }
    }
}

/// Session ids handled by one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: Vec<String>,
    /// Sessions whose cleanup failed; they are retried on the next sweep.
    pub failed: Vec<String>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.failed.is_empty()
    }
}

/// Deletes sessions that were abandoned mid-upload or got stuck in
/// `PROCESSING`, together with their backing files.
pub struct Reaper {
    service: UploadService,
    config: ReaperConfig,
}

impl Reaper {
    pub fn new(service: UploadService, config: ReaperConfig) -> Self {
        Self { service, config }
    }

    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now()).await
    }

    /// Sweeps as if the current time were `now`.
    ///
    /// Errors are logged and never propagated.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let uploading_before = cutoff(now, self.config.stale_ttl);
        let processing_before = cutoff(now, self.config.processing_ttl);

        let candidates = match self
            .service
            .db(move |store| store.stale_sessions(uploading_before, processing_before))
            .await
        {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!("stale session query failed: {e}");
                return SweepReport::default();
            }
        };

        let mut report = SweepReport::default();
        for session in candidates {
            if session.status == SessionStatus::Processing
                && self.service.claims().contains(&session.id)
            {
                debug!(session = %session.id, "skipping session with active claim");
                continue;
            }
            match self.service.discard_session(&session.id).await {
                Ok(()) => {
                    debug!(
                        session = %session.id,
                        status = %session.status,
                        filename = %session.filename,
                        "stale session removed"
                    );
                    report.removed.push(session.id);
                }
                Err(e) => {
                    warn!(session = %session.id, "stale session cleanup failed: {e}");
                    report.failed.push(session.id);
                }
            }
        }

        if !report.is_empty() {
            info!(
                removed = report.removed.len(),
                failed = report.failed.len(),
                "stale session sweep finished"
            );
        }
        report
    }

    /// Sweeps immediately, then every `interval`, until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let period = self.config.interval.max(Duration::from_secs(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("reaper stopped");
                    break;
                }
                _ = ticker.tick() => {
                    self.sweep().await;
                }
            }
        }
    }
}

fn cutoff(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_sub_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::test_support::service_with_chunk_size;
    use chunkferry_store::NewSession;

    fn hours(n: i64) -> TimeDelta {
        TimeDelta::hours(n)
    }

    /// Inserts a session directly with the given timestamp.
    async fn session_at(service: &UploadService, name: &str, size: u64, at: DateTime<Utc>) -> String {
        let new = NewSession {
            id: uuid::Uuid::new_v4().to_string(),
            filename: name.into(),
            total_size: size,
            chunk_size: service.config().chunk_size,
        };
        let id = service.store().create_session(&new, at).unwrap().id;
        service.storage().create_empty(&id).await.unwrap();
        id
    }

    fn claim_at(service: &UploadService, id: &str, at: DateTime<Utc>) {
        let store = service.store();
        let total = store.get_session(id).unwrap().unwrap().total_chunks;
        for index in 0..total {
            store.mark_chunk_success(id, index, at).unwrap();
        }
        assert!(store.claim_for_finalization(id, at).unwrap());
    }

    #[tokio::test]
    async fn removes_only_expired_uploads() {
        let (service, _dir) = service_with_chunk_size(4);
        let now = Utc::now();
        let old = session_at(&service, "old.bin", 10, now - hours(25)).await;
        let fresh = session_at(&service, "fresh.bin", 10, now - hours(1)).await;

        let reaper = Reaper::new(service.clone(), ReaperConfig::default());
        let report = reaper.sweep_at(now).await;

        assert_eq!(report.removed, vec![old.clone()]);
        assert!(report.failed.is_empty());
        assert!(service.store().get_session(&old).unwrap().is_none());
        assert_eq!(service.store().chunk_count(&old).unwrap(), 0);
        assert_eq!(service.storage().len(&old).await.unwrap(), None);
        assert!(service.store().get_session(&fresh).unwrap().is_some());
        assert_eq!(service.storage().len(&fresh).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn missing_backing_file_is_fine() {
        let (service, _dir) = service_with_chunk_size(4);
        let now = Utc::now();
        let old = session_at(&service, "old.bin", 10, now - hours(30)).await;
        service.storage().remove(&old).await.unwrap();

        let reaper = Reaper::new(service.clone(), ReaperConfig::default());
        assert_eq!(reaper.sweep_at(now).await.removed, vec![old]);
    }

    #[tokio::test]
    async fn processing_uses_longer_ttl() {
        let (service, _dir) = service_with_chunk_size(4);
        let now = Utc::now();
        let stuck = session_at(&service, "stuck.bin", 3, now - hours(30)).await;
        claim_at(&service, &stuck, now - hours(30));

        let reaper = Reaper::new(service.clone(), ReaperConfig::default());
        assert!(reaper.sweep_at(now).await.is_empty());

        let report = reaper.sweep_at(now + hours(48)).await;
        assert_eq!(report.removed, vec![stuck]);
    }

    #[tokio::test]
    async fn active_claim_is_never_reaped() {
        let (service, _dir) = service_with_chunk_size(4);
        let now = Utc::now();
        let held = session_at(&service, "held.bin", 3, now - hours(100)).await;
        claim_at(&service, &held, now - hours(100));

        let reaper = Reaper::new(service.clone(), ReaperConfig::default());
        let guard = service.claims().hold(&held);
        assert!(reaper.sweep_at(now).await.is_empty());
        assert!(service.store().get_session(&held).unwrap().is_some());

        drop(guard);
        assert_eq!(reaper.sweep_at(now).await.removed, vec![held]);
    }

    #[tokio::test]
    async fn terminal_sessions_are_kept() {
        let (service, _dir) = service_with_chunk_size(4);
        let now = Utc::now();
        let done = session_at(&service, "done.bin", 3, now - hours(500)).await;
        claim_at(&service, &done, now - hours(500));
        service
            .store()
            .mark_completed(&done, "h", now - hours(500))
            .unwrap();

        let reaper = Reaper::new(service.clone(), ReaperConfig::default());
        assert!(reaper.sweep_at(now).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn run_sweeps_at_start_and_stops_on_cancel() {
        let (service, _dir) = service_with_chunk_size(4);
        let old = session_at(&service, "old.bin", 10, Utc::now() - hours(25)).await;

        let cancel = CancellationToken::new();
        let reaper = Reaper::new(service.clone(), ReaperConfig::default());
        let handle = tokio::spawn(reaper.run(cancel.clone()));

        // The first sweep runs without waiting a full interval.
        for _ in 0..50 {
            if service.store().get_session(&old).unwrap().is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(service.store().get_session(&old).unwrap().is_none());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn huge_ttl_does_not_overflow() {
        let now = Utc::now();
        assert_eq!(cutoff(now, Duration::MAX), DateTime::<Utc>::MIN_UTC);
        assert_eq!(cutoff(now, Duration::from_secs(3600)), now - hours(1));
    }
}
