use std::time::Duration;

/// Tuning knobs for a [`Scheduler`](crate::Scheduler).
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum number of chunks in flight at once.
    pub concurrency: usize,
    /// Attempts per chunk before it is marked as failed.
    pub max_attempts: u32,
    /// Delay after the first failed attempt; doubled after each further one.
    pub backoff_base: Duration,
    /// Capacity of the event channel.
    pub event_buffer: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            max_attempts: 3,
            backoff_base: Duration::from_millis(500),
            event_buffer: 256,
        }
    }
}

impl SchedulerConfig {
    /// Delay after failed attempt number `attempt` (1-based):
    /// `backoff_base * 2^(attempt - 1)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.backoff_base.saturating_mul(factor)
    }
}

/// Client-side state of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    Pending,
    Uploading,
    Success,
    Error,
}

/// Aggregate transfer figures, recomputed after every stored chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub uploaded_bytes: u64,
    pub total_bytes: u64,
    /// `round(uploaded / total * 100)`.
    pub percent: u8,
    /// Average over the current segment (since start or the last resume).
    pub bytes_per_second: f64,
    /// `None` while nothing has been sent in this segment.
    pub eta: Option<Duration>,
}

/// Events published by the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    Started {
        session_id: String,
        total_chunks: u32,
        /// Chunks the server already had.
        already_uploaded: u32,
    },
    ChunkStarted {
        index: u32,
    },
    Progress(Progress),
    ChunkFailed {
        index: u32,
        attempts: u32,
        error: String,
    },
    Paused,
    Resumed,
    Cancelled,
    Completed {
        session_id: String,
    },
}

/// Point-in-time copy of the scheduler state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub session_id: Option<String>,
    pub filename: Option<String>,
    pub chunks: Vec<ChunkState>,
    pub uploaded_bytes: u64,
    pub total_bytes: u64,
    pub percent: u8,
    pub bytes_per_second: f64,
    pub eta: Option<Duration>,
    pub in_flight: usize,
    pub paused: bool,
    pub cancelled: bool,
    pub completed: bool,
}

impl Snapshot {
    /// Number of chunks in `state`.
    pub fn count(&self, state: ChunkState) -> usize {
        self.chunks.iter().filter(|c| **c == state).count()
    }

    /// Indices of chunks that exhausted their attempts.
    pub fn failed_indices(&self) -> Vec<u32> {
        self.chunks
            .iter()
            .enumerate()
            .filter(|(_, c)| **c == ChunkState::Error)
            .map(|(i, _)| i as u32)
            .collect()
    }
}
