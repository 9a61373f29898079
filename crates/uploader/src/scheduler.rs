//! Client-side chunk scheduler.
//!
//! One [`Scheduler`] drives one file at a time through a bounded pool of
//! worker tasks. All bookkeeping lives in a single mutex-protected state;
//! workers only hold it between network calls, never across them.
//!
//! Every [`start`](Scheduler::start) opens a new generation. A worker that
//! returns with a result for an older generation, or after
//! [`cancel`](Scheduler::cancel), drops the result without touching state.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chunkferry_protocol::messages::EstablishResponse;
use chunkferry_transfer::{ChunkReader, ThroughputMeter, checksum_bytes, percent_complete};
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::ClientError;
use crate::transport::ChunkTransport;
use crate::types::{ChunkState, Progress, SchedulerConfig, Snapshot, UploadEvent};

/// Uploads a file in chunks with bounded concurrency, retries and
/// pause/resume/cancel control.
pub struct Scheduler {
    shared: Arc<Shared>,
    events_rx: Option<mpsc::Receiver<UploadEvent>>,
}

struct Shared {
    transport: Arc<dyn ChunkTransport>,
    config: SchedulerConfig,
    state: Mutex<State>,
    events_tx: mpsc::Sender<UploadEvent>,
    tracker: TaskTracker,
}

#[derive(Default)]
struct State {
    generation: u64,
    upload: Option<Upload>,
    queue: VecDeque<u32>,
    /// Live worker tasks of the current generation.
    workers: usize,
    in_flight: usize,
    paused: bool,
    cancelled: bool,
    completed: bool,
}

impl State {
    fn is_running(&self) -> bool {
        self.upload.is_some() && !self.cancelled && !self.completed
    }
}

struct Upload {
    session_id: String,
    filename: String,
    reader: ChunkReader,
    chunks: Vec<ChunkState>,
    uploaded_bytes: u64,
    meter: ThroughputMeter,
}

impl Upload {
    fn progress(&self, now: Instant) -> Progress {
        let total = self.reader.plan().total_size();
        Progress {
            uploaded_bytes: self.uploaded_bytes,
            total_bytes: total,
            percent: percent_complete(self.uploaded_bytes, total),
            bytes_per_second: self.meter.bytes_per_second(now),
            eta: self
                .meter
                .eta(total.saturating_sub(self.uploaded_bytes), now),
        }
    }

    fn all_done(&self) -> bool {
        self.chunks.iter().all(|c| *c == ChunkState::Success)
    }
}

struct Job {
    generation: u64,
    session_id: String,
    reader: ChunkReader,
    index: u32,
}

enum Outcome {
    Sent { bytes: u64 },
    Failed { attempts: u32, error: ClientError },
}

/// Current time on the tokio clock, so paused-clock tests see consistent
/// speeds.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

impl Scheduler {
    pub fn new(transport: Arc<dyn ChunkTransport>, config: SchedulerConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.event_buffer.max(1));
        Self {
            shared: Arc::new(Shared {
                transport,
                config,
                state: Mutex::new(State::default()),
                events_tx,
                tracker: TaskTracker::new(),
            }),
            events_rx: Some(events_rx),
        }
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<UploadEvent>> {
        self.events_rx.take()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    /// Establishes (or rejoins) the server session for `path` and starts
    /// uploading every chunk the server does not have yet.
    ///
    /// Returns once the workers are running. Fails with
    /// [`ClientError::Busy`] while another upload is neither cancelled nor
    /// complete.
    pub async fn start(&self, path: &Path) -> Result<EstablishResponse, ClientError> {
        if self.shared.lock().is_running() {
            return Err(ClientError::Busy);
        }

        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("{} has no usable file name", path.display()),
                )
            })?
            .to_string();
        let size = tokio::fs::metadata(path).await?.len();

        let session = self.shared.transport.establish(&filename, size).await?;
        let reader = {
            let path = path.to_path_buf();
            let chunk_size = session.chunk_size;
            tokio::task::spawn_blocking(move || ChunkReader::new(&path, chunk_size)).await??
        };

        let plan = reader.plan();
        if plan.total_size() != size || plan.total_chunks() != session.total_chunks {
            return Err(ClientError::UnexpectedResponse(format!(
                "server expects {} chunks, file {} has {}",
                session.total_chunks,
                filename,
                plan.total_chunks()
            )));
        }

        let mut chunks = vec![ChunkState::Pending; plan.total_chunks() as usize];
        for &index in &session.completed_indices {
            if let Some(chunk) = chunks.get_mut(index as usize) {
                *chunk = ChunkState::Success;
            }
        }
        let done: Vec<u32> = (0..plan.total_chunks())
            .filter(|&i| chunks[i as usize] == ChunkState::Success)
            .collect();
        let uploaded_bytes = plan.bytes_in(done.iter().copied());
        let queue: VecDeque<u32> = (0..plan.total_chunks())
            .filter(|&i| chunks[i as usize] == ChunkState::Pending)
            .collect();

        {
            let mut state = self.shared.lock();
            if state.is_running() {
                return Err(ClientError::Busy);
            }
            state.generation += 1;
            state.queue = queue;
            state.workers = 0;
            state.in_flight = 0;
            state.paused = false;
            state.cancelled = false;
            state.completed = false;
            state.upload = Some(Upload {
                session_id: session.session_id.clone(),
                filename: filename.clone(),
                reader,
                chunks,
                uploaded_bytes,
                meter: ThroughputMeter::new(now()),
            });

            info!(
                session = %session.session_id,
                %filename,
                size,
                total_chunks = session.total_chunks,
                already_uploaded = done.len(),
                "upload started"
            );
            self.shared.emit(UploadEvent::Started {
                session_id: session.session_id.clone(),
                total_chunks: session.total_chunks,
                already_uploaded: done.len() as u32,
            });
            self.shared.complete_if_done(&mut state);
        }

        Shared::fill_pool(&self.shared);
        Ok(session)
    }

    /// Stops dequeuing new chunks. Chunks already in flight complete.
    pub fn pause(&self) {
        let mut state = self.shared.lock();
        if !state.is_running() || state.paused {
            return;
        }
        state.paused = true;
        debug!(in_flight = state.in_flight, "upload paused");
        self.shared.emit(UploadEvent::Paused);
    }

    /// Requeues every pending or failed chunk, restarts the speed window and
    /// refills the pool.
    pub fn resume(&self) {
        {
            let mut state = self.shared.lock();
            if !state.is_running() {
                return;
            }
            let state = &mut *state;
            let Some(upload) = state.upload.as_mut() else {
                return;
            };
            state.paused = false;
            state.queue.clear();
            for (index, chunk) in upload.chunks.iter_mut().enumerate() {
                if matches!(*chunk, ChunkState::Pending | ChunkState::Error) {
                    *chunk = ChunkState::Pending;
                    state.queue.push_back(index as u32);
                }
            }
            upload.meter.reset(now());
            debug!(queued = state.queue.len(), "upload resumed");
            self.shared.emit(UploadEvent::Resumed);
        }
        Shared::fill_pool(&self.shared);
    }

    /// Abandons the upload. Results still in flight are ignored.
    pub fn cancel(&self) {
        let mut state = self.shared.lock();
        if !state.is_running() {
            return;
        }
        state.cancel();
        info!("upload cancelled");
        self.shared.emit(UploadEvent::Cancelled);
    }

    /// Requeues only the chunks that exhausted their attempts.
    ///
    /// Returns how many were requeued. Nothing is dequeued while paused.
    pub fn retry_failed(&self) -> usize {
        let requeued = {
            let mut state = self.shared.lock();
            if !state.is_running() {
                return 0;
            }
            let state = &mut *state;
            let Some(upload) = state.upload.as_mut() else {
                return 0;
            };
            let mut requeued = 0;
            for (index, chunk) in upload.chunks.iter_mut().enumerate() {
                if *chunk == ChunkState::Error {
                    *chunk = ChunkState::Pending;
                    state.queue.push_back(index as u32);
                    requeued += 1;
                }
            }
            requeued
        };
        if requeued > 0 {
            debug!(requeued, "retrying failed chunks");
            Shared::fill_pool(&self.shared);
        }
        requeued
    }

    pub fn snapshot(&self) -> Snapshot {
        let state = self.shared.lock();
        let mut snap = Snapshot {
            in_flight: state.in_flight,
            paused: state.paused,
            cancelled: state.cancelled,
            completed: state.completed,
            ..Default::default()
        };
        if let Some(upload) = &state.upload {
            let progress = upload.progress(now());
            snap.session_id = Some(upload.session_id.clone());
            snap.filename = Some(upload.filename.clone());
            snap.chunks = upload.chunks.clone();
            snap.uploaded_bytes = progress.uploaded_bytes;
            snap.total_bytes = progress.total_bytes;
            snap.percent = progress.percent;
            snap.bytes_per_second = progress.bytes_per_second;
            snap.eta = progress.eta;
        }
        snap
    }

    /// Waits until no worker task is running: the upload completed, was
    /// paused or cancelled and drained, or every remaining chunk failed.
    ///
    /// Intended for a single waiter at a time.
    pub async fn wait_idle(&self) {
        self.shared.tracker.close();
        self.shared.tracker.wait().await;
        self.shared.tracker.reopen();
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shared.lock().cancel();
    }
}

impl State {
    fn cancel(&mut self) {
        self.cancelled = true;
        self.queue.clear();
        self.in_flight = 0;
        if let Some(upload) = self.upload.as_mut() {
            for chunk in &mut upload.chunks {
                if *chunk == ChunkState::Uploading {
                    *chunk = ChunkState::Pending;
                }
            }
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: UploadEvent) {
        if let Err(e) = self.events_tx.try_send(event) {
            debug!("upload event dropped: {e}");
        }
    }

    /// Spawns workers until the pool is full or every queued chunk has one.
    fn fill_pool(self: &Arc<Self>) {
        let mut state = self.lock();
        if state.paused || state.cancelled {
            return;
        }
        let free = self.config.concurrency.saturating_sub(state.workers);
        let spawn = free.min(state.queue.len());
        let generation = state.generation;
        state.workers += spawn;
        drop(state);

        for _ in 0..spawn {
            self.tracker.spawn(Arc::clone(self).worker(generation));
        }
    }

    async fn worker(self: Arc<Self>, generation: u64) {
        while let Some(job) = self.next_job(generation) {
            match self.upload(&job).await {
                Some(outcome) => self.finish(job, outcome),
                None => debug!(index = job.index, "upload abandoned between retries"),
            }
        }
    }

    /// Dequeues the next chunk, or retires the worker.
    fn next_job(&self, generation: u64) -> Option<Job> {
        let mut state = self.lock();
        if state.generation != generation {
            return None;
        }
        let state = &mut *state;
        if !state.paused && !state.cancelled {
            if let Some(upload) = state.upload.as_mut() {
                while let Some(index) = state.queue.pop_front() {
                    let chunk = &mut upload.chunks[index as usize];
                    if *chunk != ChunkState::Pending {
                        continue;
                    }
                    *chunk = ChunkState::Uploading;
                    state.in_flight += 1;
                    self.emit(UploadEvent::ChunkStarted { index });
                    return Some(Job {
                        generation,
                        session_id: upload.session_id.clone(),
                        reader: upload.reader.clone(),
                        index,
                    });
                }
            }
        }
        state.workers = state.workers.saturating_sub(1);
        None
    }

    fn is_stale(&self, generation: u64) -> bool {
        let state = self.lock();
        state.generation != generation || state.cancelled
    }

    /// Reads the chunk and sends it, retrying with exponential backoff.
    ///
    /// Returns `None` when the upload was cancelled or restarted while
    /// waiting to retry.
    async fn upload(&self, job: &Job) -> Option<Outcome> {
        let read = {
            let reader = job.reader.clone();
            let index = job.index;
            tokio::task::spawn_blocking(move || {
                let data = reader.read_chunk(index)?;
                let sum = checksum_bytes(&data);
                Ok::<_, chunkferry_transfer::TransferError>((data, sum))
            })
            .await
        };
        let (data, checksum) = match read {
            Ok(Ok(read)) => read,
            Ok(Err(e)) => {
                return Some(Outcome::Failed {
                    attempts: 0,
                    error: e.into(),
                });
            }
            Err(e) => {
                return Some(Outcome::Failed {
                    attempts: 0,
                    error: e.into(),
                });
            }
        };
        let bytes = data.len() as u64;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self
                .transport
                .send_chunk(&job.session_id, job.index, data.clone(), Some(checksum.clone()))
                .await;
            match result {
                Ok(ack) => {
                    if ack.already_received {
                        debug!(index = job.index, "server already had chunk");
                    }
                    return Some(Outcome::Sent { bytes });
                }
                Err(error) => {
                    if attempt >= self.config.max_attempts || !error.is_retryable() {
                        return Some(Outcome::Failed {
                            attempts: attempt,
                            error,
                        });
                    }
                    let delay = self.config.backoff(attempt);
                    warn!(
                        index = job.index,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "chunk upload failed, retrying: {error}"
                    );
                    tokio::time::sleep(delay).await;
                    if self.is_stale(job.generation) {
                        return None;
                    }
                }
            }
        }
    }

    fn finish(&self, job: Job, outcome: Outcome) {
        let mut state = self.lock();
        if state.generation != job.generation || state.cancelled {
            debug!(index = job.index, "discarding result of abandoned upload");
            return;
        }
        state.in_flight = state.in_flight.saturating_sub(1);
        let Some(upload) = state.upload.as_mut() else {
            return;
        };
        let index = job.index as usize;

        match outcome {
            Outcome::Sent { bytes } => {
                upload.chunks[index] = ChunkState::Success;
                upload.uploaded_bytes += bytes;
                upload.meter.record(bytes);
                let progress = upload.progress(now());
                debug!(
                    index = job.index,
                    uploaded = progress.uploaded_bytes,
                    percent = progress.percent,
                    "chunk uploaded"
                );
                self.emit(UploadEvent::Progress(progress));
                self.complete_if_done(&mut state);
            }
            Outcome::Failed { attempts, error } => {
                upload.chunks[index] = ChunkState::Error;
                warn!(index = job.index, attempts, "chunk failed: {error}");
                self.emit(UploadEvent::ChunkFailed {
                    index: job.index,
                    attempts,
                    error: error.to_string(),
                });
            }
        }
    }

    /// Fires `Completed` the first time every chunk is stored.
    fn complete_if_done(&self, state: &mut State) {
        if state.completed {
            return;
        }
        let Some(upload) = state.upload.as_ref() else {
            return;
        };
        if !upload.all_done() {
            return;
        }
        state.completed = true;
        state.queue.clear();
        info!(session = %upload.session_id, "upload complete");
        self.emit(UploadEvent::Completed {
            session_id: upload.session_id.clone(),
        });
    }
}
