//! Upload client for chunkferry: a WebSocket transport and a chunk scheduler
//! with bounded concurrency, retries and pause/resume/cancel.

mod error;
mod pumps;
pub mod scheduler;
pub mod transport;
pub mod types;
pub mod ws_client;

pub use error::ClientError;
pub use scheduler::Scheduler;
pub use transport::{ChunkTransport, TransportFuture};
pub use types::{ChunkState, Progress, SchedulerConfig, Snapshot, UploadEvent};
pub use ws_client::WsTransport;

/// Outbound frame buffer of a [`WsTransport`].
pub const WRITE_BUFFER_SIZE: usize = 256;
