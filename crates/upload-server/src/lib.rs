//! Server side of the chunkferry upload protocol.
//!
//! [`UploadService`] owns the session store and the backing files and
//! implements the protocol operations (establish/resume, status, chunk
//! receipt, finalization). [`Reaper`] removes abandoned sessions.
//! [`UploadServer`] exposes the service over WebSocket, dispatching JSON
//! and binary frames to a [`Handler`].

mod connection;
mod error;
mod finalizer;
mod handler;
mod inspect;
mod locks;
mod reaper;
mod receiver;
mod resolver;
mod server;
mod service;
mod storage;
mod upload_handler;

pub use connection::{ClientConnection, ClientMeta, SendError, Sender};
pub use error::UploadError;
pub use finalizer::FinalizeOutcome;
pub use handler::{Handler, HandlerFuture};
pub use inspect::top_level_entries;
pub use locks::{ActiveClaims, ChunkLocks, ClaimGuard};
pub use reaper::{Reaper, ReaperConfig, SweepReport};
pub use receiver::ChunkReceipt;
pub use resolver::{EstablishedSession, Resolution};
pub use server::{DEFAULT_PORT, ServerConfig, UploadServer};
pub use service::{DEFAULT_MAX_FILE_SIZE, ServiceConfig, ServiceStats, UploadService};
pub use storage::BlobStorage;
pub use upload_handler::UploadHandler;

/// Per-connection send buffer capacity.
///
/// Each chunk produces exactly one reply, so this only needs to cover the
/// client's concurrency plus some control traffic.
pub const SEND_BUFFER_SIZE: usize = 256;

/// Errors produced by the WebSocket listener.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}
