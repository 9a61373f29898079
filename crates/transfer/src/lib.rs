//! Chunked file transfer primitives: chunk plans, byte-range reads,
//! positional writes, SHA-256 helpers and throughput tracking.

mod chunked;
mod plan;
mod progress;
mod validation;

pub use chunked::{ChunkReader, calculate_file_checksum, checksum_bytes, write_chunk_at};
pub use plan::ChunkPlan;
pub use progress::{ThroughputMeter, percent_complete};
pub use validation::validate_filename;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checksum mismatch")]
    ChecksumMismatch,

    #[error("invalid filename: {0}")]
    InvalidFilename(String),

    #[error("invalid chunk plan: {0}")]
    InvalidPlan(String),

    #[error("chunk index {index} out of range (total {total})")]
    ChunkOutOfRange { index: u32, total: u32 },
}
