//! Persistent upload session state.
//!
//! One `sessions` row per (filename, size) dedup key and exactly
//! `total_chunks` rows in `chunks`, created together. All status changes are
//! conditional updates, so concurrent callers can race safely.

mod schema;
mod store;
mod types;

pub use schema::SCHEMA_VERSION;
pub use store::SessionStore;
pub use types::{ChunkRecord, NewSession, SessionRecord, dedup_key};

/// Errors from the session store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("a session already exists for dedup key {0}")]
    DuplicateKey(String),

    #[error("invalid session layout: {0}")]
    InvalidLayout(#[from] chunkferry_transfer::TransferError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
