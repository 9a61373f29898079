use chunkferry_protocol::constants::{CODE_BAD_REQUEST, CODE_INTERNAL, CODE_NOT_FOUND};
use chunkferry_store::StoreError;
use chunkferry_transfer::TransferError;

/// Errors from the upload service.
///
/// Client errors (`code() < 500`) are rejected before any state changes.
/// Everything else leaves the chunk non-`SUCCESS` so the client can retry.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("unknown session: {0}")]
    SessionNotFound(String),

    #[error("chunk index {index} out of range ({total} chunks)")]
    IndexOutOfRange { index: u32, total: u32 },

    #[error("chunk {index} has {got} bytes, expected {expected}")]
    LengthMismatch { index: u32, expected: u64, got: u64 },

    #[error("chunk {index} checksum mismatch")]
    ChecksumMismatch { index: u32 },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("background task failed: {0}")]
    Task(String),
}

impl UploadError {
    /// Wire error code: 400 validation, 404 unknown session, 500 server fault.
    pub fn code(&self) -> i32 {
        match self {
            UploadError::BadRequest(_)
            | UploadError::IndexOutOfRange { .. }
            | UploadError::LengthMismatch { .. }
            | UploadError::ChecksumMismatch { .. } => CODE_BAD_REQUEST,
            UploadError::SessionNotFound(_) => CODE_NOT_FOUND,
            UploadError::Store(_)
            | UploadError::Transfer(_)
            | UploadError::Io(_)
            | UploadError::Task(_) => CODE_INTERNAL,
        }
    }

    pub fn is_client_error(&self) -> bool {
        self.code() < CODE_INTERNAL
    }
}

impl From<tokio::task::JoinError> for UploadError {
    fn from(err: tokio::task::JoinError) -> Self {
        UploadError::Task(err.to_string())
    }
}
