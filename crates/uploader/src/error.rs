//! Client error types.

use chunkferry_protocol::constants::CODE_INTERNAL;
use tokio_tungstenite::tungstenite;

/// Errors produced by the upload client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    Ws(#[from] tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transfer error: {0}")]
    Transfer(#[from] chunkferry_transfer::TransferError),

    #[error("request timed out")]
    Timeout,

    #[error("connection closed")]
    Closed,

    #[error("server error {code}: {message}")]
    Rejected { code: i32, message: String },

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("an upload is already running")]
    Busy,

    #[error("task join error: {0}")]
    Task(String),
}

impl ClientError {
    /// Whether another attempt at the same request may succeed.
    ///
    /// Network faults and server-side failures are retryable; a request the
    /// server rejected as invalid is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Ws(_) | Self::Timeout | Self::Closed | Self::Task(_) => true,
            Self::Rejected { code, .. } => *code >= CODE_INTERNAL,
            _ => false,
        }
    }
}

impl From<tokio::task::JoinError> for ClientError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Task(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        assert_eq!(ClientError::Timeout.to_string(), "request timed out");
        assert_eq!(ClientError::Closed.to_string(), "connection closed");

        let err = ClientError::Rejected {
            code: 404,
            message: "unknown session".into(),
        };
        assert_eq!(err.to_string(), "server error 404: unknown session");
    }

    #[test]
    fn retryable_classification() {
        assert!(ClientError::Timeout.is_retryable());
        assert!(ClientError::Closed.is_retryable());
        assert!(
            ClientError::Rejected {
                code: 500,
                message: "disk full".into()
            }
            .is_retryable()
        );
        assert!(
            !ClientError::Rejected {
                code: 400,
                message: "length mismatch".into()
            }
            .is_retryable()
        );
        assert!(!ClientError::Busy.is_retryable());
        assert!(!ClientError::Io(std::io::Error::other("gone")).is_retryable());
    }
}
