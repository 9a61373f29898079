use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Chunk size the server assigns to new sessions unless configured (5 MiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// Time to wait for a pong response (or any incoming message).
///
/// Any frame resets the deadline, so a slow chunk write on the server side
/// does not trip it as long as other traffic keeps flowing.
pub const WS_PONG_WAIT: Duration = Duration::from_secs(60);

/// How often to send pings.
pub const WS_PING_PERIOD: Duration = Duration::from_secs(15);

/// Maximum message size in bytes (64 MiB).
///
/// Must stay above the largest chunk size plus the binary frame header.
pub const WS_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Timeout for request/response operations (text messages).
pub const WS_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for binary request/response operations (chunk submissions).
///
/// Chunk writes are flushed to disk before the ack is sent, so these take
/// noticeably longer than control messages.
pub const WS_BINARY_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Error code for malformed or invalid requests.
pub const CODE_BAD_REQUEST: i32 = 400;

/// Error code for an unknown session.
pub const CODE_NOT_FOUND: i32 = 404;

/// Error code for server-side failures the client should retry.
pub const CODE_INTERNAL: i32 = 500;

/// WebSocket message type identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    // Requests from client to server
    #[serde(rename = "establish_session")]
    EstablishSession,
    #[serde(rename = "session_status")]
    SessionStatus,
    #[serde(rename = "ping")]
    Ping,

    // Responses from server to client
    #[serde(rename = "session_established")]
    SessionEstablished,
    #[serde(rename = "session_status_response")]
    SessionStatusResponse,
    #[serde(rename = "chunk_ack")]
    ChunkAck,
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "error")]
    Error,
}
