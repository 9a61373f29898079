//! Transport abstraction between the scheduler and the network.
//!
//! [`WsTransport`](crate::WsTransport) implements it over a WebSocket; tests
//! drive the scheduler with in-memory mocks.

use std::future::Future;
use std::pin::Pin;

use chunkferry_protocol::messages::{ChunkAck, EstablishResponse, StatusResponse};

use crate::ClientError;

/// Boxed future returned by [`ChunkTransport`] methods.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ClientError>> + Send + 'a>>;

/// Request/response operations the upload client needs from a server.
pub trait ChunkTransport: Send + Sync {
    /// Creates or rejoins the session for (filename, size).
    fn establish(&self, filename: &str, size: u64) -> TransportFuture<'_, EstablishResponse>;

    /// Read-only lookup of the session for (filename, size).
    fn status(&self, filename: &str, size: u64) -> TransportFuture<'_, StatusResponse>;

    /// Submits one chunk. `checksum` is the SHA-256 hex of `data`.
    fn send_chunk(
        &self,
        session_id: &str,
        index: u32,
        data: Vec<u8>,
        checksum: Option<String>,
    ) -> TransportFuture<'_, ChunkAck>;
}
