//! WebSocket transport to a chunkferry server.
//!
//! Requests are correlated with replies by UUID. Chunks go out as binary
//! frames and are answered with a text `chunk_ack`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, Stream, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use chunkferry_protocol::constants::{
    WS_BINARY_REQUEST_TIMEOUT, WS_MAX_MESSAGE_SIZE, WS_REQUEST_TIMEOUT,
};
use chunkferry_protocol::messages::{
    ChunkAck, EstablishRequest, EstablishResponse, StatusRequest, StatusResponse,
};
use chunkferry_protocol::{ChunkHeader, Message, MessageType, encode_chunk_frame};

use crate::pumps::{PendingMap, ping, read, write};
use crate::transport::{ChunkTransport, TransportFuture};
use crate::{ClientError, WRITE_BUFFER_SIZE};

/// WebSocket connection to one server.
///
/// Safe to share between several schedulers; every request carries its own
/// id, so replies may arrive in any order.
pub struct WsTransport {
    write_tx: mpsc::Sender<tungstenite::Message>,
    pending: PendingMap,
    cancel: CancellationToken,
    _read_handle: JoinHandle<()>,
    _write_handle: JoinHandle<()>,
    _ping_handle: JoinHandle<()>,
}

impl WsTransport {
    /// Connects to a server at `url` (`ws://host:port`).
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        let mut ws_config = tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
        let (ws_stream, _) =
            tokio_tungstenite::connect_async_with_config(url, Some(ws_config), false).await?;
        debug!(%url, "connected");
        Ok(Self::from_stream(ws_stream))
    }

    /// Wraps an already established WebSocket stream.
    pub fn from_stream<S>(ws_stream: S) -> Self
    where
        S: Stream<Item = Result<tungstenite::Message, tungstenite::Error>>
            + Sink<tungstenite::Message, Error = tungstenite::Error>
            + Send
            + 'static,
    {
        let (sink, stream) = ws_stream.split();
        let (write_tx, write_rx) = mpsc::channel(WRITE_BUFFER_SIZE);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let cancel = CancellationToken::new();

        let write_handle = tokio::spawn(write::write_pump(sink, write_rx, cancel.clone()));
        let read_handle = tokio::spawn(read::read_pump(
            stream,
            pending.clone(),
            write_tx.clone(),
            cancel.clone(),
        ));
        let ping_handle = tokio::spawn(ping::ping_pump(write_tx.clone(), cancel.clone()));

        Self {
            write_tx,
            pending,
            cancel,
            _read_handle: read_handle,
            _write_handle: write_handle,
            _ping_handle: ping_handle,
        }
    }

    /// Returns `false` once the connection has gone away.
    pub fn is_connected(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Sends a JSON request and waits for its reply.
    pub async fn send_request<T: Serialize + Sync>(
        &self,
        msg_type: MessageType,
        payload: &T,
    ) -> Result<Message, ClientError> {
        let id = uuid::Uuid::new_v4().to_string();
        let msg = Message::new(&id, msg_type, Some(payload))?;
        let json = serde_json::to_string(&msg)?;
        self.round_trip(
            id,
            tungstenite::Message::Text(json.into()),
            WS_REQUEST_TIMEOUT,
        )
        .await
    }

    /// Sends one chunk as a binary frame and waits for the ack.
    pub async fn send_chunk_frame(
        &self,
        session_id: &str,
        index: u32,
        data: &[u8],
        checksum: Option<String>,
    ) -> Result<Message, ClientError> {
        let header = ChunkHeader {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            index,
            checksum: checksum.unwrap_or_default(),
        };
        let frame = encode_chunk_frame(&header, data)?;
        self.round_trip(
            header.id,
            tungstenite::Message::Binary(frame.into()),
            WS_BINARY_REQUEST_TIMEOUT,
        )
        .await
    }

    async fn round_trip(
        &self,
        id: String,
        frame: tungstenite::Message,
        timeout: Duration,
    ) -> Result<Message, ClientError> {
        if !self.is_connected() {
            return Err(ClientError::Closed);
        }

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        if self.write_tx.send(frame).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(ClientError::Closed);
        }

        let result = tokio::time::timeout(timeout, rx).await;
        self.pending.lock().await.remove(&id);

        match result {
            Ok(Ok(resp)) => {
                if let Some(err) = &resp.error {
                    return Err(ClientError::Rejected {
                        code: err.code,
                        message: err.message.clone(),
                    });
                }
                Ok(resp)
            }
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => Err(ClientError::Timeout),
        }
    }

    /// Closes the connection. Outstanding requests fail with `Closed`.
    pub async fn close(&self) {
        let _ = self.write_tx.send(tungstenite::Message::Close(None)).await;
        self.cancel.cancel();
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
        self._read_handle.abort();
        self._write_handle.abort();
        self._ping_handle.abort();
    }
}

/// Checks the reply type and decodes its payload.
fn expect_payload<T: DeserializeOwned>(
    resp: Message,
    expected: MessageType,
) -> Result<T, ClientError> {
    if resp.msg_type != expected {
        return Err(ClientError::UnexpectedResponse(format!(
            "expected {expected:?}, got {:?}",
            resp.msg_type
        )));
    }
    resp.parse_payload()?
        .ok_or_else(|| ClientError::UnexpectedResponse(format!("{expected:?} without payload")))
}

impl ChunkTransport for WsTransport {
    fn establish(&self, filename: &str, size: u64) -> TransportFuture<'_, EstablishResponse> {
        let req = EstablishRequest {
            filename: filename.to_string(),
            size,
        };
        Box::pin(async move {
            let resp = self.send_request(MessageType::EstablishSession, &req).await?;
            expect_payload(resp, MessageType::SessionEstablished)
        })
    }

    fn status(&self, filename: &str, size: u64) -> TransportFuture<'_, StatusResponse> {
        let req = StatusRequest {
            filename: filename.to_string(),
            size,
        };
        Box::pin(async move {
            let resp = self.send_request(MessageType::SessionStatus, &req).await?;
            expect_payload(resp, MessageType::SessionStatusResponse)
        })
    }

    fn send_chunk(
        &self,
        session_id: &str,
        index: u32,
        data: Vec<u8>,
        checksum: Option<String>,
    ) -> TransportFuture<'_, ChunkAck> {
        let session_id = session_id.to_string();
        Box::pin(async move {
            let resp = self
                .send_chunk_frame(&session_id, index, &data, checksum)
                .await?;
            expect_payload(resp, MessageType::ChunkAck)
        })
    }
}
