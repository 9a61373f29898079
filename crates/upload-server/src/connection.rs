//! Client connection management: read/write pumps, keepalive, send buffering.

use std::sync::Arc;

use chunkferry_protocol::constants::{
    CODE_BAD_REQUEST, MessageType, WS_MAX_MESSAGE_SIZE, WS_PING_PERIOD, WS_PONG_WAIT,
};
use chunkferry_protocol::{Message, parse_chunk_frame};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use crate::SEND_BUFFER_SIZE;
use crate::handler::Handler;

/// Metadata about a connected client.
#[derive(Debug, Clone)]
pub struct ClientMeta {
    pub remote_addr: String,
}

/// Handle for sending messages to one client.
///
/// Cloneable and cheap; wraps an `mpsc::Sender`.
#[derive(Clone)]
pub struct Sender {
    tx: mpsc::Sender<WsMessage>,
}

impl Sender {
    /// Sends a protocol [`Message`] as JSON text.
    ///
    /// Fails if the buffer is full or the client is gone. A dropped reply
    /// surfaces on the client as a request timeout, which it retries.
    pub fn send_msg(&self, msg: Message) -> Result<(), SendError> {
        let json = serde_json::to_string(&msg).map_err(|_| SendError)?;
        self.tx.try_send(WsMessage::Text(json.into())).map_err(|_| {
            tracing::warn!("send buffer full or closed, dropping message");
            SendError
        })
    }

    /// Sends an error response for the given request message.
    pub fn send_error(&self, req: &Message, code: i32, message: &str) -> Result<(), SendError> {
        self.send_msg(req.reply_error(code, message))
    }

    /// Returns `true` if the send channel is still open.
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }

    #[cfg(test)]
    pub(crate) fn channel_for_tests(capacity: usize) -> (Self, mpsc::Receiver<WsMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

/// Error returned when the send channel is full or closed.
#[derive(Debug, thiserror::Error)]
#[error("send failed: buffer full or connection closed")]
pub struct SendError;

/// Active connection to one client.
pub struct ClientConnection {
    pub meta: ClientMeta,
    sender: Sender,
    cancel: CancellationToken,
    reader: JoinHandle<()>,
}

impl ClientConnection {
    pub fn sender(&self) -> Sender {
        self.sender.clone()
    }

    /// Signals both pumps to stop.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Waits until the read pump has exited and the disconnect hook ran.
    pub async fn closed(self) {
        let _ = self.reader.await;
    }
}

/// Spawns the read and write pumps for a WebSocket connection.
///
/// The pumps stop when the peer goes away, the keepalive deadline passes,
/// or `server_cancel` fires.
pub fn spawn_connection<S, H>(
    ws_stream: S,
    meta: ClientMeta,
    handler: Arc<H>,
    server_cancel: CancellationToken,
) -> ClientConnection
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error>
        + Send
        + 'static,
    H: Handler,
{
    let (tx, rx) = mpsc::channel::<WsMessage>(SEND_BUFFER_SIZE);
    let cancel = server_cancel.child_token();
    let sender = Sender { tx };

    let (ws_sink, ws_stream) = ws_stream.split();

    tokio::spawn(write_pump(ws_sink, rx, cancel.clone()));

    let read_cancel = cancel.clone();
    let read_sender = sender.clone();
    let read_meta = meta.clone();
    let reader = tokio::spawn(async move {
        read_pump(ws_stream, read_sender, Arc::clone(&handler), read_cancel.clone()).await;
        read_cancel.cancel();
        handler.on_disconnected(&read_meta).await;
        tracing::info!(peer = %read_meta.remote_addr, "client disconnected");
    });

    ClientConnection {
        meta,
        sender,
        cancel,
        reader,
    }
}

/// Write pump: drains the send channel and sends WS pings.
async fn write_pump<S>(mut sink: S, mut rx: mpsc::Receiver<WsMessage>, cancel: CancellationToken)
where
    S: futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Send + Unpin,
{
    let mut ping_interval = tokio::time::interval(WS_PING_PERIOD);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            msg = rx.recv() => {
                match msg {
                    Some(ws_msg) => {
                        if let Err(e) = sink.send(ws_msg).await {
                            tracing::error!("write pump send error: {e}");
                            break;
                        }
                    }
                    None => break,
                }
            }

            _ = ping_interval.tick() => {
                if let Err(e) = sink.send(WsMessage::Ping(Vec::new().into())).await {
                    tracing::error!("write pump ping error: {e}");
                    break;
                }
            }
        }
    }

    let _ = sink.close().await;
}

/// Read pump: reads WS frames and dispatches them to the handler.
///
/// Any incoming frame counts as liveness; two silent `WS_PONG_WAIT`
/// periods in a row close the connection.
async fn read_pump<S, H>(mut stream: S, sender: Sender, handler: Arc<H>, cancel: CancellationToken)
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + Send
        + Unpin,
    H: Handler,
{
    let mut deadline = tokio::time::interval(WS_PONG_WAIT);
    deadline.reset();
    let mut heard = true;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            _ = deadline.tick() => {
                if !heard {
                    tracing::warn!("keepalive timeout, closing connection");
                    break;
                }
                heard = false;
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(ws_msg)) => {
                        heard = true;
                        match ws_msg {
                            WsMessage::Text(text) => {
                                dispatch_text(&handler, &sender, &text).await;
                            }
                            WsMessage::Binary(data) => {
                                if data.len() > WS_MAX_MESSAGE_SIZE {
                                    tracing::error!(
                                        "binary message exceeds max size ({} > {})",
                                        data.len(),
                                        WS_MAX_MESSAGE_SIZE
                                    );
                                    continue;
                                }
                                dispatch_binary(&handler, &sender, &data);
                            }
                            WsMessage::Ping(data) => {
                                let _ = sender.tx.try_send(WsMessage::Pong(data));
                            }
                            WsMessage::Pong(_) | WsMessage::Frame(_) => {}
                            WsMessage::Close(_) => {
                                tracing::debug!("received close frame");
                                break;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        tracing::error!("read pump error: {e}");
                        break;
                    }
                    None => break,
                }
            }
        }
    }
}

/// Dispatches a text (JSON) message to the matching handler method.
async fn dispatch_text<H: Handler>(handler: &Arc<H>, sender: &Sender, text: &str) {
    let msg: Message = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::error!("invalid message JSON: {e}");
            return;
        }
    };

    let s = sender.clone();
    match msg.msg_type {
        MessageType::EstablishSession => handler.on_establish_session(s, msg).await,
        MessageType::SessionStatus => handler.on_session_status(s, msg).await,
        MessageType::Ping => handler.on_ping(s, msg).await,
        _ => {
            tracing::warn!(msg_type = ?msg.msg_type, "unexpected message type");
            let _ = sender.send_error(&msg, CODE_BAD_REQUEST, "unexpected message type");
        }
    }
}

/// Parses a binary chunk frame and hands it to the handler on its own task,
/// so several chunks from one client are stored concurrently.
fn dispatch_binary<H: Handler>(handler: &Arc<H>, sender: &Sender, data: &[u8]) {
    match parse_chunk_frame(data) {
        Ok((header, payload)) => {
            let handler = Arc::clone(handler);
            let sender = sender.clone();
            tokio::spawn(async move {
                handler.on_binary_chunk(sender, header, payload).await;
            });
        }
        Err(e) => {
            // No request id to answer; the client times out and retries.
            tracing::error!("failed to parse chunk frame: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_error_display() {
        assert!(SendError.to_string().contains("buffer full"));
    }

    #[tokio::test]
    async fn sender_reports_closed_channel() {
        let (sender, rx) = Sender::channel_for_tests(1);
        assert!(sender.is_connected());

        let msg = Message::new::<()>("m1", MessageType::Pong, None).unwrap();
        sender.send_msg(msg.clone()).unwrap();
        // Buffer of one is now full.
        assert!(sender.send_msg(msg.clone()).is_err());

        drop(rx);
        assert!(!sender.is_connected());
        assert!(sender.send_msg(msg).is_err());
    }
}
