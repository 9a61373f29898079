use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use chunkferry_protocol::Message;
use chunkferry_protocol::constants::{WS_MAX_MESSAGE_SIZE, WS_PONG_WAIT};

use super::PendingMap;

/// Reads frames from the server and completes the matching pending request.
///
/// Any incoming frame resets the [`WS_PONG_WAIT`] deadline. On exit the
/// connection is cancelled and every outstanding request fails with
/// `Closed` instead of waiting for its timeout.
pub(crate) async fn read_pump<S>(
    mut read: S,
    pending: PendingMap,
    write_tx: mpsc::Sender<tungstenite::Message>,
    cancel: CancellationToken,
) where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    let pong_deadline = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(pong_deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            () = &mut pong_deadline => {
                warn!("no traffic from server, closing connection");
                break;
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        pong_deadline.as_mut().reset(tokio::time::Instant::now() + WS_PONG_WAIT);

                        match msg {
                            tungstenite::Message::Text(text) => {
                                handle_text_message(&text, &pending).await;
                            }
                            tungstenite::Message::Ping(data) => {
                                let _ = write_tx.send(tungstenite::Message::Pong(data)).await;
                            }
                            tungstenite::Message::Close(_) => {
                                debug!("received close frame");
                                break;
                            }
                            _ => {}
                        }
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket read error: {e}");
                        break;
                    }
                    None => {
                        debug!("WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    cancel.cancel();
    pending.lock().await.clear();
}

async fn handle_text_message(text: &str, pending: &PendingMap) {
    if text.len() > WS_MAX_MESSAGE_SIZE {
        warn!("message too large ({} bytes), dropping", text.len());
        return;
    }

    let msg: Message = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!("failed to parse message: {e}");
            return;
        }
    };

    trace!(msg_type = ?msg.msg_type, id = %msg.id, "received message");

    match pending.lock().await.remove(&msg.id) {
        Some(tx) => {
            let _ = tx.send(msg);
        }
        // Usually a reply that arrived after its request timed out.
        None => debug!(msg_type = ?msg.msg_type, id = %msg.id, "no pending request for reply"),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use super::*;
    use chunkferry_protocol::MessageType;
    use futures_util::stream;
    use tokio::sync::{Mutex, oneshot};

    fn empty_pending() -> PendingMap {
        Arc::new(Mutex::new(HashMap::new()))
    }

    #[tokio::test]
    async fn routes_reply_to_pending_request() {
        let pending = empty_pending();
        let (tx, rx) = oneshot::channel();
        pending.lock().await.insert("req-1".into(), tx);

        let msg = Message::new::<()>("req-1", MessageType::Pong, None).unwrap();
        handle_text_message(&serde_json::to_string(&msg).unwrap(), &pending).await;

        let resp = rx.await.unwrap();
        assert_eq!(resp.id, "req-1");
        assert!(pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn ignores_unmatched_and_malformed_messages() {
        let pending = empty_pending();
        let (tx, _rx) = oneshot::channel();
        pending.lock().await.insert("req-1".into(), tx);

        let stray = Message::new::<()>("other", MessageType::Pong, None).unwrap();
        handle_text_message(&serde_json::to_string(&stray).unwrap(), &pending).await;
        handle_text_message("not valid json {{{", &pending).await;

        assert_eq!(pending.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn stream_end_fails_outstanding_requests() {
        let pending = empty_pending();
        let (tx, rx) = oneshot::channel();
        pending.lock().await.insert("req-1".into(), tx);

        let cancel = CancellationToken::new();
        let (write_tx, _write_rx) = mpsc::channel(16);
        let empty = stream::empty::<Result<tungstenite::Message, tungstenite::Error>>();

        read_pump(empty, pending.clone(), write_tx, cancel.clone()).await;

        assert!(cancel.is_cancelled());
        assert!(rx.await.is_err());
        assert!(pending.lock().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn silence_closes_connection() {
        let cancel = CancellationToken::new();
        let (write_tx, _write_rx) = mpsc::channel(16);
        let silent = stream::pending::<Result<tungstenite::Message, tungstenite::Error>>();

        read_pump(silent, empty_pending(), write_tx, cancel.clone()).await;
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn answers_server_pings() {
        let cancel = CancellationToken::new();
        let (write_tx, mut write_rx) = mpsc::channel(16);
        let frames = stream::iter(vec![Ok::<_, tungstenite::Error>(
            tungstenite::Message::Ping(vec![7u8].into()),
        )]);

        read_pump(frames, empty_pending(), write_tx, cancel).await;

        match write_rx.recv().await {
            Some(tungstenite::Message::Pong(data)) => assert_eq!(&data[..], &[7u8][..]),
            other => panic!("expected pong, got {other:?}"),
        }
    }
}
