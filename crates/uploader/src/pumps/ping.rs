use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;

use chunkferry_protocol::constants::WS_PING_PERIOD;

/// Sends a WebSocket ping every [`WS_PING_PERIOD`] so the server's
/// keepalive deadline never passes while chunks are being written.
pub(crate) async fn ping_pump(
    write_tx: mpsc::Sender<tungstenite::Message>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(WS_PING_PERIOD);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let ping = tungstenite::Message::Ping(Vec::new().into());
                if write_tx.send(ping).await.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn pings_on_period() {
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(ping_pump(tx, cancel.clone()));

        tokio::time::sleep(WS_PING_PERIOD * 2 + std::time::Duration::from_millis(10)).await;
        assert!(matches!(rx.recv().await, Some(tungstenite::Message::Ping(_))));
        assert!(matches!(rx.recv().await, Some(tungstenite::Message::Ping(_))));
        assert!(rx.try_recv().is_err());

        cancel.cancel();
        handle.await.unwrap();
    }
}
