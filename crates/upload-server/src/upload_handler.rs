use chunkferry_protocol::constants::CODE_BAD_REQUEST;
use chunkferry_protocol::messages::{ChunkAck, EstablishRequest, StatusRequest};
use chunkferry_protocol::{ChunkHeader, Message, MessageType};

use crate::connection::{ClientMeta, Sender};
use crate::handler::{Handler, HandlerFuture};
use crate::{UploadError, UploadService};

/// [`Handler`] that serves the upload protocol from an [`UploadService`].
pub struct UploadHandler {
    service: UploadService,
}

impl UploadHandler {
    pub fn new(service: UploadService) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &UploadService {
        &self.service
    }
}

fn send_upload_error(sender: &Sender, request_id: &str, err: &UploadError) {
    if err.is_client_error() {
        tracing::debug!(request = request_id, "request rejected: {err}");
    } else {
        tracing::error!(request = request_id, "request failed: {err}");
    }
    let _ = sender.send_msg(Message::error(request_id, err.code(), err.to_string()));
}

impl Handler for UploadHandler {
    fn on_establish_session(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let req: EstablishRequest = match msg.parse_payload() {
                Ok(Some(r)) => r,
                _ => {
                    let _ = sender.send_error(&msg, CODE_BAD_REQUEST, "invalid payload");
                    return;
                }
            };

            match self.service.establish_or_resume(&req.filename, req.size).await {
                Ok(established) => {
                    let resp = established.to_response();
                    if let Ok(reply) = msg.reply(MessageType::SessionEstablished, Some(&resp)) {
                        let _ = sender.send_msg(reply);
                    }
                }
                Err(e) => send_upload_error(&sender, &msg.id, &e),
            }
        })
    }

    fn on_session_status(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let req: StatusRequest = match msg.parse_payload() {
                Ok(Some(r)) => r,
                _ => {
                    let _ = sender.send_error(&msg, CODE_BAD_REQUEST, "invalid payload");
                    return;
                }
            };

            match self.service.resolve(&req.filename, req.size).await {
                Ok(resolution) => {
                    let resp = resolution.to_response();
                    if let Ok(reply) = msg.reply(MessageType::SessionStatusResponse, Some(&resp)) {
                        let _ = sender.send_msg(reply);
                    }
                }
                Err(e) => send_upload_error(&sender, &msg.id, &e),
            }
        })
    }

    fn on_binary_chunk(
        &self,
        sender: Sender,
        header: ChunkHeader,
        data: Vec<u8>,
    ) -> HandlerFuture<'_> {
        Box::pin(async move {
            let checksum = Some(header.checksum.as_str()).filter(|c| !c.is_empty());
            let result = self
                .service
                .receive_chunk(&header.session_id, header.index, data, checksum)
                .await;

            match result {
                Ok(receipt) => {
                    let ack = ChunkAck {
                        session_id: receipt.session_id,
                        index: receipt.index,
                        already_received: receipt.already_received,
                    };
                    if let Ok(reply) = Message::new(&header.id, MessageType::ChunkAck, Some(&ack)) {
                        let _ = sender.send_msg(reply);
                    }
                }
                Err(e) => send_upload_error(&sender, &header.id, &e),
            }
        })
    }

    fn on_disconnected(&self, meta: &ClientMeta) -> HandlerFuture<'_> {
        tracing::debug!(peer = %meta.remote_addr, "upload client gone");
        Box::pin(async {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::test_support::service_with_chunk_size;
    use chunkferry_protocol::messages::{EstablishResponse, StatusResponse};
    use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

    fn parse_reply(ws: WsMessage) -> Message {
        match ws {
            WsMessage::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn establish_then_chunk_then_status() {
        let (service, _dir) = service_with_chunk_size(4);
        let handler = UploadHandler::new(service);
        let (sender, mut rx) = Sender::channel_for_tests(16);

        let req = EstablishRequest {
            filename: "a.bin".into(),
            size: 6,
        };
        let msg = Message::new("r1", MessageType::EstablishSession, Some(&req)).unwrap();
        handler.on_establish_session(sender.clone(), msg).await;
        let reply = parse_reply(rx.recv().await.unwrap());
        assert_eq!(reply.id, "r1");
        assert_eq!(reply.msg_type, MessageType::SessionEstablished);
        let est: EstablishResponse = reply.parse_payload().unwrap().unwrap();
        assert_eq!(est.total_chunks, 2);

        let header = ChunkHeader {
            id: "c1".into(),
            session_id: est.session_id.clone(),
            index: 1,
            checksum: String::new(),
        };
        handler
            .on_binary_chunk(sender.clone(), header, b"ef".to_vec())
            .await;
        let reply = parse_reply(rx.recv().await.unwrap());
        assert_eq!(reply.id, "c1");
        let ack: ChunkAck = reply.parse_payload().unwrap().unwrap();
        assert_eq!(ack.index, 1);
        assert!(!ack.already_received);

        let status = StatusRequest {
            filename: "a.bin".into(),
            size: 6,
        };
        let msg = Message::new("r2", MessageType::SessionStatus, Some(&status)).unwrap();
        handler.on_session_status(sender, msg).await;
        let reply = parse_reply(rx.recv().await.unwrap());
        let resp: StatusResponse = reply.parse_payload().unwrap().unwrap();
        assert!(resp.exists);
        assert_eq!(resp.completed_indices, Some(vec![1]));
    }

    #[tokio::test]
    async fn errors_carry_request_id_and_code() {
        let (service, _dir) = service_with_chunk_size(4);
        let handler = UploadHandler::new(service);
        let (sender, mut rx) = Sender::channel_for_tests(16);

        let header = ChunkHeader {
            id: "c9".into(),
            session_id: "nope".into(),
            index: 0,
            checksum: String::new(),
        };
        handler.on_binary_chunk(sender.clone(), header, b"x".to_vec()).await;
        let reply = parse_reply(rx.recv().await.unwrap());
        assert_eq!(reply.id, "c9");
        assert_eq!(reply.msg_type, MessageType::Error);
        assert_eq!(reply.error.unwrap().code, 404);

        let msg = Message::new::<()>("r5", MessageType::EstablishSession, None).unwrap();
        handler.on_establish_session(sender, msg).await;
        let reply = parse_reply(rx.recv().await.unwrap());
        assert_eq!(reply.error.unwrap().code, 400);
    }
}
