//! Handler trait for processing client messages.
//!
//! Implementors provide the upload logic while the server framework handles
//! connection management, routing and the binary chunk frame.

use std::future::Future;
use std::pin::Pin;

use chunkferry_protocol::{ChunkHeader, Message, MessageType};

use crate::connection::{ClientMeta, Sender};

/// A boxed future returned by handler methods.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Trait for handling messages from a client.
///
/// Each request method receives a `sender` to reply through and the parsed
/// envelope (text) or chunk header and payload (binary). Every request must
/// be answered with a reply carrying the same id.
pub trait Handler: Send + Sync + 'static {
    /// `establish_session`: create or rejoin the session for a file.
    fn on_establish_session(&self, sender: Sender, msg: Message) -> HandlerFuture<'_>;

    /// `session_status`: read-only lookup of the session for a file.
    fn on_session_status(&self, sender: Sender, msg: Message) -> HandlerFuture<'_>;

    /// A binary chunk frame.
    fn on_binary_chunk(
        &self,
        sender: Sender,
        header: ChunkHeader,
        data: Vec<u8>,
    ) -> HandlerFuture<'_>;

    /// `ping`.
    fn on_ping(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            if let Ok(reply) = msg.reply(MessageType::Pong, Option::<&()>::None) {
                let _ = sender.send_msg(reply);
            }
        })
    }

    /// Called once after the client's read pump has stopped.
    fn on_disconnected(&self, meta: &ClientMeta) -> HandlerFuture<'_> {
        let _ = meta;
        Box::pin(async {})
    }
}
