//! Wire protocol types shared by the chunkferry server and client.

pub mod binary;
pub mod constants;
pub mod envelope;
pub mod messages;
pub mod types;

// Re-export primary types for convenience.
pub use binary::{ChunkHeader, ParseError, encode_chunk_frame, parse_chunk_frame};
pub use constants::MessageType;
pub use envelope::{Message, WsError};
pub use types::{ChunkStatus, SessionStatus};
