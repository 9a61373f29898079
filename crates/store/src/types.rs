use chrono::{DateTime, Utc};
use chunkferry_protocol::{ChunkStatus, SessionStatus};
use chunkferry_transfer::{ChunkPlan, TransferError, checksum_bytes};

/// Fixed-width dedup key: hex SHA-256 of `filename || 0x00 || size`.
pub fn dedup_key(filename: &str, size: u64) -> String {
    let mut material = Vec::with_capacity(filename.len() + 21);
    material.extend_from_slice(filename.as_bytes());
    material.push(0);
    material.extend_from_slice(size.to_string().as_bytes());
    checksum_bytes(&material)
}

/// Parameters for creating a session.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub id: String,
    pub filename: String,
    pub total_size: u64,
    pub chunk_size: u64,
}

/// A persisted upload session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub id: String,
    pub dedup_key: String,
    pub filename: String,
    pub total_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub status: SessionStatus,
    pub final_hash: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    /// Chunk layout of this session.
    pub fn plan(&self) -> Result<ChunkPlan, TransferError> {
        ChunkPlan::new(self.total_size, self.chunk_size)
    }
}

/// A persisted chunk row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRecord {
    pub session_id: String,
    pub index: u32,
    pub status: ChunkStatus,
    pub received_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_key_is_fixed_width() {
        let short = dedup_key("a", 1);
        let long = dedup_key(&"x".repeat(500), u64::MAX);
        assert_eq!(short.len(), 64);
        assert_eq!(long.len(), 64);
    }

    #[test]
    fn dedup_key_separates_name_and_size() {
        // "ab" + "12" must not collide with "ab1" + "2".
        assert_ne!(dedup_key("ab", 12), dedup_key("ab1", 2));
        assert_eq!(dedup_key("ab", 12), dedup_key("ab", 12));
        assert_ne!(dedup_key("ab", 12), dedup_key("ab", 13));
    }
}
