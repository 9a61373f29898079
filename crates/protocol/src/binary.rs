//! Binary chunk frame: 4-byte big-endian header length + JSON header + raw payload.

use serde::{Deserialize, Serialize};

/// Header carried in front of every chunk payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkHeader {
    /// Request id, echoed by the server in its `chunk_ack`.
    pub id: String,
    pub session_id: String,
    pub index: u32,
    /// SHA-256 hex of the payload (empty means no verification).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub checksum: String,
}

/// Parses a raw binary WebSocket frame into its header and payload.
///
/// Wire format: `[4 bytes: header_len (big-endian)][header_len bytes: JSON][rest: payload]`
pub fn parse_chunk_frame(data: &[u8]) -> Result<(ChunkHeader, Vec<u8>), ParseError> {
    if data.len() < 4 {
        return Err(ParseError::TooShort);
    }

    let header_len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

    if data.len() - 4 < header_len {
        return Err(ParseError::HeaderTruncated {
            expected: header_len,
            got: data.len() - 4,
        });
    }

    let header: ChunkHeader = serde_json::from_slice(&data[4..4 + header_len])
        .map_err(|e| ParseError::InvalidJson(e.to_string()))?;
    let payload = data[4 + header_len..].to_vec();

    Ok((header, payload))
}

/// Encodes a chunk header and payload into a single binary frame.
pub fn encode_chunk_frame(
    header: &ChunkHeader,
    payload: &[u8],
) -> Result<Vec<u8>, serde_json::Error> {
    let header_json = serde_json::to_vec(header)?;
    let header_len = header_json.len() as u32;

    let mut buf = Vec::with_capacity(4 + header_json.len() + payload.len());
    buf.extend_from_slice(&header_len.to_be_bytes());
    buf.extend_from_slice(&header_json);
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Errors from binary frame parsing.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("message too short (need at least 4 bytes)")]
    TooShort,

    #[error("header truncated: expected {expected} bytes, got {got}")]
    HeaderTruncated { expected: usize, got: usize },

    #[error("invalid header JSON: {0}")]
    InvalidJson(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_frame(header: &[u8], payload: &[u8]) -> Vec<u8> {
        let len = header.len() as u32;
        let mut buf = Vec::new();
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(header);
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn parse_chunk_frame_fields() {
        let header = serde_json::to_vec(&serde_json::json!({
            "id": "msg-1",
            "sessionId": "s-1",
            "index": 7,
            "checksum": "abc123"
        }))
        .unwrap();
        let payload = b"binary data here";

        let (h, data) = parse_chunk_frame(&make_frame(&header, payload)).unwrap();
        assert_eq!(h.id, "msg-1");
        assert_eq!(h.session_id, "s-1");
        assert_eq!(h.index, 7);
        assert_eq!(h.checksum, "abc123");
        assert_eq!(data, payload);
    }

    #[test]
    fn parse_too_short() {
        assert!(matches!(
            parse_chunk_frame(&[0, 0, 0]),
            Err(ParseError::TooShort)
        ));
    }

    #[test]
    fn parse_header_truncated() {
        let data = [0, 0, 0, 100, 1, 2, 3, 4, 5];
        assert!(matches!(
            parse_chunk_frame(&data),
            Err(ParseError::HeaderTruncated { expected: 100, got: 5 })
        ));
    }

    #[test]
    fn parse_invalid_json() {
        let frame = make_frame(b"not json", b"payload");
        assert!(matches!(
            parse_chunk_frame(&frame),
            Err(ParseError::InvalidJson(_))
        ));
    }

    #[test]
    fn missing_index_is_rejected() {
        let header = serde_json::to_vec(&serde_json::json!({
            "id": "msg-2",
            "sessionId": "s-1"
        }))
        .unwrap();
        assert!(parse_chunk_frame(&make_frame(&header, b"x")).is_err());
    }

    #[test]
    fn encoded_frame_parses_back() {
        let header = ChunkHeader {
            id: "r-1".into(),
            session_id: "s-9".into(),
            index: 2,
            checksum: String::new(),
        };
        let encoded = encode_chunk_frame(&header, b"tail bytes").unwrap();

        let header_len = u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]);
        let json: serde_json::Value =
            serde_json::from_slice(&encoded[4..4 + header_len as usize]).unwrap();
        assert!(json.get("checksum").is_none());

        let (h, data) = parse_chunk_frame(&encoded).unwrap();
        assert_eq!(h, header);
        assert_eq!(data, b"tail bytes");
    }
}
