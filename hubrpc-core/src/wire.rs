//! Framing: length-prefix (4 bytes LE) + bincode `WireFrame`; payloads are JSON text.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Size of the length prefix in bytes.
pub const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Raw multi-part frame: `[opcode, correlation id, payload, reserved]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireFrame {
    pub opcode: u8,
    pub correlation_id: String,
    pub payload: Vec<u8>,
    pub reserved: Vec<u8>,
}

/// Encode a frame: 4 bytes LE length + bincode body.
pub fn encode_frame(frame: &WireFrame) -> Result<Vec<u8>, FrameEncodeError> {
    let body = bincode::serialize(frame).map_err(FrameEncodeError::Encode)?;
    if body.len() > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge);
    }
    let len = body.len() as u32;
    let mut out = Vec::with_capacity(LEN_SIZE + body.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Error encoding a frame (bincode or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Body length announced by a length prefix.
pub fn frame_len(prefix: &[u8; LEN_SIZE]) -> Result<usize, FrameDecodeError> {
    let len = u32::from_le_bytes(*prefix);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    Ok(len as usize)
}

/// Decode a frame body (the bytes after the length prefix).
pub fn decode_body(body: &[u8]) -> Result<WireFrame, FrameDecodeError> {
    bincode::deserialize(body).map_err(FrameDecodeError::Decode)
}

/// Decode one frame from the front of `bytes`, returning it and the bytes consumed.
/// `NeedMore` means the buffer holds only part of a frame.
pub fn decode_frame(bytes: &[u8]) -> Result<(WireFrame, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = frame_len(&[bytes[0], bytes[1], bytes[2], bytes[3]])?;
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let frame = decode_body(&bytes[LEN_SIZE..LEN_SIZE + len])?;
    Ok((frame, LEN_SIZE + len))
}

/// Error decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

/// JSON-encode a payload. `None` and unit encode as `null`.
pub fn encode_payload<T: Serialize + ?Sized>(value: &T) -> Vec<u8> {
    match serde_json::to_vec(value) {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::warn!(error = %err, "payload not representable as JSON, sending null");
            b"null".to_vec()
        }
    }
}

/// Parse a JSON payload. Empty input is `null`; malformed input is logged and also `null`,
/// so the frame still reaches dispatch.
pub fn decode_payload(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    match serde_json::from_slice(bytes) {
        Ok(v) => v,
        Err(err) => {
            tracing::warn!(error = %err, len = bytes.len(), "malformed payload, treating as null");
            Value::Null
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> WireFrame {
        WireFrame {
            opcode: 2,
            correlation_id: "0000000000000001-7".into(),
            payload: encode_payload(&json!(["echo", {"n": 1}])),
            reserved: Vec::new(),
        }
    }

    #[test]
    fn roundtrip_frame() {
        let frame = sample();
        let bytes = encode_frame(&frame).unwrap();
        let (decoded, n) = decode_frame(&bytes).unwrap();
        assert_eq!(n, bytes.len());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn partial_read_need_more() {
        let bytes = encode_frame(&sample()).unwrap();
        assert!(matches!(
            decode_frame(&bytes[..2]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&bytes[..bytes.len() - 1]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn multiple_frames_in_one_buffer() {
        let a = sample();
        let b = WireFrame {
            opcode: 6,
            correlation_id: String::new(),
            payload: Vec::new(),
            reserved: Vec::new(),
        };
        let mut buf = encode_frame(&a).unwrap();
        let first_len = buf.len();
        buf.extend_from_slice(&encode_frame(&b).unwrap());
        let (m1, n1) = decode_frame(&buf).unwrap();
        assert_eq!(n1, first_len);
        let (m2, _) = decode_frame(&buf[n1..]).unwrap();
        assert_eq!(m1, a);
        assert_eq!(m2, b);
    }

    #[test]
    fn oversized_prefix_rejected() {
        let prefix = (MAX_FRAME_LEN + 1).to_le_bytes();
        assert!(matches!(frame_len(&prefix), Err(FrameDecodeError::TooLarge)));
    }

    #[test]
    fn malformed_payload_is_null() {
        assert_eq!(decode_payload(b"{not json"), Value::Null);
        assert_eq!(decode_payload(b""), Value::Null);
        assert_eq!(decode_payload(b"[1,2]"), json!([1, 2]));
    }

    #[test]
    fn none_encodes_as_null() {
        let none: Option<u32> = None;
        assert_eq!(encode_payload(&none), b"null".to_vec());
    }
}
