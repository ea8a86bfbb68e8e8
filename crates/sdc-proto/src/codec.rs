//! Encoding helpers for frame payloads and handshake lines.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::frame::MAX_FRAME_SIZE;

/// Codec failures. Decode failures on the handshake path surface to callers
/// as mangled-response errors; failures on framed payloads tear the session
/// down.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("payload encoding failed: {0}")]
    Encode(#[source] bincode::Error),

    #[error("payload decoding failed: {0}")]
    Decode(#[source] bincode::Error),

    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("json line error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode a framed payload message with bincode.
pub fn encode_payload<T: Serialize>(msg: &T) -> Result<Bytes, CodecError> {
    let bytes = bincode::serialize(msg).map_err(CodecError::Encode)?;
    if bytes.len() > MAX_FRAME_SIZE as usize {
        return Err(CodecError::PayloadTooLarge(bytes.len()));
    }
    Ok(Bytes::from(bytes))
}

/// Decode a framed payload message with bincode.
pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    bincode::deserialize(bytes).map_err(CodecError::Decode)
}

/// Serialize a handshake message as one newline-terminated JSON line.
pub fn to_json_line<T: Serialize>(msg: &T) -> Result<String, CodecError> {
    let mut line = serde_json::to_string(msg)?;
    line.push('\n');
    Ok(line)
}

/// Parse a handshake message from one JSON line.
pub fn from_json_line<T: DeserializeOwned>(line: &str) -> Result<T, CodecError> {
    Ok(serde_json::from_str(line.trim_end())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{HealthCheckPacket, SocketData};

    #[test]
    fn payload_round_trip() {
        let msg = SocketData {
            stream_id: 4,
            data: vec![0, 1, 2, 254, 255],
        };
        let bytes = encode_payload(&msg).unwrap();
        let parsed: SocketData = decode_payload(&bytes).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn payload_decode_rejects_garbage() {
        let err = decode_payload::<HealthCheckPacket>(&[0xFF; 3]).unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
    }

    #[test]
    fn json_line_rejects_garbage() {
        let err = from_json_line::<HealthCheckPacket>("SO NOT A REAL JSON STRING").unwrap_err();
        assert!(matches!(err, CodecError::Json(_)));
    }
}
