//! Length-prefixed typed frame layout.
//!
//! Each frame on the wire is:
//!
//! ```text
//! | length: u32 | type: u32 | payload ... |
//! ```
//!
//! `length` counts the whole frame including the length field itself, so the
//! payload is `length - 8` bytes long. All integers are big-endian. Sequence
//! numbers are local bookkeeping stamped by the framing layer on each send
//! and receive; they are never transmitted.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Frame header size: length (4) + type (4).
pub const FRAME_HEADER_LEN: usize = 8;

/// Session-wide maximum frame size (1 MiB), header included.
pub const MAX_FRAME_SIZE: u32 = 1024 * 1024;

/// Frame types carried over the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum FrameType {
    Authorization = 0,
    Registration = 1,
    HealthCheck = 2,
    SocketData = 3,
    ConnectionControl = 4,
}

impl TryFrom<u32> for FrameType {
    type Error = FrameError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameType::Authorization),
            1 => Ok(FrameType::Registration),
            2 => Ok(FrameType::HealthCheck),
            3 => Ok(FrameType::SocketData),
            4 => Ok(FrameType::ConnectionControl),
            _ => Err(FrameError::MalformedHeader(format!(
                "unknown frame type {value}"
            ))),
        }
    }
}

impl std::fmt::Display for FrameType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FrameType::Authorization => "AUTHORIZATION",
            FrameType::Registration => "REGISTRATION",
            FrameType::HealthCheck => "HEALTH_CHECK",
            FrameType::SocketData => "SOCKET_DATA",
            FrameType::ConnectionControl => "CONNECTION_CONTROL",
        };
        f.write_str(name)
    }
}

/// One frame as seen by senders and handlers.
///
/// `sequence` is stamped locally per send and per receive and is
/// monotonically non-decreasing per direction within a session. It does not
/// appear on the wire and is not retained beyond the frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameInfo {
    pub frame_type: FrameType,
    pub sequence: u64,
    pub payload: Bytes,
}

impl FrameInfo {
    pub fn new(frame_type: FrameType, sequence: u64, payload: Bytes) -> Self {
        Self {
            frame_type,
            sequence,
            payload,
        }
    }

    /// Total on-wire size of this frame.
    pub fn wire_len(&self) -> usize {
        FRAME_HEADER_LEN + self.payload.len()
    }

    /// Encode to wire bytes. The sequence field is not transmitted.
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        let total = self.wire_len();
        if total > MAX_FRAME_SIZE as usize {
            return Err(FrameError::OversizedFrame {
                length: total as u32,
                max: MAX_FRAME_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(total);
        buf.put_u32(total as u32);
        buf.put_u32(self.frame_type as u32);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Decode one frame from the front of `buf`, if a complete one is there.
    ///
    /// Returns `Ok(None)` when more bytes are needed. The consumed bytes are
    /// removed from `buf` on success. The decoded frame carries sequence 0;
    /// the receiving side stamps its own counter.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<FrameInfo>, FrameError> {
        if buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        validate_length(length)?;

        if buf.len() < length as usize {
            return Ok(None);
        }

        let mut frame = buf.split_to(length as usize);
        frame.advance(4); // length, already read
        let frame_type = FrameType::try_from(frame.get_u32())?;
        Ok(Some(FrameInfo {
            frame_type,
            sequence: 0,
            payload: frame.freeze(),
        }))
    }

    /// Parse a frame body (everything after the length field) of `length - 4`
    /// bytes, as produced by an exact-length transport read. `sequence` is
    /// the receiver's local counter for this frame.
    pub fn from_body(length: u32, sequence: u64, body: &[u8]) -> Result<FrameInfo, FrameError> {
        validate_length(length)?;
        if body.len() != length as usize - 4 {
            return Err(FrameError::ShortRead {
                expected: length as usize - 4,
                actual: body.len(),
            });
        }

        let mut body = Bytes::copy_from_slice(body);
        let frame_type = FrameType::try_from(body.get_u32())?;
        Ok(FrameInfo {
            frame_type,
            sequence,
            payload: body,
        })
    }
}

fn validate_length(length: u32) -> Result<(), FrameError> {
    if length > MAX_FRAME_SIZE {
        return Err(FrameError::OversizedFrame {
            length,
            max: MAX_FRAME_SIZE,
        });
    }
    if (length as usize) < FRAME_HEADER_LEN {
        return Err(FrameError::MalformedHeader(format!(
            "frame length {length} below minimum"
        )));
    }
    Ok(())
}

/// Errors raised while reading or writing frames.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("connection closed by peer")]
    Eof,

    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    #[error("oversized frame: {length} bytes exceeds maximum {max}")]
    OversizedFrame { length: u32, max: u32 },

    #[error("malformed frame header: {0}")]
    MalformedHeader(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let frame = FrameInfo::new(
            FrameType::SocketData,
            7,
            Bytes::from_static(b"hello tunnel"),
        );

        let encoded = frame.encode().unwrap();
        assert_eq!(encoded.len(), frame.wire_len());

        let mut buf = BytesMut::from(encoded.as_ref());
        let decoded = FrameInfo::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.frame_type, frame.frame_type);
        assert_eq!(decoded.payload, frame.payload);
        // Sequence is local bookkeeping, not wire data.
        assert_eq!(decoded.sequence, 0);
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_needs_full_frame() {
        let frame = FrameInfo::new(FrameType::HealthCheck, 1, Bytes::from_static(b"probe"));
        let encoded = frame.encode().unwrap();

        let mut buf = BytesMut::from(&encoded[..6]);
        assert!(FrameInfo::decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&encoded[6..]);
        let decoded = FrameInfo::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.frame_type, FrameType::HealthCheck);
        assert_eq!(decoded.payload, frame.payload);
    }

    #[test]
    fn decode_rejects_oversized_length() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&(MAX_FRAME_SIZE + 1).to_be_bytes());
        buf.extend_from_slice(&1u32.to_be_bytes());

        let err = FrameInfo::decode(&mut buf).unwrap_err();
        assert!(matches!(err, FrameError::OversizedFrame { .. }));
    }

    #[test]
    fn decode_rejects_undersized_length() {
        let mut buf = BytesMut::new();
        buf.put_u32(4);
        buf.put_u32(1);

        let err = FrameInfo::decode(&mut buf).unwrap_err();
        assert!(matches!(err, FrameError::MalformedHeader(_)));
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let mut buf = BytesMut::new();
        buf.put_u32(8);
        buf.put_u32(99);

        let err = FrameInfo::decode(&mut buf).unwrap_err();
        assert!(matches!(err, FrameError::MalformedHeader(_)));
    }

    #[test]
    fn encode_rejects_oversized_payload() {
        let payload = Bytes::from(vec![0u8; MAX_FRAME_SIZE as usize]);
        let frame = FrameInfo::new(FrameType::SocketData, 0, payload);
        assert!(matches!(
            frame.encode(),
            Err(FrameError::OversizedFrame { .. })
        ));
    }

    #[test]
    fn payload_is_length_minus_header() {
        let frame = FrameInfo::new(FrameType::SocketData, 0, Bytes::from_static(b"abcd"));
        let encoded = frame.encode().unwrap();
        let length = u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]);
        assert_eq!(length as usize, encoded.len());
        assert_eq!(length as usize - FRAME_HEADER_LEN, 4);
    }

    #[test]
    fn from_body_checks_exact_length() {
        let frame = FrameInfo::new(FrameType::Registration, 3, Bytes::from_static(b"xyz"));
        let encoded = frame.encode().unwrap();
        let length = u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]);

        let parsed = FrameInfo::from_body(length, 3, &encoded[4..]).unwrap();
        assert_eq!(parsed, frame);

        let err = FrameInfo::from_body(length, 3, &encoded[4..encoded.len() - 1]).unwrap_err();
        assert!(matches!(err, FrameError::ShortRead { .. }));
    }
}
