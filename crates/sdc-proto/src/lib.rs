//! Wire protocol shared by the SDC agent and the tunnel server.
//!
//! Everything after the line-oriented handshake travels as length-prefixed
//! typed frames (see [`frame`]). Frame payloads are bincode-encoded message
//! structs (see [`messages`] and [`codec`]); the handshake itself is a pair
//! of JSON lines.

pub mod codec;
pub mod frame;
pub mod messages;

pub use codec::{decode_payload, encode_payload, from_json_line, to_json_line, CodecError};
pub use frame::{FrameError, FrameInfo, FrameType, FRAME_HEADER_LEN, MAX_FRAME_SIZE};
pub use messages::{
    AuthRequest, AuthResponse, AuthStatus, ConnectionControl, HealthCheckPacket,
    RegistrationRequest, RegistrationResponse, RegistrationResult, ResourceKey,
    ServerSuppliedConf, SocketData, HANDSHAKE_LINE,
};

/// Stream identifier for multiplexed socket data.
pub type StreamId = u32;
