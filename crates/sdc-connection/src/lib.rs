//! Connection runtime for the SDC agent.
//!
//! Owns everything between the OS socket and the frame handlers: dialing the
//! tunnel server over TLS, the pre-framing line handshake, the framed
//! reader/writer pair, the per-frame-type dispatch registry, and reconnect
//! backoff.

pub mod dispatch;
pub mod framing;
pub mod handshake;
pub mod reconnect;
pub mod tls;
pub mod transport;

pub use dispatch::{run_reader_loop, DispatchError, DispatchRegistry, Dispatchable, ReaderError};
pub use framing::{spawn_writer, FrameReader, FrameSender, SendError};
pub use handshake::{read_line, write_line, HandshakeError};
pub use reconnect::{ReconnectError, ReconnectPolicy, ReconnectState};
pub use tls::{TlsConnector, TlsSettings};
pub use transport::{BoxedStream, Connector, TransportError, TunnelStream};
