//! Transport abstraction over the outbound socket.

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// A bidirectional byte stream to the tunnel server. The handshake runs
/// directly on it; afterwards it is split into the framing halves.
pub trait TunnelStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> TunnelStream for T {}

/// Boxed stream returned by connectors.
pub type BoxedStream = Box<dyn TunnelStream>;

/// Transport-level failures.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("dial failed for {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("connection closed by peer")]
    PeerClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Dials the tunnel server and yields a connected stream.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<BoxedStream, TransportError>;
}
