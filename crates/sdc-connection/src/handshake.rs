//! Line-oriented I/O for the pre-framing handshake.
//!
//! The first three messages of a session are plain newline-terminated lines
//! on the raw stream. Reads are deliberately unbuffered (one byte at a time)
//! so no framed bytes are consumed past the final line.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single handshake line.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Handshake I/O failures.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("connection closed during handshake")]
    PeerClosed,

    #[error("handshake line exceeds {MAX_LINE_LEN} bytes")]
    LineTooLong,

    #[error("IO error during handshake: {0}")]
    Io(#[from] std::io::Error),
}

/// Write one line, appending the terminator if the caller left it off.
pub async fn write_line<W: AsyncWrite + Unpin>(
    writer: &mut W,
    line: &str,
) -> Result<(), HandshakeError> {
    writer.write_all(line.as_bytes()).await?;
    if !line.ends_with('\n') {
        writer.write_all(b"\n").await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Read one line, without the trailing newline.
pub async fn read_line<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String, HandshakeError> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];

    loop {
        let n = reader.read(&mut byte).await?;
        if n == 0 {
            return Err(HandshakeError::PeerClosed);
        }
        if byte[0] == b'\n' {
            break;
        }
        if line.len() >= MAX_LINE_LEN {
            return Err(HandshakeError::LineTooLong);
        }
        line.push(byte[0]);
    }

    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}
