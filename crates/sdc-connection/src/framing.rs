//! Framed reader and writer halves of the tunnel connection.
//!
//! Exactly one [`FrameReader`] owns the inbound side and exactly one writer
//! task owns the outbound side. [`FrameSender`] handles are cheap clones that
//! submit to the writer's bounded queue; frame atomicity lives in the writer
//! task, so concurrent senders can never interleave bytes on the wire. Each
//! direction stamps its frames with a local monotonically increasing
//! sequence number for bookkeeping; sequences are never transmitted.

use bytes::Bytes;
use sdc_proto::frame::FRAME_HEADER_LEN;
use sdc_proto::{FrameError, FrameInfo, FrameType, MAX_FRAME_SIZE};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

/// Depth of the outbound frame queue. Senders suspend when it is full.
pub const WRITER_QUEUE_DEPTH: usize = 64;

/// Failure submitting an outbound frame.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("writer queue closed; session is shutting down")]
    Closed,

    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Single-owner inbound frame reader.
///
/// Stamps each received frame with a local monotonically increasing sequence
/// number; sequences are bookkeeping for this direction, not wire data.
pub struct FrameReader<R> {
    inner: R,
    sequence: u64,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, sequence: 0 }
    }

    /// Read one complete frame. Blocks until the frame is fully available.
    ///
    /// A clean close before the first header byte is `Eof`; a close mid-frame
    /// is `ShortRead`.
    pub async fn recv(&mut self) -> Result<FrameInfo, FrameError> {
        let mut len_buf = [0u8; 4];
        let mut filled = 0usize;
        while filled < len_buf.len() {
            let n = self
                .inner
                .read(&mut len_buf[filled..])
                .await
                .map_err(io_to_frame_error)?;
            if n == 0 {
                if filled == 0 {
                    return Err(FrameError::Eof);
                }
                return Err(FrameError::ShortRead {
                    expected: len_buf.len(),
                    actual: filled,
                });
            }
            filled += n;
        }

        let length = u32::from_be_bytes(len_buf);
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

        let mut body = vec![0u8; length as usize - 4];
        self.inner
            .read_exact(&mut body)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => FrameError::ShortRead {
                    expected: length as usize - 4,
                    actual: 0,
                },
                _ => io_to_frame_error(e),
            })?;

        let frame = FrameInfo::from_body(length, self.sequence, &body)?;
        self.sequence += 1;
        trace!(frame_type = %frame.frame_type, sequence = frame.sequence, len = frame.payload.len(), "frame received");
        Ok(frame)
    }
}

fn io_to_frame_error(e: std::io::Error) -> FrameError {
    match e.kind() {
        std::io::ErrorKind::UnexpectedEof => FrameError::Eof,
        _ => FrameError::MalformedHeader(format!("read failed: {e}")),
    }
}

/// Cheap-clone handle for submitting outbound frames.
#[derive(Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<(FrameType, Bytes)>,
}

impl FrameSender {
    /// Queue one frame. Suspends while the writer queue is full; fails once
    /// the writer task has stopped.
    pub async fn send(&self, frame_type: FrameType, payload: Bytes) -> Result<(), SendError> {
        // Oversize is caught here so the writer task never has to die on a
        // bad local submission.
        let wire_len = FRAME_HEADER_LEN + payload.len();
        if wire_len > MAX_FRAME_SIZE as usize {
            return Err(SendError::Frame(FrameError::OversizedFrame {
                length: wire_len as u32,
                max: MAX_FRAME_SIZE,
            }));
        }

        self.tx
            .send((frame_type, payload))
            .await
            .map_err(|_| SendError::Closed)
    }
}

/// Spawn the single writer task that owns the outbound half.
///
/// Returns the shared sender handle and the task handle. The task exits when
/// every sender is dropped or the peer stops accepting bytes.
pub fn spawn_writer<W>(mut writer: W) -> (FrameSender, JoinHandle<Result<(), FrameError>>)
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    let (tx, mut rx) = mpsc::channel::<(FrameType, Bytes)>(WRITER_QUEUE_DEPTH);

    let handle = tokio::spawn(async move {
        let mut sequence: u64 = 0;
        while let Some((frame_type, payload)) = rx.recv().await {
            let frame = FrameInfo::new(frame_type, sequence, payload);
            let encoded = frame.encode()?;
            if let Err(e) = writer.write_all(&encoded).await {
                error!(error = %e, "frame write failed");
                return Err(io_to_frame_error(e));
            }
            if let Err(e) = writer.flush().await {
                error!(error = %e, "frame flush failed");
                return Err(io_to_frame_error(e));
            }
            trace!(frame_type = %frame_type, sequence, len = encoded.len(), "frame sent");
            sequence += 1;
        }

        debug!("writer queue drained, writer task stopping");
        let _ = writer.shutdown().await;
        Ok(())
    });

    (FrameSender { tx }, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdc_proto::{decode_payload, encode_payload, HealthCheckPacket};

    #[tokio::test]
    async fn send_recv_round_trip() {
        let (client, server) = tokio::io::duplex(4096);
        let (_server_read, server_write) = tokio::io::split(server);
        let (client_read, _client_write) = tokio::io::split(client);

        let (sender, _writer) = spawn_writer(server_write);
        let mut reader = FrameReader::new(client_read);

        let payload = encode_payload(&HealthCheckPacket { sequence: 42 }).unwrap();
        sender
            .send(FrameType::HealthCheck, payload.clone())
            .await
            .unwrap();

        let frame = reader.recv().await.unwrap();
        assert_eq!(frame.frame_type, FrameType::HealthCheck);
        assert_eq!(frame.sequence, 0);
        let packet: HealthCheckPacket = decode_payload(&frame.payload).unwrap();
        assert_eq!(packet.sequence, 42);
    }

    #[tokio::test]
    async fn sequences_are_monotonic_across_concurrent_senders() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (_server_read, server_write) = tokio::io::split(server);
        let (client_read, _client_write) = tokio::io::split(client);

        let (sender, _writer) = spawn_writer(server_write);
        let mut reader = FrameReader::new(client_read);

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let sender = sender.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..16 {
                    sender
                        .send(FrameType::SocketData, Bytes::from_static(b"chunk"))
                        .await
                        .unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let mut last = 0u64;
        for i in 0..(8 * 16) {
            let frame = reader.recv().await.unwrap();
            assert_eq!(frame.payload.as_ref(), b"chunk");
            if i > 0 {
                assert!(frame.sequence > last);
            }
            last = frame.sequence;
        }
    }

    #[tokio::test]
    async fn clean_close_is_eof() {
        let (client, server) = tokio::io::duplex(256);
        let (client_read, _client_write) = tokio::io::split(client);
        drop(server);

        let mut reader = FrameReader::new(client_read);
        let err = reader.recv().await.unwrap_err();
        assert!(matches!(err, FrameError::Eof));
    }

    #[tokio::test]
    async fn truncated_frame_is_short_read() {
        let (client, mut server) = tokio::io::duplex(256);
        let (client_read, _client_write) = tokio::io::split(client);

        // Announce a 32-byte frame but deliver only the header.
        server.write_all(&32u32.to_be_bytes()).await.unwrap();
        server.write_all(&1u32.to_be_bytes()).await.unwrap();
        drop(server);

        let mut reader = FrameReader::new(client_read);
        let err = reader.recv().await.unwrap_err();
        assert!(matches!(err, FrameError::ShortRead { .. }));
    }

    #[tokio::test]
    async fn oversized_length_rejected_before_reading_body() {
        let (client, mut server) = tokio::io::duplex(256);
        let (client_read, _client_write) = tokio::io::split(client);

        server
            .write_all(&(MAX_FRAME_SIZE + 1).to_be_bytes())
            .await
            .unwrap();

        let mut reader = FrameReader::new(client_read);
        let err = reader.recv().await.unwrap_err();
        assert!(matches!(err, FrameError::OversizedFrame { .. }));
    }

    #[tokio::test]
    async fn oversized_send_rejected_locally() {
        let (_client, server) = tokio::io::duplex(256);
        let (_server_read, server_write) = tokio::io::split(server);
        let (sender, _writer) = spawn_writer(server_write);

        let huge = Bytes::from(vec![0u8; MAX_FRAME_SIZE as usize]);
        let err = sender.send(FrameType::SocketData, huge).await.unwrap_err();
        assert!(matches!(err, SendError::Frame(FrameError::OversizedFrame { .. })));
    }
}
