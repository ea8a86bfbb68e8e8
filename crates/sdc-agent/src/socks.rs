//! Local SOCKS5 gate.
//!
//! Accepts connections from the bundled SSH forwarder, checks every CONNECT
//! against the sealed key store, and bridges approved streams over the frame
//! transport. Each approved connection gets a locally minted 32-bit stream
//! id; SOCKET_DATA frames carry its bytes and CONNECTION_CONTROL frames
//! carry open/half-close signals.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, trace, warn};

use sdc_connection::{DispatchError, Dispatchable, FrameSender};
use sdc_proto::{decode_payload, encode_payload, ConnectionControl, FrameInfo, FrameType,
    SocketData, StreamId};

use crate::keystore::KeyStore;

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCEEDED: u8 = 0x00;
const REP_NOT_ALLOWED: u8 = 0x02;
const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
const REP_ATYP_NOT_SUPPORTED: u8 = 0x08;

/// Per-stream chunk queue depth between the reader task and a local socket.
const STREAM_QUEUE_DEPTH: usize = 64;

/// Read buffer for local sockets.
const READ_CHUNK: usize = 16 * 1024;

/// Routing table from stream id to the local bridge feeding a socket.
///
/// Ids are minted monotonically, never reused within a session.
pub struct StreamTable {
    streams: RwLock<HashMap<StreamId, mpsc::Sender<Bytes>>>,
    next_id: AtomicU32,
}

impl StreamTable {
    pub fn new() -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        }
    }

    fn mint_id(&self) -> StreamId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn register(&self, id: StreamId) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(STREAM_QUEUE_DEPTH);
        self.streams.write().await.insert(id, tx);
        rx
    }

    async fn remove(&self, id: StreamId) {
        self.streams.write().await.remove(&id);
    }

    /// Route one inbound chunk. Unknown ids are dropped: the peer may race
    /// our close.
    async fn route_data(&self, id: StreamId, data: Bytes) {
        let tx = self.streams.read().await.get(&id).cloned();
        match tx {
            Some(tx) => {
                if tx.send(data).await.is_err() {
                    trace!(stream_id = id, "stream bridge gone, chunk dropped");
                }
            }
            None => trace!(stream_id = id, "chunk for unknown stream dropped"),
        }
    }

    /// Peer half-close: the local bridge sees end-of-data and shuts down its
    /// write side, while local-to-peer traffic may continue.
    async fn close(&self, id: StreamId) {
        self.streams.write().await.remove(&id);
    }

    pub async fn active(&self) -> usize {
        self.streams.read().await.len()
    }
}

/// SOCKET_DATA frame handler: routes chunks into the stream table.
pub struct SocketDataHandler {
    table: Arc<StreamTable>,
}

impl SocketDataHandler {
    pub fn new(table: Arc<StreamTable>) -> Self {
        Self { table }
    }
}

#[async_trait]
impl Dispatchable for SocketDataHandler {
    async fn dispatch(&self, frame: FrameInfo) -> Result<(), DispatchError> {
        let msg: SocketData = decode_payload(&frame.payload)
            .map_err(|e| DispatchError::with_source("bad socket-data payload", e))?;
        self.table
            .route_data(msg.stream_id, Bytes::from(msg.data))
            .await;
        Ok(())
    }
}

/// CONNECTION_CONTROL frame handler: stream lifecycle signals from the peer.
pub struct ConnectionControlHandler {
    table: Arc<StreamTable>,
}

impl ConnectionControlHandler {
    pub fn new(table: Arc<StreamTable>) -> Self {
        Self { table }
    }
}

#[async_trait]
impl Dispatchable for ConnectionControlHandler {
    async fn dispatch(&self, frame: FrameInfo) -> Result<(), DispatchError> {
        let msg: ConnectionControl = decode_payload(&frame.payload)
            .map_err(|e| DispatchError::with_source("bad connection-control payload", e))?;
        match msg {
            ConnectionControl::Close { stream_id } => {
                debug!(stream_id, "peer closed stream");
                self.table.close(stream_id).await;
            }
            ConnectionControl::Connect { stream_id, .. } => {
                // Stream ids are minted on this side only.
                warn!(stream_id, "ignoring server-initiated stream open");
            }
        }
        Ok(())
    }
}

/// The SOCKS5 listener enforcing the key-store policy.
pub struct SocksGate {
    key_store: Arc<KeyStore>,
    sender: FrameSender,
    table: Arc<StreamTable>,
}

impl SocksGate {
    pub fn new(key_store: Arc<KeyStore>, sender: FrameSender, table: Arc<StreamTable>) -> Self {
        Self {
            key_store,
            sender,
            table,
        }
    }

    /// Accept loop. Runs until the listener fails or the task is dropped at
    /// session teardown.
    pub async fn run(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (socket, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "SOCKS accept failed");
                    continue;
                }
            };
            trace!(peer = %peer, "SOCKS connection accepted");

            let gate = self.clone();
            tokio::spawn(async move {
                if let Err(e) = gate.handle_connection(socket).await {
                    debug!(error = %e, "SOCKS connection ended with error");
                }
            });
        }
    }

    async fn handle_connection(&self, mut socket: TcpStream) -> std::io::Result<()> {
        let Some((host, port)) = self.negotiate(&mut socket).await? else {
            return Ok(());
        };

        if !self.key_store.is_allowed(&host, port) {
            info!(host = %host, port, "SOCKS connect refused by ruleset");
            reply(&mut socket, REP_NOT_ALLOWED).await?;
            return Ok(());
        }

        let stream_id = self.table.mint_id();
        let rx = self.table.register(stream_id).await;

        let open = ConnectionControl::Connect {
            stream_id,
            host: host.clone(),
            port,
        };
        let payload = encode_payload(&open).map_err(into_io)?;
        if self
            .sender
            .send(FrameType::ConnectionControl, payload)
            .await
            .is_err()
        {
            // Session is going away; refuse the client cleanly.
            self.table.remove(stream_id).await;
            reply(&mut socket, REP_NOT_ALLOWED).await?;
            return Ok(());
        }

        reply(&mut socket, REP_SUCCEEDED).await?;
        info!(stream_id, host = %host, port, "SOCKS stream opened");

        self.bridge(socket, stream_id, rx).await;
        self.table.remove(stream_id).await;
        debug!(stream_id, "SOCKS stream finished");
        Ok(())
    }

    /// SOCKS5 greeting and request parsing. Returns the requested target, or
    /// `None` when the connection was already answered and should end.
    async fn negotiate(&self, socket: &mut TcpStream) -> std::io::Result<Option<(String, u16)>> {
        let mut header = [0u8; 2];
        socket.read_exact(&mut header).await?;
        if header[0] != SOCKS_VERSION {
            return Ok(None);
        }
        let mut methods = vec![0u8; header[1] as usize];
        socket.read_exact(&mut methods).await?;

        if !methods.contains(&METHOD_NO_AUTH) {
            socket
                .write_all(&[SOCKS_VERSION, METHOD_NONE_ACCEPTABLE])
                .await?;
            return Ok(None);
        }
        socket.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;

        let mut request = [0u8; 4];
        socket.read_exact(&mut request).await?;
        if request[1] != CMD_CONNECT {
            reply(socket, REP_CMD_NOT_SUPPORTED).await?;
            return Ok(None);
        }

        let host = match request[3] {
            ATYP_IPV4 => {
                let mut addr = [0u8; 4];
                socket.read_exact(&mut addr).await?;
                Ipv4Addr::from(addr).to_string()
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                socket.read_exact(&mut len).await?;
                let mut name = vec![0u8; len[0] as usize];
                socket.read_exact(&mut name).await?;
                String::from_utf8_lossy(&name).into_owned()
            }
            ATYP_IPV6 => {
                let mut addr = [0u8; 16];
                socket.read_exact(&mut addr).await?;
                Ipv6Addr::from(addr).to_string()
            }
            _ => {
                reply(socket, REP_ATYP_NOT_SUPPORTED).await?;
                return Ok(None);
            }
        };

        let mut port = [0u8; 2];
        socket.read_exact(&mut port).await?;
        Ok(Some((host, u16::from_be_bytes(port))))
    }

    /// Pump bytes both ways until each direction ends. Half-close is honored:
    /// local EOF emits a Close frame while inbound chunks keep flowing, and a
    /// peer Close shuts down the local write side while local reads continue.
    async fn bridge(
        &self,
        socket: TcpStream,
        stream_id: StreamId,
        mut rx: mpsc::Receiver<Bytes>,
    ) {
        let (mut read_half, mut write_half) = socket.into_split();
        let sender = self.sender.clone();

        let outbound = async move {
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let msg = SocketData {
                            stream_id,
                            data: buf[..n].to_vec(),
                        };
                        let Ok(payload) = encode_payload(&msg) else {
                            break;
                        };
                        if sender.send(FrameType::SocketData, payload).await.is_err() {
                            return;
                        }
                    }
                }
            }

            // Local end is done writing; tell the peer.
            if let Ok(payload) = encode_payload(&ConnectionControl::Close { stream_id }) {
                let _ = sender.send(FrameType::ConnectionControl, payload).await;
            }
        };

        let inbound = async move {
            while let Some(data) = rx.recv().await {
                if write_half.write_all(&data).await.is_err() {
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        };

        tokio::join!(outbound, inbound);
    }
}

async fn reply(socket: &mut TcpStream, code: u8) -> std::io::Result<()> {
    // Bound address is not meaningful for a gate; zeros per convention.
    socket
        .write_all(&[SOCKS_VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await
}

fn into_io(e: sdc_proto::CodecError) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, e)
}
