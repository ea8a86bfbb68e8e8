//! Per-frame-type dispatch.
//!
//! A single reader task consumes the [`FrameReader`] and routes each inbound
//! frame to the handler registered for its type. Handlers must return
//! quickly; anything long-lived is handed to the handler's own task.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sdc_proto::{FrameError, FrameInfo, FrameType};
use thiserror::Error;
use tokio::io::AsyncRead;
use tracing::{debug, warn};

use crate::framing::FrameReader;

/// Handler-side failure. Handlers translate their local errors into this so
/// the reader can tear the session down uniformly.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct DispatchError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl DispatchError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// A registered frame handler.
#[async_trait]
pub trait Dispatchable: Send + Sync {
    async fn dispatch(&self, frame: FrameInfo) -> Result<(), DispatchError>;
}

/// Immutable mapping from frame type to handler, built once per session.
#[derive(Default)]
pub struct DispatchRegistry {
    handlers: HashMap<FrameType, Arc<dyn Dispatchable>>,
}

impl DispatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `frame_type`, replacing any previous one.
    pub fn register(&mut self, frame_type: FrameType, handler: Arc<dyn Dispatchable>) {
        self.handlers.insert(frame_type, handler);
    }

    pub fn handler_for(&self, frame_type: FrameType) -> Option<Arc<dyn Dispatchable>> {
        self.handlers.get(&frame_type).cloned()
    }
}

/// Reader-loop failure; any variant tears the session down.
#[derive(Debug, Error)]
pub enum ReaderError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("no handler registered for {0} frames")]
    UnhandledFrameType(FrameType),

    #[error("dispatch failed for {frame_type} frame: {source}")]
    Dispatch {
        frame_type: FrameType,
        #[source]
        source: DispatchError,
    },
}

/// Consume frames until the peer closes or a protocol violation occurs.
///
/// Returns `Ok(())` on a clean peer close. Every error return means the
/// session must be torn down.
pub async fn run_reader_loop<R: AsyncRead + Unpin>(
    mut reader: FrameReader<R>,
    registry: DispatchRegistry,
) -> Result<(), ReaderError> {
    loop {
        let frame = match reader.recv().await {
            Ok(frame) => frame,
            Err(FrameError::Eof) => {
                debug!("peer closed the tunnel, reader stopping");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let frame_type = frame.frame_type;
        let Some(handler) = registry.handler_for(frame_type) else {
            warn!(frame_type = %frame_type, "frame for unregistered type");
            return Err(ReaderError::UnhandledFrameType(frame_type));
        };

        handler
            .dispatch(frame)
            .await
            .map_err(|source| ReaderError::Dispatch { frame_type, source })?;
    }
}
