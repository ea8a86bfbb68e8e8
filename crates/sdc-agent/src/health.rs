//! Health-check liveness loop.
//!
//! Layered over the frame transport like any other handler. Inbound probes
//! are echoed back with the same sequence; a timer task sends the agent's
//! own probes on the cadence interval and closes the session when the peer
//! goes quiet for longer than the timeout.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, Instant};
use tracing::{debug, trace, warn};

use sdc_connection::{DispatchError, Dispatchable, FrameSender};
use sdc_proto::{decode_payload, encode_payload, FrameInfo, FrameType, HealthCheckPacket,
    ServerSuppliedConf};

use crate::error::AgentError;

/// Probe cadence when the server supplies nothing.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);

/// Quiet-peer tolerance when the server supplies nothing.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
struct Timing {
    interval: Duration,
    timeout: Duration,
}

/// HEALTH_CHECK frame handler plus the probe timer.
pub struct HealthCheckHandler {
    sender: FrameSender,
    timing: Mutex<Timing>,
    last_inbound: Mutex<Instant>,
    probe_sequence: AtomicU64,
}

impl HealthCheckHandler {
    pub fn new(sender: FrameSender) -> Self {
        Self {
            sender,
            timing: Mutex::new(Timing {
                interval: DEFAULT_INTERVAL,
                timeout: DEFAULT_TIMEOUT,
            }),
            last_inbound: Mutex::new(Instant::now()),
            probe_sequence: AtomicU64::new(0),
        }
    }

    /// Apply server-directed cadence knobs. Absent fields keep their defaults.
    pub fn set_server_supplied_conf(&self, conf: &ServerSuppliedConf) {
        let mut timing = self.timing.lock().expect("health timing lock poisoned");
        if let Some(secs) = conf.health_check_interval_secs {
            timing.interval = Duration::from_secs(secs.into());
        }
        if let Some(secs) = conf.health_check_timeout_secs {
            timing.timeout = Duration::from_secs(secs.into());
        }
        debug!(
            interval_secs = timing.interval.as_secs(),
            timeout_secs = timing.timeout.as_secs(),
            "health-check cadence updated"
        );
    }

    pub fn interval(&self) -> Duration {
        self.timing.lock().expect("health timing lock poisoned").interval
    }

    pub fn timeout(&self) -> Duration {
        self.timing.lock().expect("health timing lock poisoned").timeout
    }

    /// Restart the quiet-peer clock. Called when the session goes live.
    pub fn mark_started(&self) {
        *self.last_inbound.lock().expect("health clock lock poisoned") = Instant::now();
    }

    fn quiet_for(&self) -> Duration {
        self.last_inbound
            .lock()
            .expect("health clock lock poisoned")
            .elapsed()
    }

    /// Run until the peer goes quiet past the timeout or the writer closes.
    ///
    /// The returned error ends the session; dropping the future (session
    /// teardown) cancels the timer.
    pub async fn run_timer(&self) -> AgentError {
        loop {
            let timing = *self.timing.lock().expect("health timing lock poisoned");
            sleep(timing.interval).await;

            let quiet = self.quiet_for();
            if quiet > timing.timeout {
                warn!(
                    quiet_secs = quiet.as_secs(),
                    timeout_secs = timing.timeout.as_secs(),
                    "no health-check probe from server"
                );
                return AgentError::HealthTimeout(timing.timeout);
            }

            let packet = HealthCheckPacket {
                sequence: self.probe_sequence.fetch_add(1, Ordering::Relaxed),
            };
            let payload = match encode_payload(&packet) {
                Ok(payload) => payload,
                Err(e) => return AgentError::Codec(e),
            };
            if let Err(e) = self.sender.send(FrameType::HealthCheck, payload).await {
                return AgentError::Send(e);
            }
            trace!(sequence = packet.sequence, "health-check probe sent");
        }
    }
}

#[async_trait]
impl Dispatchable for HealthCheckHandler {
    async fn dispatch(&self, frame: FrameInfo) -> Result<(), DispatchError> {
        let packet: HealthCheckPacket = decode_payload(&frame.payload)
            .map_err(|e| DispatchError::with_source("bad health-check payload", e))?;

        *self.last_inbound.lock().expect("health clock lock poisoned") = Instant::now();

        // Echo with the same sequence so the server can match its probe.
        let payload = encode_payload(&packet)
            .map_err(|e| DispatchError::with_source("health-check encode failed", e))?;
        self.sender
            .send(FrameType::HealthCheck, payload)
            .await
            .map_err(|e| DispatchError::with_source("health-check echo failed", e))?;

        trace!(sequence = packet.sequence, "health-check probe echoed");
        Ok(())
    }
}
