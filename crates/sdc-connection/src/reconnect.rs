//! Reconnect pacing with exponential backoff.

use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tracing::debug;

/// Backoff knobs for the session reconnect loop.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Consecutive failed attempts tolerated before giving up. `None` retries
    /// forever.
    pub max_attempts: Option<usize>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

/// Reconnect budget exhausted.
#[derive(Debug, Error)]
#[error("reconnect budget exhausted after {attempts} attempts")]
pub struct ReconnectError {
    pub attempts: usize,
}

/// Per-process reconnect state. `wait()` before each dial; `reset()` after a
/// session reaches registration.
pub struct ReconnectState {
    policy: ReconnectPolicy,
    current_backoff: Duration,
    attempt: usize,
}

impl ReconnectState {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            current_backoff: policy.initial_backoff,
            policy,
            attempt: 0,
        }
    }

    /// Sleep out the current backoff, or fail once the budget is spent.
    pub async fn wait(&mut self) -> Result<(), ReconnectError> {
        self.attempt += 1;

        if let Some(max) = self.policy.max_attempts {
            if self.attempt > max {
                return Err(ReconnectError { attempts: max });
            }
        }

        debug!(
            attempt = self.attempt,
            backoff_secs = self.current_backoff.as_secs_f64(),
            "waiting before reconnect"
        );
        sleep(self.current_backoff).await;

        let next = Duration::from_secs_f64(
            self.current_backoff.as_secs_f64() * self.policy.multiplier,
        );
        self.current_backoff = next.min(self.policy.max_backoff);
        Ok(())
    }

    /// Forget accumulated failures after a healthy session.
    pub fn reset(&mut self) {
        self.current_backoff = self.policy.initial_backoff;
        self.attempt = 0;
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }
}
