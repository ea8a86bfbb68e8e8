//! Agent-wide error taxonomy.
//!
//! Handlers translate their local failures into these variants so the
//! session can tear down uniformly and `main` can decide between reconnect
//! and exit.

use std::time::Duration;

use sdc_connection::{HandshakeError, ReaderError, SendError, TransportError};
use sdc_proto::{AuthStatus, CodecError, FrameError};
use thiserror::Error;

use crate::rules::RuleError;

/// Process exit codes, per the operational contract.
pub mod exit_code {
    pub const OK: i32 = 0;
    pub const CONFIG: i32 = 1;
    pub const AUTHENTICATION: i32 = 2;
    pub const REGISTRATION: i32 = 3;
    pub const TRANSPORT: i32 = 4;
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// Unparseable peer response on the handshake path. The message MUST
    /// begin with "Mangled"; monitoring matches on that prefix.
    #[error("Mangled {phase} response: {detail}")]
    MangledResponse {
        phase: &'static str,
        detail: String,
    },

    #[error("authentication failed for {email}: {status}")]
    Authentication { email: String, status: AuthStatus },

    /// The server refused the registration request. Unrecoverable until the
    /// operator changes configuration.
    #[error("registration failed: {message}")]
    RegistrationDenied { message: String },

    #[error("no registration response within {0:?}")]
    RegistrationTimeout(Duration),

    #[error(transparent)]
    ResourceUrl(#[from] RuleError),

    #[error(transparent)]
    Framing(#[from] FrameError),

    #[error(transparent)]
    Reader(#[from] ReaderError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Send(#[from] SendError),

    #[error("no health-check probe within {0:?}")]
    HealthTimeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// Whether a fresh session attempt can fix this.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            AgentError::Config(_)
                | AgentError::Authentication { .. }
                | AgentError::RegistrationDenied { .. }
                | AgentError::ResourceUrl(_)
        )
    }

    /// Exit code when this error ends the process.
    pub fn exit_code(&self) -> i32 {
        match self {
            AgentError::Config(_) => exit_code::CONFIG,
            AgentError::Authentication { .. } => exit_code::AUTHENTICATION,
            AgentError::RegistrationDenied { .. } | AgentError::ResourceUrl(_) => {
                exit_code::REGISTRATION
            }
            _ => exit_code::TRANSPORT,
        }
    }

    /// Short classification used in the one-line failure log.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::Config(_) => "config",
            AgentError::Transport(_) => "transport",
            AgentError::Handshake(_) => "handshake",
            AgentError::MangledResponse { .. } => "mangled-response",
            AgentError::Authentication { .. } => "authentication",
            AgentError::RegistrationDenied { .. } => "registration-denied",
            AgentError::RegistrationTimeout(_) => "registration-timeout",
            AgentError::ResourceUrl(_) => "resource-url",
            AgentError::Framing(_) | AgentError::Reader(_) | AgentError::Codec(_) => "framing",
            AgentError::Send(_) => "send",
            AgentError::HealthTimeout(_) => "health-timeout",
            AgentError::Io(_) => "io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mangled_message_prefix() {
        let err = AgentError::MangledResponse {
            phase: "auth",
            detail: "expected value at line 1".to_string(),
        };
        assert!(err.to_string().starts_with("Mangled"));
    }

    #[test]
    fn exit_codes_follow_contract() {
        assert_eq!(AgentError::Config("x".into()).exit_code(), 1);
        assert_eq!(
            AgentError::Authentication {
                email: "a@b".into(),
                status: AuthStatus::AccessDenied,
            }
            .exit_code(),
            2
        );
        assert_eq!(
            AgentError::RegistrationDenied {
                message: "quota exceeded".into(),
            }
            .exit_code(),
            3
        );
        assert_eq!(
            AgentError::HealthTimeout(Duration::from_secs(30)).exit_code(),
            4
        );
    }

    #[test]
    fn recoverability_split() {
        assert!(!AgentError::Config("x".into()).is_recoverable());
        assert!(!AgentError::RegistrationDenied {
            message: "no".into()
        }
        .is_recoverable());
        assert!(AgentError::MangledResponse {
            phase: "auth",
            detail: "bad json".into(),
        }
        .is_recoverable());
        assert!(AgentError::HealthTimeout(Duration::from_secs(30)).is_recoverable());
    }
}
