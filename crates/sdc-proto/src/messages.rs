//! Protocol message types.
//!
//! The first two exchanges of a session are JSON lines ([`AuthRequest`],
//! [`AuthResponse`]); everything afterwards rides inside frames as bincode
//! payloads.

use serde::{Deserialize, Serialize};

use crate::StreamId;

/// First line the agent writes on a fresh connection. The advertised version
/// selects the framing generation; one session never mixes codecs.
pub const HANDSHAKE_LINE: &str = "connect v1.0";

/// Login packet, sent as one JSON line after the handshake line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    /// The full signed OAuth query: `URL?params&oauth_signature=...`.
    #[serde(rename = "oauthString")]
    pub oauth_string: String,
}

/// Authorization verdict from the tunnel server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthStatus {
    Ok,
    AccessDenied,
    ServerError,
}

impl std::fmt::Display for AuthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthStatus::Ok => f.write_str("OK"),
            AuthStatus::AccessDenied => f.write_str("ACCESS_DENIED"),
            AuthStatus::ServerError => f.write_str("SERVER_ERROR"),
        }
    }
}

/// One JSON line answering the [`AuthRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResponse {
    pub status: AuthStatus,
    #[serde(rename = "errorMsg", default, skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
}

/// Per-resource shared secret minted by the agent at registration time.
///
/// The 64-bit key authenticates SOCKS gating for one `(host, port)` tuple and
/// never outlives its session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceKey {
    pub host: String,
    pub port: u16,
    pub key: u64,
}

/// REGISTRATION frame payload, agent to server. Sent exactly once per session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationRequest {
    pub agent_id: String,
    pub socks_server_port: u16,
    pub health_check_port: u16,
    /// Raw bytes of the operator's rules file, forwarded verbatim.
    #[serde(with = "serde_bytes")]
    pub resources_xml: Vec<u8>,
    pub resource_keys: Vec<ResourceKey>,
    /// Identities permitted to view this agent's liveness in the server UI.
    /// Absent (not empty) when the option is unset.
    pub health_check_gadget_users: Option<Vec<String>>,
}

/// Registration verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationResult {
    Ok,
    RegistrationError,
    ServerError,
}

impl std::fmt::Display for RegistrationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistrationResult::Ok => f.write_str("OK"),
            RegistrationResult::RegistrationError => f.write_str("REGISTRATION_ERROR"),
            RegistrationResult::ServerError => f.write_str("SERVER_ERROR"),
        }
    }
}

/// REGISTRATION frame payload, server to agent. Received exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationResponse {
    pub result: RegistrationResult,
    pub status_message: Option<String>,
    pub server_supplied_conf: Option<ServerSuppliedConf>,
}

/// Server-directed knobs delivered with a successful registration.
///
/// Presence is optional on the wire; defaults apply per missing field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ServerSuppliedConf {
    pub health_check_interval_secs: Option<u32>,
    pub health_check_timeout_secs: Option<u32>,
}

/// HEALTH_CHECK frame payload. Inbound probes are echoed back with the same
/// sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckPacket {
    pub sequence: u64,
}

/// SOCKET_DATA frame payload: one chunk of bytes for a multiplexed stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketData {
    pub stream_id: StreamId,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// CONNECTION_CONTROL frame payload: stream lifecycle signals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionControl {
    /// A new stream was opened toward `host:port`.
    Connect {
        stream_id: StreamId,
        host: String,
        port: u16,
    },
    /// The sender will write no more bytes on this stream. Half-close: the
    /// other direction may keep flowing.
    Close { stream_id: StreamId },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_payload, encode_payload, from_json_line, to_json_line};

    #[test]
    fn auth_response_json_shape() {
        let line = to_json_line(&AuthResponse {
            status: AuthStatus::Ok,
            error_msg: None,
        })
        .unwrap();
        assert_eq!(line.trim_end(), r#"{"status":"OK"}"#);

        let parsed: AuthResponse = from_json_line(r#"{"status":"ACCESS_DENIED"}"#).unwrap();
        assert_eq!(parsed.status, AuthStatus::AccessDenied);
        assert_eq!(parsed.error_msg, None);
    }

    #[test]
    fn auth_request_round_trip() {
        let req = AuthRequest {
            oauth_string: "https://example/authorize?oauth_version=1.0&oauth_signature=sig"
                .to_string(),
        };
        let line = to_json_line(&req).unwrap();
        assert!(line.contains("oauthString"));
        let parsed: AuthRequest = from_json_line(&line).unwrap();
        assert_eq!(parsed, req);
    }

    #[test]
    fn registration_request_round_trip() {
        let req = RegistrationRequest {
            agent_id: "agent-1".to_string(),
            socks_server_port: 1080,
            health_check_port: 8200,
            resources_xml: b"<resourceRules/>".to_vec(),
            resource_keys: vec![ResourceKey {
                host: "intranet.example".to_string(),
                port: 443,
                key: 0xDEAD_BEEF_CAFE_F00D,
            }],
            health_check_gadget_users: Some(vec!["admin@example.com".to_string()]),
        };

        let bytes = encode_payload(&req).unwrap();
        let parsed: RegistrationRequest = decode_payload(&bytes).unwrap();
        assert_eq!(parsed, req);
    }

    #[test]
    fn registration_response_round_trip() {
        let resp = RegistrationResponse {
            result: RegistrationResult::RegistrationError,
            status_message: Some("quota exceeded".to_string()),
            server_supplied_conf: None,
        };
        let bytes = encode_payload(&resp).unwrap();
        let parsed: RegistrationResponse = decode_payload(&bytes).unwrap();
        assert_eq!(parsed, resp);

        let resp = RegistrationResponse {
            result: RegistrationResult::Ok,
            status_message: None,
            server_supplied_conf: Some(ServerSuppliedConf {
                health_check_interval_secs: Some(5),
                health_check_timeout_secs: None,
            }),
        };
        let bytes = encode_payload(&resp).unwrap();
        let parsed: RegistrationResponse = decode_payload(&bytes).unwrap();
        assert_eq!(parsed, resp);
    }

    #[test]
    fn connection_control_round_trip() {
        let open = ConnectionControl::Connect {
            stream_id: 9,
            host: "db.intranet.example".to_string(),
            port: 5432,
        };
        let bytes = encode_payload(&open).unwrap();
        assert_eq!(decode_payload::<ConnectionControl>(&bytes).unwrap(), open);

        let close = ConnectionControl::Close { stream_id: 9 };
        let bytes = encode_payload(&close).unwrap();
        assert_eq!(decode_payload::<ConnectionControl>(&bytes).unwrap(), close);
    }
}
