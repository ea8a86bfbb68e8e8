//! Authorization handshake.
//!
//! Runs on the raw stream before framing begins: one handshake line, one
//! signed login line, one verdict line from the server. The signed query is
//! OAuth 1.0 with HMAC-SHA1; the consumer key is the agent's domain and the
//! requestor id is `user@domain`.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use rand::rngs::OsRng;
use rand::Rng;
use sha1::Sha1;
use tracing::{debug, info};

use sdc_connection::{read_line, write_line, HandshakeError, TunnelStream};
use sdc_proto::{from_json_line, to_json_line, AuthRequest, AuthResponse, AuthStatus,
    HANDSHAKE_LINE};

use crate::config::LocalConf;
use crate::error::AgentError;

/// Fixed URL the signed query is computed against. The server verifies the
/// signature against the same constant.
pub const OAUTH_REQUEST_URL: &str = "https://tunnel.sdc.dev/oauth/authorize";

const OAUTH_SIGNATURE_METHOD: &str = "HMAC-SHA1";
const OAUTH_VERSION: &str = "1.0";

/// RFC 3986 unreserved characters pass through; everything else is encoded.
const OAUTH_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

fn pct(value: &str) -> String {
    utf8_percent_encode(value, OAUTH_ENCODE_SET).to_string()
}

/// Build the signed OAuth query for this agent's identity.
///
/// `timestamp` is Unix seconds; `nonce` is opaque to the server.
pub fn build_oauth_string(conf: &LocalConf, timestamp: u64, nonce: &str) -> String {
    // Parameter names sorted lexicographically, as the base string requires.
    let params: Vec<(&str, String)> = vec![
        ("oauth_consumer_key", conf.domain.clone()),
        ("oauth_nonce", nonce.to_string()),
        ("oauth_signature_method", OAUTH_SIGNATURE_METHOD.to_string()),
        ("oauth_timestamp", timestamp.to_string()),
        ("oauth_version", OAUTH_VERSION.to_string()),
        ("xoauth_requestor_id", conf.email()),
    ];

    let param_string = params
        .iter()
        .map(|(k, v)| format!("{}={}", k, pct(v)))
        .collect::<Vec<_>>()
        .join("&");

    let base_string = format!(
        "GET&{}&{}",
        pct(OAUTH_REQUEST_URL),
        pct(&param_string)
    );

    // Consumer secret only; there is no token secret in this flow.
    let signing_key = format!("{}&", pct(&conf.oauth_key));
    let mut mac = Hmac::<Sha1>::new_from_slice(signing_key.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(base_string.as_bytes());
    let signature = BASE64.encode(mac.finalize().into_bytes());

    format!(
        "{}?{}&oauth_signature={}",
        OAUTH_REQUEST_URL,
        param_string,
        pct(&signature)
    )
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Perform the authorization exchange on a freshly connected stream.
///
/// On success the signed [`AuthRequest`] is returned so registration can
/// reuse it as session context. Framing must not start before this returns.
pub async fn authorize<S: TunnelStream>(
    stream: &mut S,
    conf: &LocalConf,
) -> Result<AuthRequest, AgentError> {
    let email = conf.email();
    info!(email = %email, "starting authorization");

    write_line(stream, HANDSHAKE_LINE).await?;

    let nonce = format!("{:016x}", OsRng.gen::<u64>());
    let auth_request = AuthRequest {
        oauth_string: build_oauth_string(conf, unix_now(), &nonce),
    };
    write_line(stream, &to_json_line(&auth_request)?).await?;

    debug!("waiting for auth response");
    let line = match read_line(stream).await {
        Ok(line) => line,
        Err(HandshakeError::PeerClosed) => {
            return Err(AgentError::Transport(
                sdc_connection::TransportError::PeerClosed,
            ))
        }
        Err(e) => return Err(e.into()),
    };

    let response: AuthResponse =
        from_json_line(&line).map_err(|e| AgentError::MangledResponse {
            phase: "auth",
            detail: e.to_string(),
        })?;

    if response.status != AuthStatus::Ok {
        return Err(AgentError::Authentication {
            email,
            status: response.status,
        });
    }

    info!(email = %conf.email(), "authorization successful");
    Ok(auth_request)
}
