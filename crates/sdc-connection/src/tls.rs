//! TLS connector for the outbound tunnel socket.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use rustls::RootCertStore;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::transport::{BoxedStream, Connector, TransportError};

/// Settings for dialing the tunnel server.
#[derive(Debug, Clone)]
pub struct TlsSettings {
    /// Tunnel server hostname, also used for certificate verification.
    pub server_host: String,
    /// Tunnel server port.
    pub server_port: u16,
    /// Optional PEM file with extra root certificates. When unset, the
    /// built-in webpki roots are used.
    pub root_ca_path: Option<PathBuf>,
    /// Skip server certificate verification. Development only.
    pub insecure_skip_verify: bool,
}

/// [`Connector`] that dials TCP then performs a rustls handshake.
pub struct TlsConnector {
    settings: TlsSettings,
    connector: tokio_rustls::TlsConnector,
}

impl TlsConnector {
    pub fn new(settings: TlsSettings) -> Result<Self, TransportError> {
        ensure_crypto_provider();

        let client_config = if settings.insecure_skip_verify {
            warn!("server certificate verification is DISABLED");
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(SkipVerification::new())
                .with_no_client_auth()
        } else {
            let roots = build_root_store(settings.root_ca_path.as_deref())?;
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        };

        Ok(Self {
            connector: tokio_rustls::TlsConnector::from(Arc::new(client_config)),
            settings,
        })
    }
}

#[async_trait]
impl Connector for TlsConnector {
    async fn connect(&self) -> Result<BoxedStream, TransportError> {
        let addr = format!("{}:{}", self.settings.server_host, self.settings.server_port);
        debug!(addr = %addr, "dialing tunnel server");

        let tcp = TcpStream::connect(&addr)
            .await
            .map_err(|source| TransportError::Dial {
                addr: addr.clone(),
                source,
            })?;
        tcp.set_nodelay(true)?;

        let server_name = ServerName::try_from(self.settings.server_host.clone())
            .map_err(|e| TransportError::Tls(format!("invalid server name: {e}")))?;

        let stream = self
            .connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| TransportError::Tls(format!("handshake failed: {e}")))?;

        info!(addr = %addr, "tunnel connection established");
        Ok(Box::new(stream))
    }
}

fn ensure_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

fn build_root_store(root_ca_path: Option<&Path>) -> Result<RootCertStore, TransportError> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(path) = root_ca_path {
        let file = File::open(path).map_err(|e| {
            TransportError::Tls(format!("cannot open root CA file {}: {e}", path.display()))
        })?;
        let mut reader = BufReader::new(file);
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert = cert.map_err(|e| {
                TransportError::Tls(format!("bad certificate in {}: {e}", path.display()))
            })?;
            roots
                .add(cert)
                .map_err(|e| TransportError::Tls(format!("rejected root certificate: {e}")))?;
        }
    }

    Ok(roots)
}

/// Certificate verifier that accepts anything. Only reachable behind the
/// `insecure_skip_verify` flag.
#[derive(Debug)]
struct SkipVerification(rustls::crypto::CryptoProvider);

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self(rustls::crypto::ring::default_provider()))
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_roots_build() {
        let roots = build_root_store(None).unwrap();
        assert!(!roots.is_empty());
    }

    #[test]
    fn bad_root_ca_file_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"not a pem").unwrap();

        // Garbage that is not PEM framing simply yields no certificates.
        let roots = build_root_store(Some(file.path())).unwrap();
        assert!(!roots.is_empty());

        let err = build_root_store(Some(Path::new("/does/not/exist"))).unwrap_err();
        assert!(matches!(err, TransportError::Tls(_)));
    }

    #[test]
    fn insecure_connector_builds() {
        let settings = TlsSettings {
            server_host: "localhost".to_string(),
            server_port: 4443,
            root_ca_path: None,
            insecure_skip_verify: true,
        };
        assert!(TlsConnector::new(settings).is_ok());
    }
}
