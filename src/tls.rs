//! TLS client configuration for talking to the robot.
//!
//! The robot listens on a single TLS port (8883) for both the credential
//! probe and the MQTT session.  Its certificate is self-signed by the
//! manufacturer and cannot be chained to any trust store, so the connector
//! built here:
//!   - negotiates TLS 1.2 only (the firmware does not speak 1.3)
//!   - accepts any server certificate without chain or name checks
//!   - still verifies the handshake signatures against the presented key
//!
//! Skipping certificate validation is a known security caveat: anything on
//! the local segment that answers on port 8883 is trusted.

use std::net::IpAddr;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, Error as TlsError, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream, TlsConnector};

use crate::error::{Result, RoombaError};

// ── Robot certificate verifier ───────────────────────────────────────────────

/// Accepts every server certificate.
///
/// Signature checks on the handshake transcript are still delegated to the
/// provider so a broken peer fails the handshake instead of silently passing.
#[derive(Debug)]
struct AcceptAnyCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity:    &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name:   &ServerName<'_>,
        _ocsp_response: &[u8],
        _now:           UnixTime,
    ) -> std::result::Result<ServerCertVerified, TlsError> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert:    &CertificateDer<'_>,
        dss:     &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, TlsError> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert:    &CertificateDer<'_>,
        dss:     &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, TlsError> {
        // TLS 1.3 is never offered, kept for trait completeness.
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

// ── Config factory ───────────────────────────────────────────────────────────

/// Build the TLS 1.2, accept-any-certificate client config shared by the
/// credential retriever and the MQTT session.
pub fn build_tls_config() -> Result<Arc<ClientConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = Arc::new(AcceptAnyCert { provider: Arc::clone(&provider) });

    let tls_config = ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS12])
        .map_err(RoombaError::Tls)?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();

    Ok(Arc::new(tls_config))
}

// ── Connector ────────────────────────────────────────────────────────────────

/// A pre-built TLS connector for raw (non-MQTT) connections to a robot.
#[derive(Clone)]
pub struct RobotConnector {
    connector: TlsConnector,
}

impl RobotConnector {
    pub fn new() -> Result<Self> {
        Ok(Self { connector: TlsConnector::from(build_tls_config()?) })
    }

    /// Open a TCP connection to `host:port`. Failures map to
    /// [`RoombaError::Connection`].
    pub async fn open(&self, host: IpAddr, port: u16) -> Result<TcpStream> {
        TcpStream::connect((host, port))
            .await
            .map_err(|e| RoombaError::Connection(format!("{host}:{port}: {e}")))
    }

    /// Run the TLS client handshake over an already-open TCP stream.
    pub async fn handshake(&self, host: IpAddr, stream: TcpStream) -> Result<TlsStream<TcpStream>> {
        let server_name = ServerName::IpAddress(host.into());
        self.connector
            .connect(server_name, stream)
            .await
            .map_err(|e| RoombaError::Handshake(format!("{host}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_builds_with_ring_provider() {
        let cfg = build_tls_config().unwrap();
        assert!(cfg.alpn_protocols.is_empty());
    }

    #[test]
    fn connector_builds() {
        assert!(RobotConnector::new().is_ok());
    }
}
