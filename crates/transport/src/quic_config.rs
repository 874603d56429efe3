//! QUIC TLS/crypto configuration.
//!
//! The relay generates a self-signed certificate at startup and publishes its
//! SHA-256 fingerprint. Clients pin that fingerprint instead of validating a
//! certificate chain.

use std::sync::Arc;
use std::time::Duration;

use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use ring::digest;
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use tracing::debug;

use crate::error::{Result, TransportError};

/// Name placed in the relay certificate and sent as SNI.
pub const SERVER_NAME: &str = "podlink-relay";

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(10);
const MAX_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_BIDI_STREAMS: u32 = 4096;

pub type Fingerprint = [u8; 32];

/// Certificate material for a relay endpoint.
pub struct SelfSignedCert {
    pub cert_der: Vec<u8>,
    pub key_der: Vec<u8>,
    pub fingerprint: Fingerprint,
}

/// Generate a self-signed certificate for the relay.
pub fn generate_self_signed_cert() -> Result<SelfSignedCert> {
    let key_pair = rcgen::KeyPair::generate()
        .map_err(|e| TransportError::Tls(format!("key generation failed: {e}")))?;
    let cert = rcgen::CertificateParams::new(vec![SERVER_NAME.to_string()])
        .map_err(|e| TransportError::Tls(format!("cert params failed: {e}")))?
        .self_signed(&key_pair)
        .map_err(|e| TransportError::Tls(format!("self-signing failed: {e}")))?;

    let cert_der = cert.der().to_vec();
    let key_der = key_pair.serialize_der();
    let fingerprint = fingerprint_of(&cert_der);

    debug!(fingerprint = %fingerprint_hex(&fingerprint), "generated self-signed cert");

    Ok(SelfSignedCert {
        cert_der,
        key_der,
        fingerprint,
    })
}

/// SHA-256 of a DER-encoded certificate.
pub fn fingerprint_of(cert_der: &[u8]) -> Fingerprint {
    let digest = digest::digest(&digest::SHA256, cert_der);
    let mut fingerprint = [0_u8; 32];
    fingerprint.copy_from_slice(digest.as_ref());
    fingerprint
}

pub fn fingerprint_hex(fingerprint: &Fingerprint) -> String {
    hex::encode(fingerprint)
}

/// Parse a hex fingerprint. Colons and surrounding whitespace are ignored so
/// `AB:12:...` as printed by openssl also works.
pub fn parse_fingerprint(text: &str) -> Result<Fingerprint> {
    let cleaned: String = text.trim().chars().filter(|c| *c != ':').collect();
    let bytes = hex::decode(&cleaned)
        .map_err(|e| TransportError::InvalidFingerprint(format!("'{text}': {e}")))?;
    Fingerprint::try_from(bytes.as_slice()).map_err(|_| {
        TransportError::InvalidFingerprint(format!(
            "'{text}': expected 32 bytes, got {}",
            bytes.len()
        ))
    })
}

/// Transport parameters shared by both ends of a tunnel.
pub fn transport_config() -> Result<quinn::TransportConfig> {
    let mut transport = quinn::TransportConfig::default();
    transport.max_concurrent_bidi_streams(MAX_BIDI_STREAMS.into());
    transport.max_concurrent_uni_streams(0u32.into());
    transport.keep_alive_interval(Some(KEEP_ALIVE_INTERVAL));
    transport.max_idle_timeout(Some(
        quinn::IdleTimeout::try_from(MAX_IDLE_TIMEOUT)
            .map_err(|e| TransportError::Config(format!("invalid idle timeout: {e}")))?,
    ));
    Ok(transport)
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Build the relay's server config around its certificate.
pub fn build_server_config(cert_der: Vec<u8>, key_der: Vec<u8>) -> Result<quinn::ServerConfig> {
    let cert = CertificateDer::from(cert_der);
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_der));

    let mut server_crypto = rustls::ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| TransportError::Tls(format!("server TLS versions: {e}")))?
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .map_err(|e| TransportError::Tls(format!("server TLS config failed: {e}")))?;
    server_crypto.alpn_protocols = vec![protocol::ALPN.to_vec()];

    let quic_crypto = QuicServerConfig::try_from(server_crypto)
        .map_err(|e| TransportError::Config(format!("QUIC server config failed: {e}")))?;
    let mut config = quinn::ServerConfig::with_crypto(Arc::new(quic_crypto));
    config.transport_config(Arc::new(transport_config()?));
    Ok(config)
}

/// Build a client config. With `expected` the server certificate must match
/// that fingerprint; without it any certificate is accepted.
pub fn build_client_config(expected: Option<Fingerprint>) -> Result<quinn::ClientConfig> {
    let provider = provider();
    let verifier = Arc::new(FingerprintVerifier {
        expected,
        algorithms: provider.signature_verification_algorithms,
    });

    let mut client_crypto = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| TransportError::Tls(format!("client TLS versions: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    client_crypto.alpn_protocols = vec![protocol::ALPN.to_vec()];

    let quic_crypto = QuicClientConfig::try_from(client_crypto)
        .map_err(|e| TransportError::Config(format!("QUIC client config failed: {e}")))?;
    let mut config = quinn::ClientConfig::new(Arc::new(quic_crypto));
    config.transport_config(Arc::new(transport_config()?));
    Ok(config)
}

/// Checks the server certificate's SHA-256 fingerprint. Handshake signatures
/// are still verified against the presented certificate.
#[derive(Debug)]
struct FingerprintVerifier {
    expected: Option<Fingerprint>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl rustls::client::danger::ServerCertVerifier for FingerprintVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        let Some(expected) = &self.expected else {
            return Ok(rustls::client::danger::ServerCertVerified::assertion());
        };

        let actual = fingerprint_of(end_entity.as_ref());
        if &actual == expected {
            Ok(rustls::client::danger::ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General(format!(
                "certificate fingerprint mismatch: expected {}, got {}",
                fingerprint_hex(expected),
                fingerprint_hex(&actual)
            )))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
