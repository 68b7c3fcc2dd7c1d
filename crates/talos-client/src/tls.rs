//! TLS configuration for machine API connections
//!
//! Two modes:
//! - maintenance: the bundle carries the `insecure` sentinel, the server
//!   certificate is not verified and no client identity is presented
//! - authenticated: the client presents the bundle's certificate and the
//!   server must chain to the bundle's CA and match the dialed address

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, ring, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};

use crate::error::TalosError;
use crate::models::ClientBundle;

/// Which kind of channel a bundle produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityMode {
    /// No server verification, no client identity
    Maintenance,
    /// Mutual TLS against the bundle's CA
    Authenticated,
}

/// A ready-to-use client TLS configuration
#[derive(Debug, Clone)]
pub struct TlsSettings {
    /// rustls client configuration with ALPN `h2`
    pub config: Arc<ClientConfig>,
    /// Mode the configuration was built for
    pub mode: SecurityMode,
}

/// Build the client TLS configuration for a credential bundle
pub fn client_tls_config(bundle: &ClientBundle) -> Result<TlsSettings, TalosError> {
    let provider = Arc::new(ring::default_provider());

    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| TalosError::Credential(format!("unsupported protocol versions: {e}")))?;

    let (mut config, mode) = if bundle.is_insecure() {
        let config = builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoServerVerification(provider)))
            .with_no_client_auth();
        (config, SecurityMode::Maintenance)
    } else {
        let roots = root_store(&bundle.ca_certificate)?;
        let chain = certificate_chain(&bundle.client_certificate)?;
        let key = private_key(&bundle.client_key)?;
        let config = builder
            .with_root_certificates(roots)
            .with_client_auth_cert(chain, key)
            .map_err(|e| TalosError::Credential(format!("client certificate and key do not match: {e}")))?;
        (config, SecurityMode::Authenticated)
    };

    config.alpn_protocols = vec![b"h2".to_vec()];

    Ok(TlsSettings {
        config: Arc::new(config),
        mode,
    })
}

/// Expected server identity for a dialed host
///
/// An IP address is pinned as an IP identity, so the server certificate must
/// carry that address as an IP SAN. Anything else is treated as a DNS name.
pub fn server_name(host: &str) -> Result<ServerName<'static>, TalosError> {
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        return Ok(ServerName::IpAddress(ip.into()));
    }
    ServerName::try_from(host.to_string())
        .map_err(|e| TalosError::InvalidEndpoint(format!("{host}: {e}")))
}

fn root_store(pem: &str) -> Result<RootCertStore, TalosError> {
    let mut roots = RootCertStore::empty();
    for cert in certificate_chain(pem)? {
        roots
            .add(cert)
            .map_err(|e| TalosError::Credential(format!("invalid CA certificate: {e}")))?;
    }
    Ok(roots)
}

fn certificate_chain(pem: &str) -> Result<Vec<CertificateDer<'static>>, TalosError> {
    let chain = CertificateDer::pem_slice_iter(pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TalosError::Credential(format!("invalid certificate PEM: {e}")))?;
    if chain.is_empty() {
        return Err(TalosError::Credential("no certificate found in PEM".to_string()));
    }
    Ok(chain)
}

fn private_key(pem: &str) -> Result<PrivateKeyDer<'static>, TalosError> {
    // Talos labels PKCS#8 ed25519 keys "ED25519 PRIVATE KEY".
    let normalized = pem.replace("ED25519 PRIVATE KEY", "PRIVATE KEY");
    PrivateKeyDer::from_pem_slice(normalized.as_bytes())
        .map_err(|e| TalosError::Credential(format!("invalid private key PEM: {e}")))
}

/// Accepts any server certificate; signatures are still checked so the
/// handshake itself stays intact.
#[derive(Debug)]
struct NoServerVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for NoServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
