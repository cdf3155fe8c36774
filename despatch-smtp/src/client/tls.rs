//! TLS upgrade of an established connection.
//!
//! The handshake is behind [`TlsUpgrade`] so the certificate policy (or the
//! whole TLS stack, in tests) is supplied by the caller.

use std::sync::Arc;

use async_trait::async_trait;
use despatch_common::internal;
use tokio_rustls::{
    TlsConnector,
    rustls::{
        ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        pki_types::{CertificateDer, ServerName, UnixTime},
    },
};

use super::error::{ClientError, Result};
use crate::redirect::BoxedIo;

/// Performs a client handshake over `stream`, validating against `server_name`.
#[async_trait]
pub trait TlsUpgrade: Send + Sync {
    async fn upgrade(&self, stream: BoxedIo, server_name: &str) -> Result<BoxedIo>;
}

/// How the server certificate is validated.
#[derive(Clone, Default)]
pub enum CertificatePolicy {
    /// Validate against the platform's trust roots.
    #[default]
    Verify,
    /// Accept any certificate. Only sensible for testing.
    AcceptInvalid,
    /// Delegate to a caller-supplied verifier.
    Custom(Arc<dyn ServerCertVerifier>),
}

impl std::fmt::Debug for CertificatePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Verify => f.write_str("Verify"),
            Self::AcceptInvalid => f.write_str("AcceptInvalid"),
            Self::Custom(_) => f.write_str("Custom"),
        }
    }
}

/// [`TlsUpgrade`] backed by rustls.
#[derive(Clone)]
pub struct RustlsUpgrade {
    connector: TlsConnector,
}

impl RustlsUpgrade {
    /// Build the client configuration for `policy`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Tls`] if the native trust roots cannot be added.
    pub fn new(policy: &CertificatePolicy) -> Result<Self> {
        let config = match policy {
            CertificatePolicy::Verify => ClientConfig::builder()
                .with_root_certificates(native_roots()?)
                .with_no_client_auth(),
            CertificatePolicy::AcceptInvalid => ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerifier))
                .with_no_client_auth(),
            CertificatePolicy::Custom(verifier) => ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::clone(verifier))
                .with_no_client_auth(),
        };

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
        })
    }
}

fn native_roots() -> Result<RootCertStore> {
    let mut root_store = RootCertStore::empty();

    let certs = rustls_native_certs::load_native_certs();
    for cert in certs.certs {
        root_store
            .add(cert)
            .map_err(|e| ClientError::Tls(format!("Failed to add certificate: {e}")))?;
    }
    for err in &certs.errors {
        internal!(level = WARN, "Skipping unloadable trust root: {err}");
    }

    Ok(root_store)
}

#[async_trait]
impl TlsUpgrade for RustlsUpgrade {
    async fn upgrade(&self, stream: BoxedIo, server_name: &str) -> Result<BoxedIo> {
        // MX exchanges come back from DNS fully qualified.
        let host = server_name.trim_end_matches('.').to_string();
        let server_name = ServerName::try_from(host)
            .map_err(|e| ClientError::Tls(format!("Invalid server name: {e}")))?;

        let tls_stream = self
            .connector
            .connect(server_name, stream)
            .await
            .map_err(|e| ClientError::Tls(e.to_string()))?;

        Ok(Box::new(tls_stream))
    }
}

/// A certificate verifier that accepts all certificates.
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
        ]
    }
}
