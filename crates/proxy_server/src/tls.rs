//! TLS identity and QUIC endpoint configuration.
//!
//! The core never reads certificate files; it receives DER material that
//! the binary (or a test) already loaded or generated.

use crate::error::{ProxyError, Result};
use quinn::crypto::rustls::QuicServerConfig;
use quinn::{IdleTimeout, TransportConfig};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::sync::Arc;
use std::time::Duration;

/// ALPN token clients must offer.
pub const ALPN_PROTOCOL: &[u8] = b"bifrost/1";

/// Certificate chain plus private key, already decoded to DER.
#[derive(Debug)]
pub struct TlsIdentity {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl Clone for TlsIdentity {
    fn clone(&self) -> Self {
        Self {
            cert_chain: self.cert_chain.clone(),
            key: self.key.clone_key(),
        }
    }
}

impl TlsIdentity {
    pub fn new(cert_chain: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Self {
        Self { cert_chain, key }
    }

    /// Builds the quinn server configuration (TLS 1.3 only).
    ///
    /// `idle_timeout` becomes the QUIC transport idle timeout, so a peer that
    /// vanishes without closing is detected even when no stream is open.
    pub fn server_config(&self, idle_timeout: Duration) -> Result<quinn::ServerConfig> {
        if self.cert_chain.is_empty() {
            return Err(ProxyError::Config("TLS certificate chain is empty".to_string()));
        }

        let mut tls = rustls::ServerConfig::builder_with_provider(
            rustls::crypto::ring::default_provider().into(),
        )
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| ProxyError::Config(format!("TLS protocol setup failed: {}", e)))?
        .with_no_client_auth()
        .with_single_cert(self.cert_chain.clone(), self.key.clone_key())
        .map_err(|e| ProxyError::Config(format!("invalid TLS certificate or key: {}", e)))?;
        tls.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];
        tls.max_early_data_size = 0;

        let crypto = QuicServerConfig::try_from(Arc::new(tls))
            .map_err(|e| ProxyError::Config(format!("invalid QUIC TLS config: {}", e)))?;
        let mut config = quinn::ServerConfig::with_crypto(Arc::new(crypto));

        let mut transport = TransportConfig::default();
        transport.max_idle_timeout(Some(
            IdleTimeout::try_from(idle_timeout)
                .map_err(|_| ProxyError::Config("idle timeout too large".to_string()))?,
        ));
        config.transport_config(Arc::new(transport));
        Ok(config)
    }
}

/// Client configuration trusting exactly the given certificates.
///
/// Used by tests and tooling that talk to a proxy with a self-signed
/// identity.
pub fn client_config(trusted: &[CertificateDer<'static>]) -> Result<quinn::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in trusted {
        roots
            .add(cert.clone())
            .map_err(|e| ProxyError::Config(format!("untrusted certificate: {}", e)))?;
    }

    let mut tls = rustls::ClientConfig::builder_with_provider(
        rustls::crypto::ring::default_provider().into(),
    )
    .with_protocol_versions(&[&rustls::version::TLS13])
    .map_err(|e| ProxyError::Config(format!("TLS protocol setup failed: {}", e)))?
    .with_root_certificates(roots)
    .with_no_client_auth();
    tls.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

    let crypto = quinn::crypto::rustls::QuicClientConfig::try_from(Arc::new(tls))
        .map_err(|e| ProxyError::Config(format!("invalid QUIC TLS config: {}", e)))?;
    Ok(quinn::ClientConfig::new(Arc::new(crypto)))
}
