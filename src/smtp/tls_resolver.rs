use std::{fmt, sync::Arc};

use tokio_rustls::rustls::{
    self, ServerConfig,
    crypto::aws_lc_rs,
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
};
use tracing::{info, warn};

use crate::domain::SslProvider;

/// AEAD ECDHE-only suites (GCM and ChaCha20-Poly1305), TLS 1.2 and 1.3.
const ALLOWED_CIPHER_SUITES: &[rustls::SupportedCipherSuite] = &[
    aws_lc_rs::cipher_suite::TLS13_AES_256_GCM_SHA384,
    aws_lc_rs::cipher_suite::TLS13_AES_128_GCM_SHA256,
    aws_lc_rs::cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
    aws_lc_rs::cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
    aws_lc_rs::cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
    aws_lc_rs::cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
    aws_lc_rs::cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
    aws_lc_rs::cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
    aws_lc_rs::cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
];

/// Resolves a certificate for a TLS `ClientHello`'s server name. Tries the
/// exact SNI name, then `mail.<parent>` collapsed to `<parent>`, then the
/// configured fallback. Fails the handshake (`None`) if nothing matches and
/// no fallback is configured.
pub struct TlsResolver {
    ssl: SslProvider,
    fallback: Option<Arc<CertifiedKey>>,
}

impl fmt::Debug for TlsResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsResolver")
            .field("has_fallback", &self.fallback.is_some())
            .finish()
    }
}

impl TlsResolver {
    pub fn new(ssl: SslProvider, fallback: Option<Arc<CertifiedKey>>) -> Self {
        Self { ssl, fallback }
    }

    fn resolve_name(&self, name: &str) -> Option<Arc<CertifiedKey>> {
        if let Some(cert) = self.ssl.get_certificate(name) {
            return Some(cert.certified_key);
        }

        if let Some(parent) = name.strip_prefix("mail.")
            && let Some(cert) = self.ssl.get_certificate(parent)
        {
            return Some(cert.certified_key);
        }

        None
    }
}

impl ResolvesServerCert for TlsResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let Some(name) = client_hello.server_name() else {
            if self.fallback.is_none() {
                warn!("no SNI server name supplied and no fallback certificate configured");
            }
            return self.fallback.clone();
        };

        self.resolve_name(name).or_else(|| {
            if self.fallback.is_none() {
                warn!(server_name = name, "no certificate available for server name");
            }
            self.fallback.clone()
        })
    }
}

/// Builds the server's rustls config: minimum TLS 1.2, AEAD ECDHE-only
/// cipher suites, SNI resolution via `TlsResolver`.
pub fn build_server_config(resolver: Arc<TlsResolver>) -> Result<Arc<ServerConfig>, rustls::Error> {
    let mut provider = aws_lc_rs::default_provider();
    provider.cipher_suites = ALLOWED_CIPHER_SUITES.to_vec();

    let config = ServerConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])?
        .with_no_client_auth()
        .with_cert_resolver(resolver);

    Ok(Arc::new(config))
}

/// Logs the negotiated TLS version and cipher suite for an established
/// handshake, as required for every accepted connection.
pub fn log_handshake<IO>(stream: &tokio_rustls::server::TlsStream<IO>) {
    let (_, connection) = stream.get_ref();
    info!(
        version = ?connection.protocol_version(),
        cipher = ?connection.negotiated_cipher_suite(),
        "tls handshake complete"
    );
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn debug_does_not_leak_certificate_material() {
        let resolver = TlsResolver::new(
            SslProvider::new(crate::models::DomainRepository::new(
                sqlx::PgPool::connect_lazy("postgres://localhost/nonexistent").unwrap(),
            )),
            None,
        );

        assert_eq!(format!("{resolver:?}"), "TlsResolver { has_fallback: false }");
    }
}
