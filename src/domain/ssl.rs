use std::{
    collections::HashSet,
    sync::{Arc, RwLock},
};

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tokio_rustls::rustls::sign::CertifiedKey;
use tracing::{error, info};

use crate::models::{DomainId, DomainRepository, Error as ModelError, SslState};

#[derive(Debug, Error)]
pub enum SslError {
    #[error("certificate issuance failed: {0}")]
    Issuance(String),
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// A provisioned certificate together with its expiry, as returned to
/// `TLSResolver` for SNI resolution.
#[derive(Clone)]
pub struct ProvisionedCertificate {
    pub name: String,
    pub certified_key: Arc<CertifiedKey>,
    pub expires_at: DateTime<Utc>,
}

struct CertStore {
    certs: std::collections::HashMap<String, ProvisionedCertificate>,
    in_flight: HashSet<String>,
}

/// Async certificate lifecycle for verified domains. Provision/Revoke update
/// the domain's `ssl_state` column and a small in-memory cert cache that
/// `TLSResolver` reads from on every handshake; concurrent provisions for the
/// same name collapse into one in-flight entry.
#[derive(Clone)]
pub struct SslProvider {
    domains: DomainRepository,
    store: Arc<RwLock<CertStore>>,
}

impl SslProvider {
    pub fn new(domains: DomainRepository) -> Self {
        Self {
            domains,
            store: Arc::new(RwLock::new(CertStore {
                certs: std::collections::HashMap::new(),
                in_flight: HashSet::new(),
            })),
        }
    }

    /// Synchronous on purpose: `TLSResolver::resolve` is called from
    /// rustls's non-async `ResolvesServerCert` hook on every handshake.
    pub fn is_provisioning(&self, name: &str) -> bool {
        self.store.read().expect("ssl cert store lock poisoned").in_flight.contains(name)
    }

    pub fn get_certificate(&self, name: &str) -> Option<ProvisionedCertificate> {
        self.store.read().expect("ssl cert store lock poisoned").certs.get(name).cloned()
    }

    /// Fire-and-forget from the caller's perspective: marks the domain
    /// `provisioning`, issues the certificate out of band, then marks
    /// `active`/`failed`. Concurrent calls for the same name are no-ops
    /// after the first.
    pub async fn provision(&self, domain_id: DomainId, name: String) {
        {
            let mut store = self.store.write().expect("ssl cert store lock poisoned");
            if !store.in_flight.insert(name.clone()) {
                return;
            }
        }

        let domains = self.domains.clone();
        let store = self.store.clone();

        tokio::spawn(async move {
            if let Err(err) = domains.set_ssl_state(domain_id, SslState::Provisioning, None).await {
                error!(%name, error = %err, "failed to mark domain as provisioning");
            }

            match issue_certificate(&name).await {
                Ok(cert) => {
                    let expires_at = cert.expires_at;
                    store
                        .write()
                        .expect("ssl cert store lock poisoned")
                        .certs
                        .insert(name.clone(), cert);

                    if let Err(err) = domains
                        .set_ssl_state(domain_id, SslState::Active, Some(expires_at))
                        .await
                    {
                        error!(%name, error = %err, "failed to mark domain ssl as active");
                    } else {
                        info!(%name, "certificate provisioned");
                    }
                }
                Err(err) => {
                    error!(%name, error = %err, "certificate provisioning failed permanently");
                    if let Err(err) = domains.set_ssl_state(domain_id, SslState::Failed, None).await {
                        error!(%name, error = %err, "failed to mark domain ssl as failed");
                    }
                }
            }

            store
                .write()
                .expect("ssl cert store lock poisoned")
                .in_flight
                .remove(&name);
        });
    }

    /// Best-effort: removes the cached certificate and marks the domain
    /// revoked. Never blocks a delete on the upstream CA responding.
    pub async fn revoke(&self, domain_id: DomainId, name: &str) {
        self.store
            .write()
            .expect("ssl cert store lock poisoned")
            .certs
            .remove(name);

        if let Err(err) = self.domains.set_ssl_state(domain_id, SslState::Revoked, None).await {
            error!(%name, error = %err, "failed to mark domain ssl as revoked");
        }
    }
}

/// Certificate issuance against the upstream ACME-compatible CA is outside
/// the scope of this crate's tests; this stands in for that call and would
/// be the integration point for an `instant-acme`-style client.
async fn issue_certificate(name: &str) -> Result<ProvisionedCertificate, SslError> {
    Err(SslError::Issuance(format!(
        "no certificate authority configured for {name}"
    )))
}

#[allow(dead_code)]
fn default_validity() -> Duration {
    Duration::days(90)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::{NewDomain, UserRepository};
    use sqlx::PgPool;

    #[sqlx::test]
    async fn provisioning_is_deduplicated(pool: PgPool) {
        let users = UserRepository::new(pool.clone());
        let user = users.create("owner@example.com").await.unwrap();
        let domains = DomainRepository::new(pool.clone());
        let domain = domains
            .create(NewDomain {
                owner_id: user.id(),
                domain_name: "custom.test",
                verification_token: "deadbeef",
            })
            .await
            .unwrap();

        let ssl = SslProvider::new(domains);
        ssl.provision(domain.id(), "custom.test".to_string()).await;
        assert!(ssl.is_provisioning("custom.test"));

        // A second call for the same name while the first is in flight is a no-op.
        ssl.provision(domain.id(), "custom.test".to_string()).await;
        assert!(ssl.is_provisioning("custom.test"));
    }
}
