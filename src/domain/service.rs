use std::{collections::HashSet, sync::Arc};

use rand::Rng;
use serde::Serialize;
use serde_json::json;
use sqlx::PgPool;
use tracing::{error, info};

use crate::{
    domain::{
        dns_probe::{DEFAULT_VERIFICATION_PREFIX, DnsProbe, ProbeResult},
        ssl::SslProvider,
    },
    events::{EventBus, EventType},
    models::{
        self, AliasRepository, Domain, DomainId, DomainRepository, Error, NewDomain, UserId,
        is_valid_domain_name,
    },
    object_store::ObjectStore,
};

pub const DEFAULT_DOMAIN_QUOTA: i64 = 5;

fn reserved_domains() -> &'static HashSet<&'static str> {
    use std::sync::OnceLock;
    static RESERVED: OnceLock<HashSet<&'static str>> = OnceLock::new();
    RESERVED.get_or_init(|| {
        ["localhost", "example.com", "example.org", "example.net", "invalid", "test"]
            .into_iter()
            .collect()
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct DnsInstructions {
    pub mx_priority: u16,
    pub mx_host: String,
    pub txt_name: String,
    pub txt_value: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CascadeCounts {
    pub aliases: u64,
    pub emails: u64,
    pub attachments: u64,
}

pub enum VerifyOutcome {
    AlreadyVerified(Domain),
    Verified(Domain),
    NotReady(ProbeResult),
}

#[derive(Clone)]
pub struct DomainService {
    pool: PgPool,
    domains: DomainRepository,
    aliases: AliasRepository,
    dns_probe: DnsProbe,
    ssl: SslProvider,
    events: EventBus,
    object_store: Arc<dyn ObjectStore>,
    mail_server: String,
    verification_prefix: String,
    quota: i64,
}

impl DomainService {
    pub fn new(
        pool: PgPool,
        dns_probe: DnsProbe,
        ssl: SslProvider,
        events: EventBus,
        object_store: Arc<dyn ObjectStore>,
        mail_server: String,
    ) -> Self {
        Self {
            domains: DomainRepository::new(pool.clone()),
            aliases: AliasRepository::new(pool.clone()),
            pool,
            dns_probe,
            ssl,
            events,
            object_store,
            mail_server,
            verification_prefix: DEFAULT_VERIFICATION_PREFIX.to_string(),
            quota: DEFAULT_DOMAIN_QUOTA,
        }
    }

    pub async fn create(&self, owner_id: UserId, domain_name: &str) -> Result<(Domain, DnsInstructions), Error> {
        let domain_name = domain_name.trim().to_ascii_lowercase();

        if !is_valid_domain_name(&domain_name) {
            return Err(Error::BadRequest(format!("invalid domain name: {domain_name}")));
        }
        if reserved_domains().contains(domain_name.as_str()) {
            return Err(Error::BadRequest(format!("{domain_name} is reserved")));
        }

        if self.domains.count_for_owner(owner_id).await? >= self.quota {
            return Err(Error::QuotaExceeded);
        }

        let verification_token = mint_verification_token();

        let domain = self
            .domains
            .create(NewDomain {
                owner_id,
                domain_name: &domain_name,
                verification_token: &verification_token,
            })
            .await?;

        let instructions = DnsInstructions {
            mx_priority: 10,
            mx_host: self.mail_server.clone(),
            txt_name: format!("{}.{}", self.verification_prefix, domain_name),
            txt_value: verification_token,
        };

        Ok((domain, instructions))
    }

    /// Idempotent: a domain already verified short-circuits to success
    /// without re-probing DNS.
    pub async fn verify(&self, domain_id: DomainId, owner_id: UserId) -> Result<VerifyOutcome, Error> {
        let domain = self.domains.find_owned(domain_id, owner_id).await?;

        if domain.is_verified() {
            return Ok(VerifyOutcome::AlreadyVerified(domain));
        }

        let result = self
            .dns_probe
            .probe(
                domain.domain_name(),
                &self.mail_server,
                domain.verification_token(),
                &self.verification_prefix,
            )
            .await
            .map_err(|err| Error::Internal(err.to_string()))?;

        if !result.ready() {
            return Ok(VerifyOutcome::NotReady(result));
        }

        let domain = self.domains.mark_verified(domain_id).await?;

        self.ssl.provision(domain_id, domain.domain_name().to_string()).await;

        self.events.publish(
            EventType::DomainVerified,
            owner_id,
            json!({ "domain_id": domain_id, "domain_name": domain.domain_name() }),
        );

        Ok(VerifyOutcome::Verified(domain))
    }

    /// Re-probes every domain still in `pending` state and marks the ones
    /// whose DNS records are now in place as verified. Meant to be driven by
    /// a background sweep rather than a user-facing request, so it has no
    /// owner to check domains against and logs rather than propagates
    /// per-domain probe failures.
    pub async fn reverify_pending(&self) -> Result<(), Error> {
        for domain in self.domains.list_pending().await? {
            let result = self
                .dns_probe
                .probe(domain.domain_name(), &self.mail_server, domain.verification_token(), &self.verification_prefix)
                .await;

            let result = match result {
                Ok(result) => result,
                Err(err) => {
                    error!(domain_id = %domain.id(), domain_name = domain.domain_name(), error = %err, "dns probe failed during verification sweep");
                    continue;
                }
            };

            if !result.ready() {
                continue;
            }

            let domain = match self.domains.mark_verified(domain.id()).await {
                Ok(domain) => domain,
                Err(err) => {
                    error!(domain_id = %domain.id(), error = %err, "failed to mark domain verified during sweep");
                    continue;
                }
            };

            self.ssl.provision(domain.id(), domain.domain_name().to_string()).await;

            self.events.publish(
                EventType::DomainVerified,
                domain.owner_id(),
                json!({ "domain_id": domain.id(), "domain_name": domain.domain_name() }),
            );

            info!(domain_id = %domain.id(), domain_name = domain.domain_name(), "domain verified by background sweep");
        }

        Ok(())
    }

    /// Ordered cascade: object-store blobs for every attachment under the
    /// domain are deleted first (best effort), then DB rows in the order
    /// attachments -> emails -> aliases -> the domain itself, all inside one
    /// transaction so a failure midway leaves nothing half-deleted.
    pub async fn delete(&self, domain_id: DomainId, owner_id: UserId) -> Result<CascadeCounts, Error> {
        let domain = self.domains.find_owned(domain_id, owner_id).await?;

        if matches!(domain.ssl_state(), models::SslState::Active | models::SslState::Provisioning) {
            self.ssl.revoke(domain_id, domain.domain_name()).await;
        }

        let email_repo = crate::models::EmailRepository::new(self.pool.clone());
        let attachment_repo = crate::models::AttachmentRepository::new(self.pool.clone());

        let alias_list = self.aliases.list_for_domain(domain_id).await?;
        let mut email_ids = Vec::new();
        for alias in &alias_list {
            email_ids.extend(email_repo.ids_for_alias(alias.id()).await?);
        }

        let object_keys = attachment_repo.object_keys_for_emails(&email_ids).await?;
        for key in &object_keys {
            if let Err(err) = self.object_store.delete(key).await {
                error!(key, error = %err, "failed to delete attachment blob during domain cascade");
            }
        }

        let mut tx = self.pool.begin().await?;
        let mut attachment_count = 0;
        let mut email_count = 0;

        for email_id in &email_ids {
            attachment_count += attachment_repo.delete_for_email(&mut tx, *email_id).await?;
        }
        for alias in &alias_list {
            email_count += email_repo.delete_for_alias(&mut tx, alias.id()).await?;
        }

        let alias_count = sqlx::query("delete from aliases where domain_id = $1")
            .bind(*domain_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        sqlx::query("delete from domains where id = $1")
            .bind(*domain_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        let counts = CascadeCounts {
            aliases: alias_count,
            emails: email_count,
            attachments: attachment_count,
        };

        info!(domain_id = %domain_id, ?counts, "domain deleted");

        self.events.publish(
            EventType::DomainDeleted,
            owner_id,
            json!({ "domain_id": domain_id, "counts": counts }),
        );

        Ok(counts)
    }
}

fn mint_verification_token() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{domain::dns_probe::DnsProbe, models::UserRepository, object_store::mock::MockObjectStore};

    async fn service(pool: PgPool) -> (DomainService, UserId) {
        let users = UserRepository::new(pool.clone());
        let user = users.create("owner@example.com").await.unwrap();

        let dns_probe = DnsProbe::mock(&["mail.tempmail.test"], &[]);
        let ssl = SslProvider::new(DomainRepository::new(pool.clone()));
        let events = EventBus::new(crate::events::EventStore::new());
        let store: Arc<dyn ObjectStore> = Arc::new(MockObjectStore::new());

        (
            DomainService::new(pool, dns_probe, ssl, events, store, "mail.tempmail.test".to_string()),
            user.id(),
        )
    }

    #[sqlx::test]
    async fn create_rejects_reserved_and_invalid_names(pool: PgPool) {
        let (service, owner_id) = service(pool).await;

        assert!(matches!(
            service.create(owner_id, "localhost").await,
            Err(Error::BadRequest(_))
        ));
        assert!(matches!(
            service.create(owner_id, "-bad-.com").await,
            Err(Error::BadRequest(_))
        ));
    }

    #[sqlx::test]
    async fn create_enforces_quota(pool: PgPool) {
        let (mut service, owner_id) = service(pool).await;
        service.quota = 1;

        service.create(owner_id, "first.test").await.unwrap();
        assert!(matches!(
            service.create(owner_id, "second.test").await,
            Err(Error::QuotaExceeded)
        ));
    }

    #[sqlx::test]
    async fn verify_is_idempotent_once_verified(pool: PgPool) {
        let (service, owner_id) = service(pool).await;
        let (domain, instructions) = service.create(owner_id, "verified.test").await.unwrap();

        let dns_probe = DnsProbe::mock(&["mail.tempmail.test"], &[&instructions.txt_value]);
        let mut service = service;
        service.dns_probe = dns_probe;

        let first = service.verify(domain.id(), owner_id).await.unwrap();
        assert!(matches!(first, VerifyOutcome::Verified(_)));

        let second = service.verify(domain.id(), owner_id).await.unwrap();
        assert!(matches!(second, VerifyOutcome::AlreadyVerified(_)));
    }

    #[sqlx::test]
    async fn reverify_pending_verifies_domains_whose_dns_is_ready(pool: PgPool) {
        let (service, owner_id) = service(pool).await;
        let (domain, instructions) = service.create(owner_id, "sweep.test").await.unwrap();

        let dns_probe = DnsProbe::mock(&["mail.tempmail.test"], &[&instructions.txt_value]);
        let mut service = service;
        service.dns_probe = dns_probe;

        service.reverify_pending().await.unwrap();

        let refreshed = service.domains.find_by_id(domain.id()).await.unwrap().unwrap();
        assert!(refreshed.is_verified());
    }

    #[sqlx::test]
    async fn delete_cascades_and_publishes(pool: PgPool) {
        let (service, owner_id) = service(pool).await;
        let (domain, _instructions) = service.create(owner_id, "drop.test").await.unwrap();

        service
            .aliases
            .create(crate::models::NewAlias {
                domain_id: domain.id(),
                local_part: "inbox",
                description: None,
            })
            .await
            .unwrap();

        let counts = service.delete(domain.id(), owner_id).await.unwrap();
        assert_eq!(counts.aliases, 1);

        assert!(service.domains.find_by_id(domain.id()).await.unwrap().is_none());
    }
}
