use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};

use crate::models::{DomainId, Error, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "domain_state", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DomainState {
    Pending,
    Verified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "ssl_state", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SslState {
    Pending,
    Provisioning,
    Active,
    Expired,
    Failed,
    Revoked,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Domain {
    id: DomainId,
    owner_id: UserId,
    domain_name: String,
    verification_token: String,
    state: DomainState,
    verified_at: Option<DateTime<Utc>>,
    ssl_state: SslState,
    ssl_expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl Domain {
    pub fn id(&self) -> DomainId {
        self.id
    }

    pub fn owner_id(&self) -> UserId {
        self.owner_id
    }

    pub fn domain_name(&self) -> &str {
        &self.domain_name
    }

    pub fn verification_token(&self) -> &str {
        &self.verification_token
    }

    pub fn state(&self) -> DomainState {
        self.state
    }

    pub fn is_verified(&self) -> bool {
        self.state == DomainState::Verified
    }

    pub fn ssl_state(&self) -> SslState {
        self.ssl_state
    }
}

/// RFC 1035: labels are alphanumeric-or-hyphen, neither starting nor ending
/// with a hyphen, at most 63 bytes; the full name at most 253 bytes.
pub fn is_valid_domain_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 253 {
        return false;
    }

    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            && !label.starts_with('-')
            && !label.ends_with('-')
    })
}

/// True iff `name` is `parent` itself or a dotted subdomain of it, e.g.
/// `mail.example.com` is a subdomain of `example.com`.
pub fn is_subdomain_of(name: &str, parent: &str) -> bool {
    let name = name.trim_end_matches('.').to_ascii_lowercase();
    let parent = parent.trim_end_matches('.').to_ascii_lowercase();

    name == parent || name.ends_with(&format!(".{parent}"))
}

pub struct NewDomain<'a> {
    pub owner_id: UserId,
    pub domain_name: &'a str,
    pub verification_token: &'a str,
}

#[derive(Clone)]
pub struct DomainRepository {
    pool: PgPool,
}

impl DomainRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn count_for_owner(&self, owner_id: UserId) -> Result<i64, Error> {
        let (count,): (i64,) =
            sqlx::query_as("select count(*) from domains where owner_id = $1")
                .bind(*owner_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }

    pub async fn create(&self, new: NewDomain<'_>) -> Result<Domain, Error> {
        let domain: Domain = sqlx::query_as(
            "insert into domains (owner_id, domain_name, verification_token)
             values ($1, lower($2), $3)
             returning id, owner_id, domain_name, verification_token, state,
                       verified_at, ssl_state, ssl_expires_at, created_at",
        )
        .bind(*new.owner_id)
        .bind(new.domain_name)
        .bind(new.verification_token)
        .fetch_one(&self.pool)
        .await?;

        Ok(domain)
    }

    pub async fn find_by_id(&self, id: DomainId) -> Result<Option<Domain>, Error> {
        let domain: Option<Domain> = sqlx::query_as(
            "select id, owner_id, domain_name, verification_token, state,
                    verified_at, ssl_state, ssl_expires_at, created_at
             from domains where id = $1",
        )
        .bind(*id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(domain)
    }

    /// Returns the owned domain, or `Error::Forbidden` if it belongs to
    /// someone else so callers never leak another user's domain by id.
    pub async fn find_owned(&self, id: DomainId, owner_id: UserId) -> Result<Domain, Error> {
        let domain = self
            .find_by_id(id)
            .await?
            .ok_or(Error::NotFound("domain not found"))?;

        if domain.owner_id() != owner_id {
            return Err(Error::Forbidden);
        }

        Ok(domain)
    }

    /// Domains still awaiting their DNS check, oldest first, for the
    /// periodic verification sweep.
    pub async fn list_pending(&self) -> Result<Vec<Domain>, Error> {
        let domains: Vec<Domain> = sqlx::query_as(
            "select id, owner_id, domain_name, verification_token, state,
                    verified_at, ssl_state, ssl_expires_at, created_at
             from domains where state = 'pending' order by created_at asc",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(domains)
    }

    pub async fn mark_verified(&self, id: DomainId) -> Result<Domain, Error> {
        let domain: Domain = sqlx::query_as(
            "update domains set state = 'verified', verified_at = now()
             where id = $1
             returning id, owner_id, domain_name, verification_token, state,
                       verified_at, ssl_state, ssl_expires_at, created_at",
        )
        .bind(*id)
        .fetch_one(&self.pool)
        .await?;

        Ok(domain)
    }

    pub async fn set_ssl_state(
        &self,
        id: DomainId,
        ssl_state: SslState,
        ssl_expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), Error> {
        sqlx::query("update domains set ssl_state = $2, ssl_expires_at = $3 where id = $1")
            .bind(*id)
            .bind(ssl_state)
            .bind(ssl_expires_at)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn delete(&self, id: DomainId) -> Result<(), Error> {
        let result = sqlx::query("delete from domains where id = $1")
            .bind(*id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound("domain not found"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn valid_domain_names() {
        assert!(is_valid_domain_name("example.com"));
        assert!(is_valid_domain_name("mail.example.co.uk"));
        assert!(!is_valid_domain_name(""));
        assert!(!is_valid_domain_name("-example.com"));
        assert!(!is_valid_domain_name("exa mple.com"));
        assert!(!is_valid_domain_name(&"a".repeat(64)));
    }

    #[test]
    fn subdomain_matching() {
        assert!(is_subdomain_of("mail.example.com", "example.com"));
        assert!(is_subdomain_of("example.com", "example.com"));
        assert!(!is_subdomain_of("evilexample.com", "example.com"));
    }

    #[sqlx::test]
    async fn create_and_quota(pool: PgPool) {
        let users = crate::models::UserRepository::new(pool.clone());
        let user = users.create("owner@example.com").await.unwrap();

        let repo = DomainRepository::new(pool);
        assert_eq!(repo.count_for_owner(user.id()).await.unwrap(), 0);

        repo.create(NewDomain {
            owner_id: user.id(),
            domain_name: "Custom.Test",
            verification_token: "deadbeef",
        })
        .await
        .unwrap();

        assert_eq!(repo.count_for_owner(user.id()).await.unwrap(), 1);
    }

    #[sqlx::test]
    async fn list_pending_excludes_verified_domains(pool: PgPool) {
        let users = crate::models::UserRepository::new(pool.clone());
        let user = users.create("owner@example.com").await.unwrap();

        let repo = DomainRepository::new(pool);
        let pending = repo
            .create(NewDomain {
                owner_id: user.id(),
                domain_name: "pending.test",
                verification_token: "deadbeef",
            })
            .await
            .unwrap();
        let verified = repo
            .create(NewDomain {
                owner_id: user.id(),
                domain_name: "verified.test",
                verification_token: "beadfeed",
            })
            .await
            .unwrap();
        repo.mark_verified(verified.id()).await.unwrap();

        let names: Vec<String> = repo.list_pending().await.unwrap().into_iter().map(|d| d.domain_name().to_string()).collect();
        assert_eq!(names, vec![pending.domain_name().to_string()]);
    }

    #[sqlx::test]
    async fn find_owned_rejects_other_users(pool: PgPool) {
        let users = crate::models::UserRepository::new(pool.clone());
        let owner = users.create("owner@example.com").await.unwrap();
        let other = users.create("other@example.com").await.unwrap();

        let repo = DomainRepository::new(pool);
        let domain = repo
            .create(NewDomain {
                owner_id: owner.id(),
                domain_name: "custom.test",
                verification_token: "deadbeef",
            })
            .await
            .unwrap();

        let err = repo.find_owned(domain.id(), other.id()).await.unwrap_err();
        assert!(matches!(err, Error::Forbidden));
    }
}
