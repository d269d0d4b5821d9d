use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, PgPool};
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::{Duration, Instant},
};

use crate::models::{AliasId, DomainId, Error, UserId};

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Alias {
    id: AliasId,
    domain_id: DomainId,
    local_part: String,
    active: bool,
    description: Option<String>,
    created_at: DateTime<Utc>,
}

impl Alias {
    pub fn id(&self) -> AliasId {
        self.id
    }

    pub fn domain_id(&self) -> DomainId {
        self.domain_id
    }

    pub fn local_part(&self) -> &str {
        &self.local_part
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

pub struct NewAlias<'a> {
    pub domain_id: DomainId,
    pub local_part: &'a str,
    pub description: Option<&'a str>,
}

#[derive(Clone)]
pub struct AliasRepository {
    pool: PgPool,
}

impl AliasRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, new: NewAlias<'_>) -> Result<Alias, Error> {
        let alias: Alias = sqlx::query_as(
            "insert into aliases (domain_id, local_part, description)
             values ($1, $2, $3)
             returning id, domain_id, local_part, active, description, created_at",
        )
        .bind(*new.domain_id)
        .bind(new.local_part)
        .bind(new.description)
        .fetch_one(&self.pool)
        .await?;

        Ok(alias)
    }

    pub async fn find_by_id(&self, id: AliasId) -> Result<Option<Alias>, Error> {
        let alias: Option<Alias> = sqlx::query_as(
            "select id, domain_id, local_part, active, description, created_at
             from aliases where id = $1",
        )
        .bind(*id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(alias)
    }

    pub async fn list_for_domain(&self, domain_id: DomainId) -> Result<Vec<Alias>, Error> {
        let aliases: Vec<Alias> = sqlx::query_as(
            "select id, domain_id, local_part, active, description, created_at
             from aliases where domain_id = $1",
        )
        .bind(*domain_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(aliases)
    }

    pub async fn delete_for_domain(&self, domain_id: DomainId) -> Result<u64, Error> {
        let result = sqlx::query("delete from aliases where domain_id = $1")
            .bind(*domain_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// Resolves `local_part@domain_name` to its owning alias, user and active
    /// flag. The address is matched case-insensitively end to end.
    async fn lookup_raw(&self, full_address: &str) -> Result<Option<AliasLookup>, Error> {
        let row: Option<(AliasId, UserId, bool)> = sqlx::query_as(
            "select a.id, d.owner_id, a.active
             from aliases a
             join domains d on d.id = a.domain_id
             where lower(a.local_part || '@' || d.domain_name) = lower($1)",
        )
        .bind(full_address)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(alias_id, user_id, active)| AliasLookup {
            alias_id,
            user_id,
            active,
        }))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AliasLookup {
    pub alias_id: AliasId,
    pub user_id: UserId,
    pub active: bool,
}

struct CacheEntry {
    lookup: Option<AliasLookup>,
    cached_at: Instant,
}

/// Case-insensitive recipient lookup backed by the relational store. A small
/// bounded-TTL cache absorbs repeated RCPT TO lookups for the same address
/// within one SMTP burst; the store remains the source of truth.
#[derive(Clone)]
pub struct AliasDirectory {
    repository: AliasRepository,
    cache: Arc<RwLock<HashMap<String, CacheEntry>>>,
    ttl: Duration,
}

impl AliasDirectory {
    pub fn new(repository: AliasRepository) -> Self {
        Self::with_ttl(repository, Duration::from_secs(5))
    }

    pub fn with_ttl(repository: AliasRepository, ttl: Duration) -> Self {
        Self {
            repository,
            cache: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    pub async fn lookup(&self, full_address: &str) -> Result<Option<AliasLookup>, Error> {
        let key = full_address.to_ascii_lowercase();

        if let Some(hit) = self.cached(&key) {
            return Ok(hit);
        }

        let lookup = self.repository.lookup_raw(full_address).await?;

        self.cache.write().unwrap().insert(
            key,
            CacheEntry {
                lookup,
                cached_at: Instant::now(),
            },
        );

        Ok(lookup)
    }

    fn cached(&self, key: &str) -> Option<Option<AliasLookup>> {
        let cache = self.cache.read().unwrap();
        let entry = cache.get(key)?;

        if entry.cached_at.elapsed() > self.ttl {
            return None;
        }

        Some(entry.lookup)
    }

    /// Drops a cached entry immediately, used when an alias is toggled or
    /// deleted so a stale `active` flag can't linger for up to `ttl`.
    pub fn invalidate(&self, full_address: &str) {
        self.cache
            .write()
            .unwrap()
            .remove(&full_address.to_ascii_lowercase());
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::{DomainRepository, NewDomain, UserRepository};

    async fn setup(pool: PgPool) -> (AliasRepository, DomainId) {
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

        (AliasRepository::new(pool), domain.id())
    }

    #[sqlx::test]
    async fn lookup_is_case_insensitive(pool: PgPool) {
        let (repo, domain_id) = setup(pool).await;
        repo.create(NewAlias {
            domain_id,
            local_part: "Hello",
            description: None,
        })
        .await
        .unwrap();

        let found = repo.lookup_raw("HELLO@CUSTOM.TEST").await.unwrap();
        assert!(found.unwrap().active);
    }

    #[sqlx::test]
    async fn lookup_missing_returns_none(pool: PgPool) {
        let (repo, _domain_id) = setup(pool).await;
        assert!(repo.lookup_raw("nobody@custom.test").await.unwrap().is_none());
    }

    #[sqlx::test]
    async fn directory_caches_within_ttl(pool: PgPool) {
        let (repo, domain_id) = setup(pool).await;
        repo.create(NewAlias {
            domain_id,
            local_part: "cached",
            description: None,
        })
        .await
        .unwrap();

        let directory = AliasDirectory::with_ttl(repo, Duration::from_secs(60));
        let first = directory.lookup("cached@custom.test").await.unwrap();
        assert!(first.is_some());

        directory.invalidate("cached@custom.test");
        assert!(directory.cached("cached@custom.test").is_none());
    }
}
