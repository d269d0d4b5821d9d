use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, PgPool, types::ipnet::IpNet};

use crate::models::{Error, SessionId, UserId};

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Session {
    id: SessionId,
    owner_id: UserId,
    #[serde(skip)]
    token_hash: Vec<u8>,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    client_ip: Option<IpNet>,
    user_agent: Option<String>,
}

impl Session {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn owner_id(&self) -> UserId {
        self.owner_id
    }

    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

pub struct NewSession<'a> {
    pub owner_id: UserId,
    pub token_hash: &'a [u8],
    pub expires_at: DateTime<Utc>,
    pub client_ip: Option<IpNet>,
    pub user_agent: Option<&'a str>,
}

#[derive(Clone)]
pub struct SessionRepository {
    pool: PgPool,
}

impl SessionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, new: NewSession<'_>) -> Result<Session, Error> {
        let session: Session = sqlx::query_as(
            "insert into sessions (owner_id, token_hash, expires_at, client_ip, user_agent)
             values ($1, $2, $3, $4, $5)
             returning id, owner_id, token_hash, issued_at, expires_at, client_ip, user_agent",
        )
        .bind(*new.owner_id)
        .bind(new.token_hash)
        .bind(new.expires_at)
        .bind(new.client_ip)
        .bind(new.user_agent)
        .fetch_one(&self.pool)
        .await?;

        Ok(session)
    }

    pub async fn find_by_token_hash(&self, token_hash: &[u8]) -> Result<Option<Session>, Error> {
        let session: Option<Session> = sqlx::query_as(
            "select id, owner_id, token_hash, issued_at, expires_at, client_ip, user_agent
             from sessions where token_hash = $1",
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(session)
    }

    /// Atomically replaces the row for `old_token_hash` with a fresh session,
    /// so a second rotation attempt against the same old token finds nothing.
    pub async fn rotate(
        &self,
        old_token_hash: &[u8],
        new: NewSession<'_>,
    ) -> Result<Option<Session>, Error> {
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query("delete from sessions where token_hash = $1")
            .bind(old_token_hash)
            .execute(&mut *tx)
            .await?;

        if deleted.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let session: Session = sqlx::query_as(
            "insert into sessions (owner_id, token_hash, expires_at, client_ip, user_agent)
             values ($1, $2, $3, $4, $5)
             returning id, owner_id, token_hash, issued_at, expires_at, client_ip, user_agent",
        )
        .bind(*new.owner_id)
        .bind(new.token_hash)
        .bind(new.expires_at)
        .bind(new.client_ip)
        .bind(new.user_agent)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Some(session))
    }

    pub async fn delete_for_owner(&self, owner_id: UserId) -> Result<u64, Error> {
        let result = sqlx::query("delete from sessions where owner_id = $1")
            .bind(*owner_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::UserRepository;
    use chrono::Duration;

    #[sqlx::test]
    async fn rotation_invalidates_old_token(pool: PgPool) {
        let users = UserRepository::new(pool.clone());
        let user = users.create("rotate@example.com").await.unwrap();

        let repo = SessionRepository::new(pool);
        repo.create(NewSession {
            owner_id: user.id(),
            token_hash: b"hash-of-r1",
            expires_at: Utc::now() + Duration::days(30),
            client_ip: None,
            user_agent: Some("curl/8"),
        })
        .await
        .unwrap();

        let rotated = repo
            .rotate(
                b"hash-of-r1",
                NewSession {
                    owner_id: user.id(),
                    token_hash: b"hash-of-r2",
                    expires_at: Utc::now() + Duration::days(30),
                    client_ip: None,
                    user_agent: Some("curl/8"),
                },
            )
            .await
            .unwrap();
        assert!(rotated.is_some());

        assert!(repo.find_by_token_hash(b"hash-of-r1").await.unwrap().is_none());
        assert!(repo.find_by_token_hash(b"hash-of-r2").await.unwrap().is_some());

        let second_attempt = repo
            .rotate(
                b"hash-of-r1",
                NewSession {
                    owner_id: user.id(),
                    token_hash: b"hash-of-r3",
                    expires_at: Utc::now() + Duration::days(30),
                    client_ip: None,
                    user_agent: None,
                },
            )
            .await
            .unwrap();
        assert!(second_attempt.is_none());
    }
}
