use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, PgPool};

use crate::models::{Error, UserId};

#[derive(Debug, Clone, Serialize)]
pub struct User {
    id: UserId,
    email: String,
    created_at: DateTime<Utc>,
    last_login_at: Option<DateTime<Utc>>,
}

impl User {
    pub fn id(&self) -> UserId {
        self.id
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn last_login_at(&self) -> Option<DateTime<Utc>> {
        self.last_login_at
    }
}

#[derive(FromRow)]
struct UserRow {
    id: UserId,
    email: String,
    created_at: DateTime<Utc>,
    last_login_at: Option<DateTime<Utc>>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: row.id,
            email: row.email,
            created_at: row.created_at,
            last_login_at: row.last_login_at,
        }
    }
}

#[derive(Clone)]
pub struct UserRepository {
    pool: PgPool,
}

impl UserRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, email: &str) -> Result<User, Error> {
        let row: UserRow = sqlx::query_as(
            "insert into users (email) values (lower($1))
             returning id, email, created_at, last_login_at",
        )
        .bind(email)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    pub async fn find_by_id(&self, id: UserId) -> Result<Option<User>, Error> {
        let row: Option<UserRow> = sqlx::query_as(
            "select id, email, created_at, last_login_at from users where id = $1",
        )
        .bind(*id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    pub async fn find_by_email(&self, email: &str) -> Result<Option<User>, Error> {
        let row: Option<UserRow> = sqlx::query_as(
            "select id, email, created_at, last_login_at from users where lower(email) = lower($1)",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    pub async fn record_login(&self, id: UserId) -> Result<(), Error> {
        sqlx::query("update users set last_login_at = now() where id = $1")
            .bind(*id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Deletes the user row. Callers must have already cascaded domains,
    /// aliases, emails and attachments via `DomainService`; sessions cascade
    /// at the database level via the foreign key.
    pub async fn delete(&self, id: UserId) -> Result<(), Error> {
        let result = sqlx::query("delete from users where id = $1")
            .bind(*id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound("user not found"));
        }

        Ok(())
    }
}
