use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, PgConnection, PgPool, types::Json};

use crate::models::{AliasId, EmailId, Error};

pub const MAX_MESSAGE_SIZE_BYTES: usize = 25 * 1024 * 1024;

#[derive(Debug, Clone, Serialize)]
pub struct HeaderField {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Email {
    id: EmailId,
    alias_id: AliasId,
    from_address: String,
    from_name: Option<String>,
    subject: Option<String>,
    body_text: Option<String>,
    body_html: Option<String>,
    headers: Json<Vec<HeaderField>>,
    size_bytes: i64,
    is_read: bool,
    #[serde(skip)]
    raw_bytes: Vec<u8>,
    received_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl Email {
    pub fn id(&self) -> EmailId {
        self.id
    }

    pub fn alias_id(&self) -> AliasId {
        self.alias_id
    }

    pub fn size_bytes(&self) -> i64 {
        self.size_bytes
    }
}

pub struct NewEmail<'a> {
    pub alias_id: AliasId,
    pub from_address: &'a str,
    pub from_name: Option<&'a str>,
    pub subject: Option<&'a str>,
    pub body_text: Option<&'a str>,
    pub body_html: Option<&'a str>,
    pub headers: Vec<HeaderField>,
    pub raw_bytes: &'a [u8],
    pub received_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct EmailRepository {
    pool: PgPool,
}

impl EmailRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn insert(&self, conn: &mut PgConnection, new: NewEmail<'_>) -> Result<Email, Error> {
        let email: Email = sqlx::query_as(
            "insert into emails
                (alias_id, from_address, from_name, subject, body_text, body_html,
                 headers, size_bytes, raw_bytes, received_at)
             values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             returning id, alias_id, from_address, from_name, subject, body_text,
                       body_html, headers, size_bytes, is_read, raw_bytes,
                       received_at, created_at",
        )
        .bind(*new.alias_id)
        .bind(new.from_address)
        .bind(new.from_name)
        .bind(new.subject)
        .bind(new.body_text)
        .bind(new.body_html)
        .bind(Json(new.headers))
        .bind(new.raw_bytes.len() as i64)
        .bind(new.raw_bytes)
        .bind(new.received_at)
        .fetch_one(&mut *conn)
        .await?;

        Ok(email)
    }

    pub async fn find_by_id(&self, id: EmailId) -> Result<Option<Email>, Error> {
        let email: Option<Email> = sqlx::query_as(
            "select id, alias_id, from_address, from_name, subject, body_text,
                    body_html, headers, size_bytes, is_read, raw_bytes,
                    received_at, created_at
             from emails where id = $1",
        )
        .bind(*id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(email)
    }

    pub async fn list_for_alias(&self, alias_id: AliasId) -> Result<Vec<Email>, Error> {
        let emails: Vec<Email> = sqlx::query_as(
            "select id, alias_id, from_address, from_name, subject, body_text,
                    body_html, headers, size_bytes, is_read, raw_bytes,
                    received_at, created_at
             from emails where alias_id = $1 order by received_at desc",
        )
        .bind(*alias_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(emails)
    }

    pub async fn mark_read(&self, id: EmailId) -> Result<(), Error> {
        sqlx::query("update emails set is_read = true where id = $1")
            .bind(*id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn delete(&self, id: EmailId) -> Result<(), Error> {
        let result = sqlx::query("delete from emails where id = $1")
            .bind(*id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound("email not found"));
        }

        Ok(())
    }

    pub async fn ids_for_alias(&self, alias_id: AliasId) -> Result<Vec<EmailId>, Error> {
        let rows: Vec<(EmailId,)> =
            sqlx::query_as("select id from emails where alias_id = $1")
                .bind(*alias_id)
                .fetch_all(&self.pool)
                .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn delete_for_alias(&self, conn: &mut PgConnection, alias_id: AliasId) -> Result<u64, Error> {
        let result = sqlx::query("delete from emails where alias_id = $1")
            .bind(*alias_id)
            .execute(&mut *conn)
            .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::{AliasRepository, DomainRepository, NewAlias, NewDomain, UserRepository};

    async fn setup_alias(pool: &PgPool) -> AliasId {
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
        let aliases = AliasRepository::new(pool.clone());
        aliases
            .create(NewAlias {
                domain_id: domain.id(),
                local_part: "user",
                description: None,
            })
            .await
            .unwrap()
            .id()
    }

    #[sqlx::test]
    async fn insert_and_fetch(pool: PgPool) {
        let alias_id = setup_alias(&pool).await;
        let repo = EmailRepository::new(pool.clone());

        let mut conn = pool.acquire().await.unwrap();
        let email = repo
            .insert(
                &mut conn,
                NewEmail {
                    alias_id,
                    from_address: "bob@remote.test",
                    from_name: Some("Bob"),
                    subject: Some("Hello"),
                    body_text: Some("Hi there."),
                    body_html: None,
                    headers: vec![HeaderField {
                        name: "Subject".into(),
                        value: "Hello".into(),
                    }],
                    raw_bytes: b"raw message bytes",
                    received_at: Utc::now(),
                },
            )
            .await
            .unwrap();

        let fetched = repo.find_by_id(email.id()).await.unwrap().unwrap();
        assert_eq!(fetched.size_bytes(), "raw message bytes".len() as i64);
    }
}
