use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection, PgPool};

use crate::models::{AttachmentId, EmailId, Error};

pub const MAX_ATTACHMENT_SIZE_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "attachment_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AttachmentStatus {
    Pending,
    Active,
    Failed,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Attachment {
    id: AttachmentId,
    email_id: EmailId,
    filename: String,
    content_type: String,
    size_bytes: i64,
    object_key: String,
    storage_url: Option<String>,
    #[serde(skip)]
    sha256: Vec<u8>,
    status: AttachmentStatus,
}

impl Attachment {
    pub fn id(&self) -> AttachmentId {
        self.id
    }

    pub fn email_id(&self) -> EmailId {
        self.email_id
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn size_bytes(&self) -> i64 {
        self.size_bytes
    }

    pub fn object_key(&self) -> &str {
        &self.object_key
    }

    pub fn status(&self) -> AttachmentStatus {
        self.status
    }

    pub fn sha256_hex(&self) -> String {
        hex_encode(&self.sha256)
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        write!(out, "{byte:02x}").expect("writing to a String never fails");
    }
    out
}

pub struct NewAttachment<'a> {
    pub email_id: EmailId,
    pub filename: &'a str,
    pub content_type: &'a str,
    pub size_bytes: i64,
    pub object_key: &'a str,
    pub sha256: &'a [u8],
}

#[derive(Clone)]
pub struct AttachmentRepository {
    pool: PgPool,
}

impl AttachmentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn insert(
        &self,
        conn: &mut PgConnection,
        new: NewAttachment<'_>,
    ) -> Result<Attachment, Error> {
        let attachment: Attachment = sqlx::query_as(
            "insert into attachments
                (email_id, filename, content_type, size_bytes, object_key, sha256, status)
             values ($1, $2, $3, $4, $5, $6, 'pending')
             returning id, email_id, filename, content_type, size_bytes, object_key,
                       storage_url, sha256, status",
        )
        .bind(*new.email_id)
        .bind(new.filename)
        .bind(new.content_type)
        .bind(new.size_bytes)
        .bind(new.object_key)
        .bind(new.sha256)
        .fetch_one(&mut *conn)
        .await?;

        Ok(attachment)
    }

    pub async fn mark_active(&self, id: AttachmentId, storage_url: &str) -> Result<(), Error> {
        sqlx::query("update attachments set status = 'active', storage_url = $2 where id = $1")
            .bind(*id)
            .bind(storage_url)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn mark_failed(&self, id: AttachmentId) -> Result<(), Error> {
        sqlx::query("update attachments set status = 'failed' where id = $1")
            .bind(*id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn find_by_id(&self, id: AttachmentId) -> Result<Option<Attachment>, Error> {
        let attachment: Option<Attachment> = sqlx::query_as(
            "select id, email_id, filename, content_type, size_bytes, object_key,
                    storage_url, sha256, status
             from attachments where id = $1",
        )
        .bind(*id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(attachment)
    }

    pub async fn list_for_email(&self, email_id: EmailId) -> Result<Vec<Attachment>, Error> {
        let attachments: Vec<Attachment> = sqlx::query_as(
            "select id, email_id, filename, content_type, size_bytes, object_key,
                    storage_url, sha256, status
             from attachments where email_id = $1",
        )
        .bind(*email_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(attachments)
    }

    /// Total stored size for an email, used to enforce the whole-message
    /// attachment budget as attachments stream in one by one.
    pub async fn total_size_for_email(&self, email_id: EmailId) -> Result<i64, Error> {
        let (total,): (Option<i64>,) =
            sqlx::query_as("select sum(size_bytes) from attachments where email_id = $1")
                .bind(*email_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(total.unwrap_or(0))
    }

    pub async fn object_keys_for_email(&self, email_id: EmailId) -> Result<Vec<String>, Error> {
        let rows: Vec<(String,)> =
            sqlx::query_as("select object_key from attachments where email_id = $1")
                .bind(*email_id)
                .fetch_all(&self.pool)
                .await?;

        Ok(rows.into_iter().map(|(key,)| key).collect())
    }

    pub async fn object_keys_for_emails(&self, email_ids: &[EmailId]) -> Result<Vec<String>, Error> {
        let ids: Vec<uuid::Uuid> = email_ids.iter().map(|id| **id).collect();
        let rows: Vec<(String,)> =
            sqlx::query_as("select object_key from attachments where email_id = any($1)")
                .bind(ids)
                .fetch_all(&self.pool)
                .await?;

        Ok(rows.into_iter().map(|(key,)| key).collect())
    }

    pub async fn delete_for_email(&self, conn: &mut PgConnection, email_id: EmailId) -> Result<u64, Error> {
        let result = sqlx::query("delete from attachments where email_id = $1")
            .bind(*email_id)
            .execute(&mut *conn)
            .await?;

        Ok(result.rows_affected())
    }
}
