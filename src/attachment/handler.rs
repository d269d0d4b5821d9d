use std::{sync::Arc, time::Duration};

use aws_lc_rs::digest::{SHA256, digest};
use rand::Rng;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::error;
use uuid::Uuid;

use crate::{
    mime::ParsedAttachment,
    models::{Attachment, AttachmentRepository, EmailId, Error as ModelError, NewAttachment},
    object_store::{ObjectStore, ObjectStoreError},
};

pub const MAX_ATTACHMENT_SIZE: usize = 10 * 1024 * 1024;
pub const MAX_TOTAL_SIZE: usize = 25 * 1024 * 1024;

const DANGEROUS_EXTENSIONS: &[&str] = &[
    "exe", "bat", "cmd", "vbs", "js", "jar", "msi", "scr", "pif", "com",
];

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_millis(2000);
const MAX_UPLOAD_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("total attachment size for this email exceeds the 25 MiB limit")]
    TotalTooLarge,
    #[error(transparent)]
    Model(#[from] ModelError),
}

#[derive(Debug)]
pub enum AttachmentOutcome {
    Stored(Attachment),
    Rejected { filename: String, reason: String },
    UploadFailed { filename: String },
}

#[derive(Clone)]
pub struct AttachmentHandler {
    object_store: Arc<dyn ObjectStore>,
    repository: AttachmentRepository,
}

impl AttachmentHandler {
    pub fn new(object_store: Arc<dyn ObjectStore>, repository: AttachmentRepository) -> Self {
        Self {
            object_store,
            repository,
        }
    }

    /// Validates and uploads every part of one email's attachment batch.
    /// A whole-batch size overflow rejects everything up front; beyond
    /// that, each part is validated and uploaded independently so one bad
    /// attachment never blocks the others. Each part's metadata row is
    /// inserted through its own short-lived pooled connection, released
    /// before the (potentially slow, retrying) object-store upload starts,
    /// so a sluggish store never pins a database connection.
    pub async fn process_batch(
        &self,
        email_id: EmailId,
        parts: Vec<ParsedAttachment>,
        cancel: &CancellationToken,
    ) -> Result<Vec<AttachmentOutcome>, AttachmentError> {
        let total_size: usize = parts.iter().map(|p| p.bytes.len()).sum();
        if total_size > MAX_TOTAL_SIZE {
            return Err(AttachmentError::TotalTooLarge);
        }

        let mut outcomes = Vec::with_capacity(parts.len());
        for part in parts {
            outcomes.push(self.process_one(email_id, part, cancel).await?);
        }

        Ok(outcomes)
    }

    async fn process_one(
        &self,
        email_id: EmailId,
        part: ParsedAttachment,
        cancel: &CancellationToken,
    ) -> Result<AttachmentOutcome, AttachmentError> {
        let sanitized = sanitize_filename(&part.filename);

        if let Err(reason) = validate(&sanitized, &part.content_type, &part.bytes) {
            return Ok(AttachmentOutcome::Rejected {
                filename: sanitized,
                reason,
            });
        }

        let checksum = digest(&SHA256, &part.bytes);
        let object_key = format!("attachments/{email_id}/{}_{sanitized}", Uuid::new_v4());

        let attachment = {
            let mut conn = self.repository.pool().acquire().await.map_err(ModelError::from)?;
            self.repository
                .insert(
                    &mut conn,
                    NewAttachment {
                        email_id,
                        filename: &sanitized,
                        content_type: &part.content_type,
                        size_bytes: part.bytes.len() as i64,
                        object_key: &object_key,
                        sha256: checksum.as_ref(),
                    },
                )
                .await?
        };

        match self.upload_with_backoff(&object_key, &part.bytes, &part.content_type, cancel).await {
            Ok(()) => {
                let url = self.object_store.presign(&object_key, Duration::from_secs(3600)).await.ok();
                self.repository
                    .mark_active(attachment.id(), url.as_deref().unwrap_or(&object_key))
                    .await?;
                Ok(AttachmentOutcome::Stored(attachment))
            }
            Err(_) => {
                self.repository.mark_failed(attachment.id()).await?;
                error!(
                    filename = sanitized,
                    object_key,
                    critical = true,
                    "attachment upload failed permanently"
                );
                Ok(AttachmentOutcome::UploadFailed { filename: sanitized })
            }
        }
    }

    async fn upload_with_backoff(
        &self,
        key: &str,
        bytes: &[u8],
        content_type: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ObjectStoreError> {
        let mut delay = INITIAL_BACKOFF;
        let mut last_err = None;

        for attempt in 1..=MAX_UPLOAD_ATTEMPTS {
            if cancel.is_cancelled() {
                return Err(ObjectStoreError::Put("upload cancelled".to_string()));
            }

            match self.object_store.put(key, bytes, content_type).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    last_err = Some(err);
                    if attempt == MAX_UPLOAD_ATTEMPTS {
                        break;
                    }

                    let jitter = Duration::from_millis(rand::rng().random_range(0..=(delay.as_millis() as u64 / 4).max(1)));
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(ObjectStoreError::Put("upload cancelled".to_string())),
                        _ = tokio::time::sleep(delay + jitter) => {}
                    }

                    delay = (delay * 2).min(MAX_BACKOFF);
                }
            }
        }

        Err(last_err.expect("loop always attempts at least once"))
    }
}

/// Strips path separators and NUL bytes, takes the base name, and caps the
/// result at 255 bytes while preserving the extension.
fn sanitize_filename(filename: &str) -> String {
    let cleaned: String = filename
        .chars()
        .filter(|c| *c != '\0')
        .collect::<String>()
        .replace("..", "")
        .replace(['/', '\\'], "");

    let base = cleaned.rsplit(['/', '\\']).next().unwrap_or(&cleaned);
    let base = if base.is_empty() { "attachment" } else { base };

    if base.len() <= 255 {
        return base.to_string();
    }

    match base.rsplit_once('.') {
        Some((stem, ext)) if ext.len() < 255 => {
            let keep = floor_char_boundary(stem, (255 - ext.len() - 1).min(stem.len()));
            format!("{}.{}", &stem[..keep], ext)
        }
        _ => base[..floor_char_boundary(base, 255)].to_string(),
    }
}

/// The largest byte index `<= index` that lands on a UTF-8 character
/// boundary, so truncating an attacker-controlled filename by byte count
/// never panics on a multi-byte codepoint.
fn floor_char_boundary(s: &str, index: usize) -> usize {
    (0..=index).rev().find(|&i| s.is_char_boundary(i)).unwrap_or(0)
}

fn validate(filename: &str, content_type: &str, bytes: &[u8]) -> Result<(), String> {
    if bytes.len() > MAX_ATTACHMENT_SIZE {
        return Err("attachment exceeds the 10 MiB individual size limit".to_string());
    }

    let extension = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    if DANGEROUS_EXTENSIONS.contains(&extension.as_str()) {
        return Err(format!("extension .{extension} is not allowed"));
    }

    if !content_type_compatible(&extension, content_type) {
        return Err(format!(
            "content-type {content_type} is not compatible with extension .{extension}"
        ));
    }

    if let Some(signature) = detect_executable_signature(bytes) {
        return Err(format!("disguised executable detected ({signature})"));
    }

    Ok(())
}

fn content_type_compatible(extension: &str, content_type: &str) -> bool {
    if content_type.eq_ignore_ascii_case("application/octet-stream") || extension.is_empty() {
        return true;
    }

    let expected: &[&str] = match extension {
        "pdf" => &["application/pdf"],
        "png" => &["image/png"],
        "jpg" | "jpeg" => &["image/jpeg"],
        "gif" => &["image/gif"],
        "txt" => &["text/plain"],
        "csv" => &["text/csv", "application/vnd.ms-excel"],
        "zip" => &["application/zip", "application/x-zip-compressed"],
        "doc" => &["application/msword"],
        "docx" => &["application/vnd.openxmlformats-officedocument.wordprocessingml.document"],
        _ => return true,
    };

    expected.iter().any(|mime| content_type.eq_ignore_ascii_case(mime))
}

/// Recognizes PE, ELF, Mach-O (both byte orders), Java class, and Windows
/// script file magic bytes regardless of the extension they arrived with.
fn detect_executable_signature(bytes: &[u8]) -> Option<&'static str> {
    const MACHO_MAGICS: [[u8; 4]; 4] = [
        [0xCA, 0xFE, 0xBA, 0xBE],
        [0xFE, 0xED, 0xFA, 0xCE],
        [0xFE, 0xED, 0xFA, 0xCF],
        [0xCF, 0xFA, 0xED, 0xFE],
    ];

    if bytes.starts_with(b"MZ") {
        return Some("PE executable");
    }
    if bytes.starts_with(&[0x7F, 0x45, 0x4C, 0x46]) {
        return Some("ELF executable");
    }
    if bytes.len() >= 4 && MACHO_MAGICS.contains(&bytes[0..4].try_into().unwrap()) {
        return Some("Mach-O executable");
    }
    if bytes.starts_with(b"<job") {
        return Some("Windows script host job file");
    }

    None
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::object_store::mock::MockObjectStore;

    #[test]
    fn sanitizes_path_traversal_attempts() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "etcpasswd");
        assert_eq!(sanitize_filename("a/b\\c.txt"), "c.txt");
    }

    #[test]
    fn truncates_multibyte_filenames_without_panicking() {
        let stem: String = "€".repeat(200);
        let filename = format!("{stem}.txt");

        let sanitized = sanitize_filename(&filename);

        assert!(sanitized.len() <= 255);
        assert!(sanitized.ends_with(".txt"));
    }

    #[test]
    fn rejects_dangerous_extensions() {
        let err = validate("payload.exe", "application/octet-stream", b"MZ\x90\x00").unwrap_err();
        assert!(err.contains("not allowed"));
    }

    #[test]
    fn rejects_disguised_executable() {
        let err = validate("notes.txt", "text/plain", &[0x7F, 0x45, 0x4C, 0x46, 0, 0]).unwrap_err();
        assert!(err.contains("disguised executable"));
    }

    #[test]
    fn accepts_matching_content_type() {
        assert!(validate("doc.pdf", "application/pdf", b"%PDF-1.4").is_ok());
    }

    #[test]
    fn rejects_mismatched_content_type() {
        let err = validate("doc.pdf", "image/png", b"%PDF-1.4").unwrap_err();
        assert!(err.contains("not compatible"));
    }

    #[sqlx::test]
    async fn batch_over_total_budget_is_rejected(pool: sqlx::PgPool) {
        let email_id = setup_email(&pool).await;
        let handler = AttachmentHandler::new(
            Arc::new(MockObjectStore::new()),
            AttachmentRepository::new(pool.clone()),
        );

        let oversized = vec![ParsedAttachment {
            filename: "big.bin".to_string(),
            content_type: "application/octet-stream".to_string(),
            bytes: vec![0u8; MAX_TOTAL_SIZE + 1],
        }];

        let result = handler
            .process_batch(email_id, oversized, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(AttachmentError::TotalTooLarge)));
    }

    #[sqlx::test]
    async fn stores_a_valid_attachment(pool: sqlx::PgPool) {
        let email_id = setup_email(&pool).await;
        let handler = AttachmentHandler::new(
            Arc::new(MockObjectStore::new()),
            AttachmentRepository::new(pool.clone()),
        );

        let parts = vec![ParsedAttachment {
            filename: "invoice.pdf".to_string(),
            content_type: "application/pdf".to_string(),
            bytes: b"%PDF-1.4 ...".to_vec(),
        }];

        let outcomes = handler
            .process_batch(email_id, parts, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0], AttachmentOutcome::Stored(_)));
    }

    async fn setup_email(pool: &sqlx::PgPool) -> EmailId {
        use crate::models::{AliasRepository, DomainRepository, EmailRepository, NewAlias, NewDomain, NewEmail, UserRepository};

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
        let alias = aliases
            .create(NewAlias {
                domain_id: domain.id(),
                local_part: "inbox",
                description: None,
            })
            .await
            .unwrap();

        let emails = EmailRepository::new(pool.clone());
        let mut conn = pool.acquire().await.unwrap();
        emails
            .insert(
                &mut conn,
                NewEmail {
                    alias_id: alias.id(),
                    from_address: "bob@remote.test",
                    from_name: None,
                    subject: None,
                    body_text: None,
                    body_html: None,
                    headers: vec![],
                    raw_bytes: b"raw",
                    received_at: chrono::Utc::now(),
                },
            )
            .await
            .unwrap()
            .id()
    }
}
