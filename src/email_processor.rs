use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{
    attachment::{AttachmentError, AttachmentHandler, AttachmentOutcome},
    events::{EventBus, EventType},
    mime::{self, ParsedEmail},
    models::{AliasDirectory, AliasLookup, Error, EmailRepository, NewEmail},
};

/// What the SMTP session hands off once a `DATA` transaction completes.
pub struct DataResult {
    pub bytes: Vec<u8>,
    pub queue_id: String,
    pub received_at: DateTime<Utc>,
    pub recipients: Vec<String>,
    pub mail_from: String,
}

#[derive(Clone)]
pub struct EmailProcessor {
    pool: PgPool,
    directory: AliasDirectory,
    emails: EmailRepository,
    attachments: AttachmentHandler,
    events: EventBus,
}

impl EmailProcessor {
    pub fn new(
        pool: PgPool,
        directory: AliasDirectory,
        attachments: AttachmentHandler,
        events: EventBus,
    ) -> Self {
        Self {
            emails: EmailRepository::new(pool.clone()),
            pool,
            directory,
            attachments,
            events,
        }
    }

    /// The directory this processor re-checks aliases against at delivery
    /// time; the SMTP session holds a clone of the same directory to
    /// validate RCPT TO eagerly.
    pub fn directory(&self) -> AliasDirectory {
        self.directory.clone()
    }

    /// Parses the message once and fans it out to every recipient
    /// independently: a failed lookup or a store error for one recipient
    /// never prevents the others from being delivered. An error returned
    /// here surfaces to the SMTP session as a temporary (451) failure.
    pub async fn process(&self, data: DataResult, cancel: &CancellationToken) -> Result<(), Error> {
        let parsed = mime::parse(&data.bytes);

        for recipient in &data.recipients {
            let address = recipient.to_ascii_lowercase();

            let lookup = match self.directory.lookup(&address).await {
                Ok(Some(lookup)) if lookup.active => lookup,
                Ok(Some(_)) => {
                    debug!(%address, "alias inactive at delivery time, skipping recipient");
                    continue;
                }
                Ok(None) => {
                    debug!(%address, "alias not found at delivery time, skipping recipient");
                    continue;
                }
                Err(err) => {
                    error!(%address, error = %err, "alias lookup failed, skipping recipient");
                    continue;
                }
            };

            self.deliver_to(lookup, &parsed, &data, cancel).await?;
        }

        Ok(())
    }

    /// The email row commits in its own short transaction before any
    /// attachment is touched, so the slow, retrying object-store uploads
    /// `process_batch` runs never hold a pooled connection open.
    async fn deliver_to(
        &self,
        lookup: AliasLookup,
        parsed: &ParsedEmail,
        data: &DataResult,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;
        let email = self
            .emails
            .insert(
                &mut tx,
                NewEmail {
                    alias_id: lookup.alias_id,
                    from_address: &data.mail_from,
                    from_name: parsed.sender_name.as_deref(),
                    subject: parsed.subject.as_deref(),
                    body_text: parsed.text_body.as_deref(),
                    body_html: parsed.html_body.as_deref(),
                    headers: parsed.headers.clone(),
                    raw_bytes: &data.bytes,
                    received_at: data.received_at,
                },
            )
            .await?;
        tx.commit().await?;

        match self
            .attachments
            .process_batch(email.id(), parsed.attachments.clone(), cancel)
            .await
        {
            Ok(outcomes) => {
                for outcome in &outcomes {
                    if let AttachmentOutcome::UploadFailed { filename } = outcome {
                        warn!(%filename, queue_id = %data.queue_id, "attachment upload failed permanently, email kept");
                    }
                }
            }
            Err(AttachmentError::TotalTooLarge) => {
                warn!(
                    queue_id = %data.queue_id,
                    "attachment batch exceeded the total size budget, email stored without attachments"
                );
            }
            Err(AttachmentError::Model(err)) => return Err(err),
        }

        self.publish_new_email(lookup, &email);

        Ok(())
    }

    /// Publish errors are advisory: the event ring is best-effort, so a
    /// failure here never rolls back the already-committed email.
    fn publish_new_email(&self, lookup: AliasLookup, email: &crate::models::Email) {
        self.events.publish(
            EventType::NewEmail,
            lookup.user_id,
            json!({
                "email_id": email.id(),
                "alias_id": lookup.alias_id,
            }),
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        events::EventStore,
        models::{AliasRepository, DomainRepository, NewAlias, NewDomain, UserRepository},
        object_store::mock::MockObjectStore,
    };
    use std::sync::Arc;

    async fn processor(pool: PgPool) -> (EmailProcessor, crate::models::AliasId) {
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

        let directory = AliasDirectory::new(aliases);
        let attachments = AttachmentHandler::new(
            Arc::new(MockObjectStore::new()),
            crate::models::AttachmentRepository::new(pool.clone()),
        );
        let events = EventBus::new(EventStore::new());

        (EmailProcessor::new(pool, directory, attachments, events), alias.id())
    }

    #[sqlx::test]
    async fn unknown_recipient_is_skipped_without_error(pool: PgPool) {
        let (processor, _alias_id) = processor(pool).await;

        let data = DataResult {
            bytes: b"Subject: hi\r\n\r\nbody".to_vec(),
            queue_id: "deadbeef".to_string(),
            received_at: Utc::now(),
            recipients: vec!["nobody@custom.test".to_string()],
            mail_from: "sender@remote.test".to_string(),
        };

        processor.process(data, &CancellationToken::new()).await.unwrap();
    }

    /// The email row is committed on its own before attachments are
    /// processed, so a permanently failing upload marks the attachment
    /// failed without losing the email itself.
    #[sqlx::test]
    async fn email_is_kept_when_attachment_upload_fails(pool: PgPool) {
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

        let directory = AliasDirectory::new(aliases);
        let store = Arc::new(MockObjectStore::new());
        store.fail_put.store(true, std::sync::atomic::Ordering::SeqCst);
        let attachments = AttachmentHandler::new(store, crate::models::AttachmentRepository::new(pool.clone()));
        let events = EventBus::new(EventStore::new());
        let processor = EmailProcessor::new(pool, directory, attachments, events);

        let bytes = b"Subject: hi\r\nFrom: sender@remote.test\r\nContent-Type: multipart/mixed; boundary=b\r\n\r\n--b\r\nContent-Type: text/plain\r\n\r\nbody\r\n--b\r\nContent-Type: application/octet-stream\r\nContent-Disposition: attachment; filename=\"payload.bin\"\r\n\r\nattachment-bytes\r\n--b--\r\n".to_vec();
        let data = DataResult {
            bytes,
            queue_id: "deadbeef".to_string(),
            received_at: Utc::now(),
            recipients: vec!["inbox@custom.test".to_string()],
            mail_from: "sender@remote.test".to_string(),
        };

        processor.process(data, &CancellationToken::new()).await.unwrap();

        let emails = EmailRepository::new(processor.pool.clone())
            .list_for_alias(alias.id())
            .await
            .unwrap();
        assert_eq!(emails.len(), 1, "email row must survive a failed attachment upload");
    }

    #[sqlx::test]
    async fn known_recipient_stores_the_email(pool: PgPool) {
        let (processor, alias_id) = processor(pool).await;

        let data = DataResult {
            bytes: b"Subject: hi\r\nFrom: sender@remote.test\r\n\r\nbody text".to_vec(),
            queue_id: "deadbeef".to_string(),
            received_at: Utc::now(),
            recipients: vec!["inbox@custom.test".to_string()],
            mail_from: "sender@remote.test".to_string(),
        };

        processor.process(data, &CancellationToken::new()).await.unwrap();

        let emails = EmailRepository::new(processor.pool.clone())
            .list_for_alias(alias_id)
            .await
            .unwrap();
        assert_eq!(emails.len(), 1);
        assert_eq!(emails[0].alias_id(), alias_id);
    }
}
