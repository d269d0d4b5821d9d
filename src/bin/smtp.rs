use std::{sync::Arc, time::Duration};

use sqlx::postgres::PgPoolOptions;
use tempmail_core::{
    EmailProcessor, SmtpServer,
    attachment::AttachmentHandler,
    config::AppConfig,
    domain::{DnsProbe, DomainService, SslProvider},
    events::{EventBus, EventStore},
    init_tracing,
    models::{AliasDirectory, AliasRepository, AttachmentRepository, DomainRepository},
    object_store::{ObjectStore, S3ObjectStore},
    periodic::run_periodically,
    shutdown_signal,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

const DOMAIN_VERIFICATION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() {
    init_tracing();

    let config = AppConfig::from_env();
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&config.database_url)
        .await
        .expect("failed to connect to database");

    let directory = AliasDirectory::new(AliasRepository::new(pool.clone()));
    let object_store: Arc<dyn ObjectStore> = Arc::new(S3ObjectStore::from_env(config.s3_bucket.clone()).await);
    let attachments = AttachmentHandler::new(object_store.clone(), AttachmentRepository::new(pool.clone()));
    let events = EventBus::new(EventStore::with_capacity(config.sse.event_buffer_size));
    let processor = Arc::new(EmailProcessor::new(pool.clone(), directory, attachments, events.clone()));
    let ssl = SslProvider::new(DomainRepository::new(pool.clone()));

    let shutdown = CancellationToken::new();
    let server = SmtpServer::new(config.smtp.clone(), processor, ssl.clone(), None, shutdown.clone());

    info!(addr = %config.smtp.listen_addr, "starting SMTP server");
    server.spawn();

    let dns_probe = DnsProbe::new().with_deadline(config.domain.dns_timeout);
    let domain_service = Arc::new(DomainService::new(pool, dns_probe, ssl, events, object_store, config.domain.mail_server.clone()));

    info!(interval = ?DOMAIN_VERIFICATION_SWEEP_INTERVAL, "starting domain verification sweep");
    run_periodically(
        move || {
            let domain_service = domain_service.clone();
            async move { domain_service.reverify_pending().await }
        },
        DOMAIN_VERIFICATION_SWEEP_INTERVAL,
        shutdown.clone(),
    );

    shutdown_signal(shutdown.clone()).await;
    shutdown.cancel();
}
