pub mod address;
mod connection;
pub mod rate_limit;
pub mod server;
mod session;
pub mod tls_resolver;

pub use server::SmtpServer;

#[cfg(test)]
mod test {
    use crate::{
        attachment::AttachmentHandler,
        config::SmtpConfig,
        domain::SslProvider,
        email_processor::EmailProcessor,
        events::{EventBus, EventStore},
        models::{AliasDirectory, AliasRepository, AttachmentRepository, DomainRepository, NewAlias, NewDomain, UserRepository},
        object_store::mock::MockObjectStore,
        smtp::server::SmtpServer,
    };
    use sqlx::PgPool;
    use std::{net::SocketAddr, sync::Arc};
    use tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
        net::TcpStream,
    };
    use tokio_rustls::rustls::crypto;
    use tokio_util::sync::CancellationToken;

    async fn setup(pool: PgPool) -> (CancellationToken, u16, crate::models::AliasId) {
        setup_with(pool, |_| {}).await
    }

    async fn setup_with(
        pool: PgPool,
        tweak_config: impl FnOnce(&mut SmtpConfig),
    ) -> (CancellationToken, u16, crate::models::AliasId) {
        if crypto::CryptoProvider::get_default().is_none() {
            crypto::aws_lc_rs::default_provider()
                .install_default()
                .expect("failed to install crypto provider");
        }

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
            AttachmentRepository::new(pool.clone()),
        );
        let events = EventBus::new(EventStore::new());
        let processor = Arc::new(EmailProcessor::new(pool.clone(), directory, attachments, events));

        let ssl = SslProvider::new(domains);

        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let mut config = SmtpConfig::from_env();
        config.listen_addr = SocketAddr::from(([127, 0, 0, 1], port));
        config.hostname = "localhost".to_string();
        tweak_config(&mut config);

        let shutdown = CancellationToken::new();
        let server = SmtpServer::new(config, processor, ssl, None, shutdown.clone());

        tokio::spawn(async move {
            server.serve().await.unwrap();
        });

        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

        (shutdown, port, alias.id())
    }

    /// Drives the full accept loop over a real TCP socket: no certificate
    /// is configured, so the session never upgrades past plaintext, which
    /// is the path a catch-all MX receiver hits for the overwhelming
    /// majority of inbound connections.
    #[sqlx::test]
    async fn accepts_plaintext_mail_for_a_known_alias(pool: PgPool) {
        let (shutdown, port, _alias_id) = setup(pool).await;

        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut client = BufReader::new(stream);

        let mut line = String::new();
        client.read_line(&mut line).await.unwrap();
        assert!(line.starts_with("220"));

        client.write_all(b"EHLO sender.test\r\n").await.unwrap();
        loop {
            line.clear();
            client.read_line(&mut line).await.unwrap();
            if line.as_bytes().get(3) == Some(&b' ') {
                break;
            }
        }

        client.write_all(b"MAIL FROM:<sender@remote.test>\r\n").await.unwrap();
        line.clear();
        client.read_line(&mut line).await.unwrap();
        assert!(line.starts_with("250"));

        client.write_all(b"RCPT TO:<inbox@custom.test>\r\n").await.unwrap();
        line.clear();
        client.read_line(&mut line).await.unwrap();
        assert!(line.starts_with("250"));

        client.write_all(b"DATA\r\n").await.unwrap();
        line.clear();
        client.read_line(&mut line).await.unwrap();
        assert!(line.starts_with("354"));

        client
            .write_all(b"Subject: Hi!\r\nFrom: Sender <sender@remote.test>\r\n\r\nHello world!\r\n.\r\n")
            .await
            .unwrap();
        line.clear();
        client.read_line(&mut line).await.unwrap();
        assert!(line.starts_with("250"));

        client.write_all(b"QUIT\r\n").await.unwrap();
        line.clear();
        client.read_line(&mut line).await.unwrap();
        assert!(line.starts_with("221"));

        shutdown.cancel();
    }

    /// With the global connection cap set to zero, every accepted socket
    /// must be rejected with a 421 before anything else is read from it.
    #[sqlx::test]
    async fn connections_over_the_global_cap_are_rejected_with_421(pool: PgPool) {
        let (shutdown, port, _alias_id) = setup_with(pool, |config| config.max_connections = 0).await;

        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut client = BufReader::new(stream);

        let mut line = String::new();
        client.read_line(&mut line).await.unwrap();
        assert!(line.starts_with("421"), "expected 421, got: {line}");

        shutdown.cancel();
    }
}
