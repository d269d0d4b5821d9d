use std::{io, sync::Arc, time::Duration};

use rand::random_range;
use thiserror::Error;
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    select,
    sync::RwLock,
};
use tokio_rustls::rustls::{self, sign::CertifiedKey};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::{
    config::SmtpConfig,
    domain::SslProvider,
    email_processor::EmailProcessor,
    smtp::{
        connection,
        rate_limit::{CapError, ConnectionCaps, RateLimiter},
        session::SmtpSession,
        tls_resolver::{TlsResolver, build_server_config},
    },
};

/// Writes a single reply line and drops the socket. Used for caps/rate-limit
/// rejections, which happen before an `SmtpSession` exists to reply through.
async fn reject(mut stream: TcpStream, line: &str) {
    let _ = stream.write_all(format!("{line}\r\n").as_bytes()).await;
}

#[derive(Debug, Error)]
pub enum SmtpServerError {
    #[error("failed to listen on address: {0}")]
    Listen(io::Error),
    #[error("failed to configure TLS: {0}")]
    Tls(rustls::Error),
}

pub struct SmtpServer {
    config: SmtpConfig,
    processor: Arc<EmailProcessor>,
    ssl: SslProvider,
    fallback_cert: Option<Arc<CertifiedKey>>,
    shutdown: CancellationToken,
}

impl SmtpServer {
    pub fn new(
        config: SmtpConfig,
        processor: Arc<EmailProcessor>,
        ssl: SslProvider,
        fallback_cert: Option<Arc<CertifiedKey>>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            processor,
            ssl,
            fallback_cert,
            shutdown,
        }
    }

    fn build_tls_config(&self) -> Result<Arc<rustls::ServerConfig>, SmtpServerError> {
        let resolver = Arc::new(TlsResolver::new(self.ssl.clone(), self.fallback_cert.clone()));
        build_server_config(resolver).map_err(SmtpServerError::Tls)
    }

    pub async fn serve(self) -> Result<(), SmtpServerError> {
        let listener = TcpListener::bind(self.config.listen_addr).await.map_err(SmtpServerError::Listen)?;

        let tls_config = Arc::new(RwLock::new(self.build_tls_config()?));

        info!(addr = %self.config.listen_addr, "smtp server listening");

        let reload_interval = Duration::from_secs(60 * 60 * 23 + random_range(0..(60 * 60)));
        debug!(?reload_interval, "scheduling automatic TLS certificate reload");

        let rate_limiter = Arc::new(RateLimiter::new(
            self.config.rate_limit_per_minute,
            Duration::from_secs(60),
        ));
        let caps = ConnectionCaps::new(self.config.max_connections, self.config.max_per_ip);

        {
            let ssl = self.ssl.clone();
            let fallback_cert = self.fallback_cert.clone();
            let tls_config = tls_config.clone();
            let shutdown = self.shutdown.clone();

            tokio::spawn(async move {
                let mut interval = tokio::time::interval(reload_interval);
                interval.tick().await;
                loop {
                    select! {
                        _ = shutdown.cancelled() => return,
                        _ = interval.tick() => {}
                    }

                    let resolver = Arc::new(TlsResolver::new(ssl.clone(), fallback_cert.clone()));
                    match build_server_config(resolver) {
                        Ok(config) => {
                            *tls_config.write().await = config;
                            info!("reloaded smtp TLS configuration");
                        }
                        Err(err) => error!(error = %err, "failed to reload smtp TLS configuration"),
                    }
                }
            });
        }

        loop {
            select! {
                _ = self.shutdown.cancelled() => {
                    info!("shutting down smtp server");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            error!(error = %err, "failed to accept connection");
                            continue;
                        }
                    };

                    if !rate_limiter.check(peer_addr.ip()) {
                        trace!(peer = %peer_addr, "connection rejected by rate limiter");
                        reject(stream, "421 Too many connections from your IP").await;
                        continue;
                    }

                    let guard = match caps.try_acquire(peer_addr.ip()) {
                        Ok(guard) => guard,
                        Err(CapError::Global) => {
                            trace!(peer = %peer_addr, "connection rejected: global connection cap reached");
                            reject(stream, "421 Too many connections").await;
                            continue;
                        }
                        Err(CapError::PerIp) => {
                            trace!(peer = %peer_addr, "connection rejected: per-IP connection cap reached");
                            reject(stream, "421 Too many connections").await;
                            continue;
                        }
                    };

                    let session = SmtpSession::new(
                        peer_addr,
                        self.config.hostname.clone(),
                        self.config.max_message_size,
                        self.config.max_recipients,
                        true,
                        self.processor.directory(),
                        self.processor.clone(),
                        self.shutdown.child_token(),
                    );

                    let connection_timeout = self.config.connection_timeout;
                    let tls_config = tls_config.read().await.clone();

                    tokio::spawn(async move {
                        let _guard = guard;

                        let result = tokio::time::timeout(
                            connection_timeout,
                            connection::handle(stream, session, Some(tls_config)),
                        )
                        .await;

                        match result {
                            Ok(Ok(())) => {}
                            Ok(Err(err)) => trace!(peer = %peer_addr, error = %err, "connection ended with an error"),
                            Err(_) => trace!(peer = %peer_addr, "connection timed out"),
                        }
                    });
                }
            }
        }
    }

    pub fn spawn(self) {
        tokio::spawn(async move {
            if let Err(err) = self.serve().await {
                error!(error = %err, "smtp server error");
            }
        });
    }
}
