use std::{env, net::SocketAddr, time::Duration};

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub listen_addr: SocketAddr,
    pub hostname: String,
    pub max_connections: usize,
    pub max_per_ip: usize,
    pub connection_timeout: Duration,
    pub max_message_size: usize,
    pub max_recipients: usize,
    pub rate_limit_per_minute: u32,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
}

impl SmtpConfig {
    pub fn from_env() -> Self {
        let port: u16 = env_or("SMTP_PORT", 25);
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], port)),
            hostname: env_string("SMTP_HOSTNAME", "localhost"),
            max_connections: env_or("SMTP_MAX_CONNECTIONS", 100),
            max_per_ip: env_or("SMTP_MAX_PER_IP", 5),
            connection_timeout: Duration::from_secs(env_or("SMTP_CONNECTION_TIMEOUT_SECS", 300)),
            max_message_size: env_or("SMTP_MAX_MESSAGE_SIZE", 25 * 1024 * 1024),
            max_recipients: env_or("SMTP_MAX_RECIPIENTS", 100),
            rate_limit_per_minute: env_or("SMTP_RATE_LIMIT_PER_MINUTE", 20),
            cert_file: env::var("SMTP_CERT_FILE").ok(),
            key_file: env::var("SMTP_KEY_FILE").ok(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SseConfig {
    pub heartbeat_interval: Duration,
    pub connection_timeout: Duration,
    pub max_connections_per_user: usize,
    pub event_buffer_size: usize,
}

impl SseConfig {
    pub fn from_env() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(env_or("SSE_HEARTBEAT_INTERVAL_SECS", 30)),
            connection_timeout: Duration::from_secs(env_or("SSE_CONNECTION_TIMEOUT_SECS", 3600)),
            max_connections_per_user: env_or("SSE_MAX_CONNECTIONS_PER_USER", 10),
            event_buffer_size: env_or("SSE_EVENT_BUFFER_SIZE", 100),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DomainConfig {
    pub limit_per_user: i64,
    pub txt_prefix: String,
    pub dns_timeout: Duration,
    pub mail_server: String,
}

impl DomainConfig {
    pub fn from_env() -> Self {
        Self {
            limit_per_user: env_or("DOMAIN_LIMIT_PER_USER", 5),
            txt_prefix: env_string("DOMAIN_TXT_PREFIX", "_tempmail-verification"),
            dns_timeout: Duration::from_secs(env_or("DOMAIN_DNS_TIMEOUT_SECS", 5)),
            mail_server: env_string("DOMAIN_MAIL_SERVER", "mail.localhost"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AttachmentConfig {
    pub max_individual_size: usize,
    pub max_total_size: usize,
    pub upload_max_retries: u32,
    pub upload_initial_delay: Duration,
    pub upload_max_delay: Duration,
    pub upload_backoff_multiplier: u32,
}

impl AttachmentConfig {
    pub fn from_env() -> Self {
        Self {
            max_individual_size: env_or("ATTACHMENT_MAX_INDIVIDUAL_SIZE", 10 * 1024 * 1024),
            max_total_size: env_or("ATTACHMENT_MAX_TOTAL_SIZE", 25 * 1024 * 1024),
            upload_max_retries: env_or("ATTACHMENT_UPLOAD_MAX_RETRIES", 3),
            upload_initial_delay: Duration::from_millis(env_or("ATTACHMENT_UPLOAD_INITIAL_DELAY_MS", 100)),
            upload_max_delay: Duration::from_millis(env_or("ATTACHMENT_UPLOAD_MAX_DELAY_MS", 2000)),
            upload_backoff_multiplier: env_or("ATTACHMENT_UPLOAD_BACKOFF_MULTIPLIER", 2),
        }
    }
}

/// Top-level configuration assembled once at binary startup, mirroring the
/// teacher's `HandlerConfig`/`SmtpConfig` construction out of `env::var`.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub smtp: SmtpConfig,
    pub sse: SseConfig,
    pub domain: DomainConfig,
    pub attachment: AttachmentConfig,
    pub s3_bucket: String,
    pub jwt_secret: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: env::var("DATABASE_URL").expect("DATABASE_URL must be set"),
            smtp: SmtpConfig::from_env(),
            sse: SseConfig::from_env(),
            domain: DomainConfig::from_env(),
            attachment: AttachmentConfig::from_env(),
            s3_bucket: env_string("S3_BUCKET", "tempmail-attachments"),
            jwt_secret: env::var("JWT_SECRET").expect("JWT_SECRET must be set"),
        }
    }
}
