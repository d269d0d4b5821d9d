use std::{
    net::SocketAddr,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use chrono::Utc;
use smtp_proto::Request;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::{
    email_processor::{DataResult, EmailProcessor},
    models::AliasDirectory,
    smtp::address::is_valid_address_shape,
};

pub enum SessionReply {
    Continue(u16, String),
    Stop(u16, String),
    Raw(Vec<u8>),
    StartTls(u16, String),
    IngestData(u16, String),
}

struct Transaction {
    mail_from: String,
    recipients: Vec<String>,
}

/// Per-connection protocol state machine: `Greeted -> EHLOed -> (MAIL FROM
/// set) -> (>=1 RCPT accepted) -> DATA received`. `RSET` reverts to
/// `EHLOed`; `STARTTLS` reverts to `Greeted` on a now-encrypted transport.
pub struct SmtpSession {
    peer_addr: SocketAddr,
    hostname: String,
    max_message_size: usize,
    max_recipients: usize,
    tls_available: bool,
    is_encrypted: bool,
    ehloed: bool,
    transaction: Option<Transaction>,
    directory: AliasDirectory,
    processor: Arc<EmailProcessor>,
    cancel: CancellationToken,
}

const RESPONSE_HELLO_FIRST: &str = "5.5.1 Be nice and say EHLO first";
const RESPONSE_MAIL_FIRST: &str = "5.5.1 Use MAIL first";
const RESPONSE_NESTED_MAIL: &str = "5.5.1 Error: nested MAIL command";
const RESPONSE_BAD_SEQUENCE: &str = "5.5.1 Bad sequence of commands";
const RESPONSE_NO_VALID_RECIPIENTS: &str = "5.5.1 No valid recipients";
const RESPONSE_INVALID_SENDER: &str = "5.1.7 This sender address is not valid";
const RESPONSE_INVALID_RECIPIENT: &str = "5.1.3 This recipient address is not valid";
const RESPONSE_TOO_MANY_RECIPIENTS: &str = "5.5.3 Too many recipients";
const RESPONSE_USER_NOT_FOUND: &str = "5.1.1 User not found";
const RESPONSE_USER_DISABLED: &str = "5.1.1 User disabled";
const RESPONSE_MESSAGE_TOO_LARGE: &str = "5.3.4 Message too large";
const RESPONSE_START_DATA: &str = "Start mail input; end with <CRLF>.<CRLF>";
const RESPONSE_NOT_IMPLEMENTED: &str = "5.5.1 Command not implemented";
const RESPONSE_NO_VRFY: &str = "5.5.1 VRFY command is disabled";
const RESPONSE_TLS_NOT_AVAILABLE: &str = "4.7.0 STARTTLS not available";
const RESPONSE_ALREADY_TLS: &str = "5.5.1 Already in TLS mode";

impl SmtpSession {
    pub fn new(
        peer_addr: SocketAddr,
        hostname: String,
        max_message_size: usize,
        max_recipients: usize,
        tls_available: bool,
        directory: AliasDirectory,
        processor: Arc<EmailProcessor>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            peer_addr,
            hostname,
            max_message_size,
            max_recipients,
            tls_available,
            is_encrypted: false,
            ehloed: false,
            transaction: None,
            directory,
            processor,
            cancel,
        }
    }

    pub fn peer(&self) -> &SocketAddr {
        &self.peer_addr
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    pub fn is_encrypted(&self) -> bool {
        self.is_encrypted
    }

    /// Called by the connection loop right after a successful STARTTLS
    /// handshake: the transport is now encrypted and the client must EHLO
    /// again before resuming a transaction.
    pub fn mark_tls_upgraded(&mut self) {
        self.is_encrypted = true;
        self.ehloed = false;
        self.transaction = None;
    }

    pub fn reset_transaction(&mut self) {
        self.transaction = None;
    }

    pub async fn handle(&mut self, request: Result<Request<String>, smtp_proto::Error>) -> SessionReply {
        let request = match request {
            Ok(r) => r,
            Err(e) => {
                debug!("failed to parse request: {e}");
                return SessionReply::Continue(500, format!("5.5.2 {e}"));
            }
        };

        trace!(peer = %self.peer_addr, ?request, "received request");

        match request {
            Request::Ehlo { host } => {
                self.ehloed = true;
                self.transaction = None;

                let mut lines = vec![self.hostname.clone(), format!("SIZE {}", self.max_message_size), "8BITMIME".to_string()];
                if self.tls_available && !self.is_encrypted {
                    lines.push("STARTTLS".to_string());
                }
                let _ = host;

                SessionReply::Raw(multiline_reply(250, &lines))
            }
            Request::Helo { host: _ } => {
                self.ehloed = true;
                self.transaction = None;
                SessionReply::Continue(250, self.hostname.clone())
            }
            Request::Lhlo { host: _ } => SessionReply::Continue(502, RESPONSE_NOT_IMPLEMENTED.into()),
            Request::StartTls => {
                if self.is_encrypted {
                    return SessionReply::Continue(503, RESPONSE_ALREADY_TLS.into());
                }
                if !self.tls_available {
                    return SessionReply::Continue(454, RESPONSE_TLS_NOT_AVAILABLE.into());
                }
                SessionReply::StartTls(220, "2.0.0 Ready to start TLS".into())
            }
            Request::Quit => SessionReply::Stop(221, "2.0.0 Goodbye".into()),
            _ignored if !self.ehloed => SessionReply::Continue(503, RESPONSE_HELLO_FIRST.into()),
            Request::Mail { from } => {
                if self.transaction.is_some() {
                    return SessionReply::Continue(503, RESPONSE_NESTED_MAIL.into());
                }

                let address = unwrap_angle_brackets(&from.address);

                if !address.is_empty() && !is_valid_address_shape(&address) {
                    return SessionReply::Continue(553, RESPONSE_INVALID_SENDER.into());
                }

                if from.size > 0 && from.size > self.max_message_size {
                    return SessionReply::Continue(552, "5.3.4 Message size exceeds maximum permitted".into());
                }

                let reply = format!("2.1.0 Originator <{}> ok", from.address);
                self.transaction = Some(Transaction {
                    mail_from: address,
                    recipients: Vec::new(),
                });

                SessionReply::Continue(250, reply)
            }
            Request::Rcpt { to } => {
                if self.transaction.is_none() {
                    return SessionReply::Continue(503, RESPONSE_MAIL_FIRST.into());
                }

                let address = unwrap_angle_brackets(&to.address);
                if !is_valid_address_shape(&address) {
                    return SessionReply::Continue(553, RESPONSE_INVALID_RECIPIENT.into());
                }

                let recipients_len = self.transaction.as_ref().map(|tx| tx.recipients.len()).unwrap_or(0);
                if recipients_len >= self.max_recipients {
                    return SessionReply::Continue(500, RESPONSE_TOO_MANY_RECIPIENTS.into());
                }

                let lower = address.to_ascii_lowercase();
                let already_present = self
                    .transaction
                    .as_ref()
                    .is_some_and(|tx| tx.recipients.iter().any(|r| r == &lower));
                if already_present {
                    return SessionReply::Continue(250, format!("2.1.5 Recipient <{}> ok", to.address));
                }

                let lookup = self.directory.lookup(&lower).await;

                match lookup {
                    Ok(Some(found)) if found.active => {
                        if let Some(tx) = self.transaction.as_mut() {
                            tx.recipients.push(lower);
                        }
                        SessionReply::Continue(250, format!("2.1.5 Recipient <{}> ok", to.address))
                    }
                    Ok(Some(_)) => SessionReply::Continue(550, RESPONSE_USER_DISABLED.into()),
                    Ok(None) => SessionReply::Continue(550, RESPONSE_USER_NOT_FOUND.into()),
                    Err(err) => {
                        error!(%lower, error = %err, "alias lookup failed during RCPT TO");
                        SessionReply::Continue(451, "4.3.0 Temporary lookup failure".into())
                    }
                }
            }
            Request::Data => self.handle_data_start(),
            Request::Rset => {
                self.transaction = None;
                SessionReply::Continue(250, "2.0.0 Ok".into())
            }
            Request::Noop { value: _ } => SessionReply::Continue(250, "2.0.0 Ok".into()),
            Request::Vrfy { value: _ } => SessionReply::Continue(502, RESPONSE_NO_VRFY.into()),
            Request::Bdat { .. }
            | Request::Expn { .. }
            | Request::Help { .. }
            | Request::Auth { .. }
            | Request::Etrn { .. }
            | Request::Atrn { .. }
            | Request::Burl { .. } => SessionReply::Continue(502, RESPONSE_NOT_IMPLEMENTED.into()),
        }
    }

    fn handle_data_start(&mut self) -> SessionReply {
        match self.transaction.as_ref() {
            None => SessionReply::Continue(503, RESPONSE_BAD_SEQUENCE.into()),
            Some(tx) if tx.recipients.is_empty() => {
                SessionReply::Continue(554, RESPONSE_NO_VALID_RECIPIENTS.into())
            }
            Some(_) => SessionReply::IngestData(354, RESPONSE_START_DATA.into()),
        }
    }

    /// Returns `true` if `size` has already exceeded the configured maximum;
    /// the connection loop calls this while accumulating DATA so it can
    /// bail out early with `552` instead of buffering an oversized message.
    pub fn exceeds_max_size(&self, size: usize) -> bool {
        size > self.max_message_size
    }

    pub fn data_too_large_reply(&mut self) -> (u16, String) {
        self.transaction = None;
        (552, RESPONSE_MESSAGE_TOO_LARGE.to_string())
    }

    /// Hands a fully assembled, dot-unstuffed message body to the
    /// `EmailProcessor`. A step-4 (store) failure surfaces as a temporary
    /// failure so the peer may requeue; this ends the transaction either way.
    pub async fn finish_data(&mut self, raw: Vec<u8>) -> (u16, String) {
        let Some(tx) = self.transaction.take() else {
            return (503, RESPONSE_BAD_SEQUENCE.to_string());
        };

        let queue_id = next_queue_id();
        let data = DataResult {
            bytes: raw,
            queue_id: queue_id.clone(),
            received_at: Utc::now(),
            recipients: tx.recipients,
            mail_from: tx.mail_from,
        };

        match self.processor.process(data, &self.cancel).await {
            Ok(()) => (250, format!("2.6.0 Message queued as {queue_id}")),
            Err(err) => {
                error!(%queue_id, error = %err, "failed to store incoming message");
                (451, "4.3.0 Temporary failure, please try again".to_string())
            }
        }
    }
}

fn unwrap_angle_brackets(address: &str) -> String {
    address.trim().trim_start_matches('<').trim_end_matches('>').to_string()
}

fn multiline_reply(code: u16, lines: &[String]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    for (i, line) in lines.iter().enumerate() {
        let sep = if i + 1 == lines.len() { ' ' } else { '-' };
        buf.extend_from_slice(format!("{code}{sep}{line}\r\n").as_bytes());
    }
    buf
}

/// Lowercase-hex of a monotonically increasing nanosecond-scale counter,
/// seeded from the wall clock at first use.
fn next_queue_id() -> String {
    static COUNTER: OnceLock<AtomicU64> = OnceLock::new();
    let counter = COUNTER.get_or_init(|| {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        AtomicU64::new(seed)
    });

    format!("{:x}", counter.fetch_add(1, Ordering::SeqCst))
}
