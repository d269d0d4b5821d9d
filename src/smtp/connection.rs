use std::{
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use smtp_proto::Request;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio_rustls::{TlsAcceptor, rustls::ServerConfig};
use tracing::{debug, trace, warn};

use crate::smtp::{
    session::{SessionReply, SmtpSession},
    tls_resolver::log_handshake,
};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to write to connection: {0}")]
    Write(io::Error),
    #[error("failed to read from connection: {0}")]
    Read(io::Error),
    #[error("connection dropped unexpectedly")]
    Dropped,
    #[error("TLS handshake failed: {0}")]
    Tls(io::Error),
}

const BUFFER_SIZE: usize = 8192;
const CODE_READY: u16 = 220;

/// Wraps either a plain transport or a `rustls` server stream behind one
/// `AsyncRead`/`AsyncWrite` surface, so the command loop doesn't need to
/// know whether STARTTLS has happened yet.
enum MaybeTlsStream<IO> {
    Plain(IO),
    Tls(Box<tokio_rustls::server::TlsStream<IO>>),
}

impl<IO: AsyncRead + AsyncWrite + Unpin> AsyncRead for MaybeTlsStream<IO> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(io) => Pin::new(io).poll_read(cx, buf),
            MaybeTlsStream::Tls(io) => Pin::new(io.as_mut()).poll_read(cx, buf),
        }
    }
}

impl<IO: AsyncRead + AsyncWrite + Unpin> AsyncWrite for MaybeTlsStream<IO> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(io) => Pin::new(io).poll_write(cx, buf),
            MaybeTlsStream::Tls(io) => Pin::new(io.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(io) => Pin::new(io).poll_flush(cx),
            MaybeTlsStream::Tls(io) => Pin::new(io.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(io) => Pin::new(io).poll_shutdown(cx),
            MaybeTlsStream::Tls(io) => Pin::new(io.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Drives one SMTP connection end to end: greeting, command loop,
/// STARTTLS upgrade, and DATA ingestion with dot-unstuffing. Generic over
/// the transport so tests can drive it over an in-memory duplex pipe
/// instead of a real socket. `tls_config` is `None` when the listener
/// itself has no certificate available for this connection.
pub async fn handle<IO>(io: IO, mut session: SmtpSession, tls_config: Option<Arc<ServerConfig>>) -> Result<(), ConnectionError>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut reader = BufReader::new(MaybeTlsStream::Plain(io));
    let mut buffer = Vec::with_capacity(BUFFER_SIZE);

    trace!(peer = %session.peer(), "handling connection");

    write_reply(CODE_READY, &format!("{} ESMTP ready", session.hostname()), &mut reader).await?;

    'session: loop {
        match read_line(&mut reader, &mut buffer).await {
            Ok(_) => {}
            Err(ConnectionError::Dropped) => return Ok(()),
            Err(err) => return Err(err),
        }

        let request = Request::parse(&mut buffer.iter());

        match session.handle(request).await {
            SessionReply::Continue(code, message) => {
                write_reply(code, &message, &mut reader).await?;
            }
            SessionReply::Raw(bytes) => {
                reader.write_all(&bytes).await.map_err(ConnectionError::Write)?;
            }
            SessionReply::Stop(code, message) => {
                write_reply(code, &message, &mut reader).await?;
                break 'session;
            }
            SessionReply::StartTls(code, message) => {
                write_reply(code, &message, &mut reader).await?;

                let Some(config) = tls_config.clone() else {
                    continue 'session;
                };

                let plain = match reader.into_inner() {
                    MaybeTlsStream::Plain(io) => io,
                    MaybeTlsStream::Tls(_) => unreachable!("STARTTLS offered only before any upgrade"),
                };

                let acceptor = TlsAcceptor::from(config);
                let tls_stream = match acceptor.accept(plain).await {
                    Ok(stream) => stream,
                    Err(err) => {
                        warn!(peer = %session.peer(), error = %err, "TLS handshake failed");
                        return Err(ConnectionError::Tls(err));
                    }
                };

                log_handshake(&tls_stream);
                session.mark_tls_upgraded();
                reader = BufReader::new(MaybeTlsStream::Tls(Box::new(tls_stream)));
            }
            SessionReply::IngestData(code, message) => {
                write_reply(code, &message, &mut reader).await?;

                let (code, message) = ingest_data(&mut reader, &mut session).await?;
                write_reply(code, &message, &mut reader).await?;
            }
        }
    }

    debug!(peer = %session.peer(), "connection handled");

    Ok(())
}

/// Reads the DATA body line by line until the bare `.` terminator,
/// removing exactly one leading `.` from any stuffed line, and bails out
/// early (but keeps draining to the terminator) once the configured
/// maximum message size is exceeded.
async fn ingest_data<IO>(reader: &mut BufReader<MaybeTlsStream<IO>>, session: &mut SmtpSession) -> Result<(u16, String), ConnectionError>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let mut body = Vec::new();
    let mut too_large = false;
    let mut line = Vec::with_capacity(512);

    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line).await.map_err(ConnectionError::Read)?;
        if n == 0 {
            return Err(ConnectionError::Dropped);
        }

        if line == b".\r\n" || line == b".\n" {
            break;
        }

        let unstuffed: &[u8] = if line.first() == Some(&b'.') { &line[1..] } else { &line };

        if too_large {
            continue;
        }

        if session.exceeds_max_size(body.len() + unstuffed.len()) {
            too_large = true;
            body.clear();
            continue;
        }

        body.extend_from_slice(unstuffed);
    }

    if too_large {
        return Ok(session.data_too_large_reply());
    }

    Ok(session.finish_data(body).await)
}

async fn read_line(reader: impl AsyncBufReadExt + Unpin, buffer: &mut Vec<u8>) -> Result<usize, ConnectionError> {
    buffer.clear();

    reader
        .take(BUFFER_SIZE as u64)
        .read_until(b'\n', buffer)
        .await
        .map_err(ConnectionError::Read)
        .and_then(|size| if size > 0 { Ok(size) } else { Err(ConnectionError::Dropped) })
}

async fn write_reply(code: u16, message: &str, mut sink: impl AsyncWriteExt + Unpin) -> Result<(), ConnectionError> {
    let n = sink
        .write(format!("{code} {message}\r\n").as_bytes())
        .await
        .map_err(ConnectionError::Write)?;

    if n < 256 {
        trace!("sent: {} {}", code, message);
    }

    Ok(())
}
