//! Framed I/O for the SMTP command channel.
//!
//! Commands are CRLF-terminated lines (a bare LF is tolerated). Replies are
//! serialized into a reusable buffer and flushed one reply at a time. Both
//! directions are bounded by the configured deadlines.

use std::future::Future;
use std::io;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_rustls::TlsAcceptor;

use super::stream::Transport;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::types::Reply;

/// Default buffer size for reading.
const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Framed command channel over a [`Transport`].
#[derive(Debug)]
pub struct Framed {
    reader: BufReader<Transport>,
    write_buffer: BytesMut,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    max_line_length: usize,
}

impl Framed {
    /// Creates a framed channel with the limits from `config`.
    #[must_use]
    pub fn new(transport: Transport, config: &Config) -> Self {
        Self {
            reader: BufReader::with_capacity(DEFAULT_BUFFER_SIZE, transport),
            write_buffer: BytesMut::with_capacity(DEFAULT_BUFFER_SIZE),
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
            max_line_length: config.max_line_length,
        }
    }

    /// Reads one command line without its line terminator.
    ///
    /// Returns `Ok(None)` when the peer closed the connection cleanly.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] when the read deadline expires,
    /// [`Error::LineTooLong`] when the line exceeds the maximum length, and
    /// [`Error::Io`] for transport failures, including a connection closed
    /// in the middle of a line.
    pub async fn read_line(&mut self) -> Result<Option<String>> {
        let limit = self.max_line_length;
        let deadline = self.read_timeout;
        with_deadline(deadline, read_line(&mut self.reader, limit)).await
    }

    /// Serializes and sends one reply.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] when the write deadline expires, or
    /// [`Error::Io`] if the write fails.
    pub async fn write_reply(&mut self, reply: &Reply) -> Result<()> {
        self.write_buffer.clear();
        self.write_buffer.extend_from_slice(&reply.serialize());

        let deadline = self.write_timeout;
        let stream = self.reader.get_mut();
        let buffer = &self.write_buffer;
        with_deadline(deadline, async move {
            stream.write_all(buffer).await?;
            stream.flush().await?;
            Ok(())
        })
        .await
    }

    /// Upgrades the transport to TLS.
    ///
    /// Bytes the peer sent before the handshake and that are still buffered
    /// are discarded. On failure the plaintext transport is restored, unless
    /// the handshake timed out, in which case the transport is gone.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Tls`] when rustls rejects the handshake, otherwise
    /// the transport error.
    pub async fn upgrade(&mut self, acceptor: &TlsAcceptor) -> Result<()> {
        let reader = std::mem::replace(&mut self.reader, BufReader::new(Transport::detached()));
        let transport = reader.into_inner();

        let handshake = async { Ok(transport.upgrade(acceptor).await) };
        match with_deadline(self.read_timeout, handshake).await? {
            Ok(secured) => {
                self.reader = BufReader::with_capacity(DEFAULT_BUFFER_SIZE, secured);
                Ok(())
            }
            Err((err, plain)) => {
                self.reader = BufReader::with_capacity(DEFAULT_BUFFER_SIZE, plain);
                Err(handshake_error(err))
            }
        }
    }

    /// Shuts down the write side of the transport.
    ///
    /// # Errors
    ///
    /// Returns an error if the shutdown fails or exceeds the write deadline.
    pub async fn shutdown(&mut self) -> Result<()> {
        let deadline = self.write_timeout;
        let stream = self.reader.get_mut();
        with_deadline(deadline, async move {
            stream.shutdown().await?;
            Ok(())
        })
        .await
    }

    /// Gets a reference to the transport.
    #[must_use]
    pub fn transport(&self) -> &Transport {
        self.reader.get_ref()
    }

    /// Gets the buffered reader, for streaming message data.
    pub const fn reader_mut(&mut self) -> &mut BufReader<Transport> {
        &mut self.reader
    }
}

async fn with_deadline<T>(
    deadline: Option<Duration>,
    operation: impl Future<Output = Result<T>>,
) -> Result<T> {
    match deadline {
        Some(limit) => tokio::time::timeout(limit, operation)
            .await
            .map_err(|_| Error::Timeout(limit))?,
        None => operation.await,
    }
}

async fn read_line(reader: &mut BufReader<Transport>, max_line_length: usize) -> Result<Option<String>> {
    let mut line = Vec::new();

    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            if line.is_empty() {
                return Ok(None);
            }
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid-line",
            )));
        }

        if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            line.extend_from_slice(&buf[..pos]);
            reader.consume(pos + 1);
            break;
        }

        let len = buf.len();
        line.extend_from_slice(buf);
        reader.consume(len);

        if line.len() > max_line_length {
            return Err(Error::LineTooLong(max_line_length));
        }
    }

    if line.last() == Some(&b'\r') {
        line.pop();
    }
    if line.len() > max_line_length {
        return Err(Error::LineTooLong(max_line_length));
    }

    Ok(Some(String::from_utf8_lossy(&line).into_owned()))
}

/// Unwraps the rustls error tokio-rustls reports inside an I/O error.
fn handshake_error(err: io::Error) -> Error {
    match err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
    {
        Some(tls) => Error::Tls(tls.clone()),
        None => Error::Io(err),
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;
    use crate::types::{EnhancedStatus, ReplyCode};
    use tokio_test::io::Builder;

    fn framed(mock: tokio_test::io::Mock, config: &Config) -> Framed {
        Framed::new(Transport::new(mock, None), config)
    }

    #[tokio::test]
    async fn test_read_simple_line() {
        let mock = Builder::new().read(b"EHLO client.example\r\n").build();
        let mut framed = framed(mock, &Config::default());

        let line = framed.read_line().await.unwrap();
        assert_eq!(line.as_deref(), Some("EHLO client.example"));
        assert!(framed.read_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_split_lines() {
        let mock = Builder::new()
            .read(b"NO")
            .read(b"OP\r\nQUIT\n")
            .build();
        let mut framed = framed(mock, &Config::default());

        assert_eq!(framed.read_line().await.unwrap().as_deref(), Some("NOOP"));
        assert_eq!(framed.read_line().await.unwrap().as_deref(), Some("QUIT"));
    }

    #[tokio::test]
    async fn test_read_line_too_long() {
        let config = Config::builder("localhost").max_line_length(8).build();
        let mock = Builder::new().read(b"0123456789\r\n").build();
        let mut framed = framed(mock, &config);

        let err = framed.read_line().await.unwrap_err();
        assert!(matches!(err, Error::LineTooLong(8)));
    }

    #[tokio::test]
    async fn test_read_eof_mid_line() {
        let mock = Builder::new().read(b"MAIL FROM:").build();
        let mut framed = framed(mock, &Config::default());

        let err = framed.read_line().await.unwrap_err();
        assert!(matches!(err, Error::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_timeout() {
        let config = Config::builder("localhost")
            .read_timeout(Duration::from_secs(30))
            .build();
        let mock = Builder::new().wait(Duration::from_secs(60)).build();
        let mut framed = framed(mock, &config);

        let err = framed.read_line().await.unwrap_err();
        assert!(matches!(err, Error::Timeout(d) if d == Duration::from_secs(30)));
    }

    #[test]
    fn test_handshake_error_unwraps_rustls() {
        let err = io::Error::new(
            io::ErrorKind::InvalidData,
            rustls::Error::General("bad record".into()),
        );
        assert!(matches!(
            handshake_error(err),
            Error::Tls(rustls::Error::General(msg)) if msg == "bad record"
        ));

        let err = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert!(matches!(
            handshake_error(err),
            Error::Io(e) if e.kind() == io::ErrorKind::ConnectionReset
        ));
    }

    #[tokio::test]
    async fn test_write_reply() {
        let mock = Builder::new().write(b"250 2.0.0 Session reset\r\n").build();
        let mut framed = framed(mock, &Config::default());

        let reply = Reply::new(ReplyCode::OK, EnhancedStatus::Derived, "Session reset");
        framed.write_reply(&reply).await.unwrap();
    }
}
